//! Verification of files the user moves into the session directory directly.
//!
//! Such entries have no remote locator; their `lfn` may encode an expected
//! size and/or SHA-256 as `[size][.sha256]`, or `*.*` to never wait.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::checksum;
use crate::file_list::{FileEntry, JobFileStore};
use crate::job::Job;
use crate::session::session_path;

/// Fixed time allowed for user uploads, counted from the job's start time.
pub const USER_FILE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFileStatus {
    Present,
    /// Not there yet (or incomplete); poll again.
    Missing,
    /// Hard failure with the reason.
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCheck {
    /// Every user file is in place.
    Done,
    /// A file is invalid or the wait timed out; failures were added to the job.
    Failed,
    /// Some files are still missing.
    Pending,
}

struct Expectation {
    size: Option<u64>,
    sha256: Option<String>,
}

fn parse_expectation(info: &str) -> Result<Expectation, String> {
    let valid_sum = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    if let Some(sum) = info.strip_prefix('.') {
        if !valid_sum(sum) {
            return Err("Invalid checksum information".into());
        }
        return Ok(Expectation {
            size: None,
            sha256: Some(sum.to_ascii_lowercase()),
        });
    }
    let parts: Vec<&str> = info.split('.').collect();
    let size = parts[0]
        .parse::<u64>()
        .map_err(|_| "Invalid file size information".to_string())?;
    match parts.len() {
        1 => Ok(Expectation {
            size: Some(size),
            sha256: None,
        }),
        2 if valid_sum(parts[1]) => Ok(Expectation {
            size: Some(size),
            sha256: Some(parts[1].to_ascii_lowercase()),
        }),
        2 => Err("Invalid checksum information".into()),
        _ => Err("Invalid size/checksum information".into()),
    }
}

/// Check one user file. `uploaded` is the upload-completion list when the job has one;
/// it replaces checksum computation.
pub fn user_file_exists(
    entry: &FileEntry,
    session_dir: &Path,
    uploaded: Option<&[String]>,
) -> UserFileStatus {
    if entry.lfn == "*.*" {
        return UserFileStatus::Present;
    }
    let path = session_path(session_dir, &entry.pfn);
    let Ok(meta) = fs::symlink_metadata(&path) else {
        return UserFileStatus::Missing;
    };
    let confirmed = |list: &[String]| list.iter().any(|p| p == &entry.pfn);

    if entry.lfn.is_empty() {
        return match uploaded {
            Some(list) if !confirmed(list) => UserFileStatus::Missing,
            _ => UserFileStatus::Present,
        };
    }
    if meta.is_dir() {
        return UserFileStatus::Invalid("Expected file. Directory found.".into());
    }
    if !meta.is_file() {
        return UserFileStatus::Invalid("Expected ordinary file. Special object found.".into());
    }
    let expect = match parse_expectation(&entry.lfn) {
        Ok(e) => e,
        Err(reason) => {
            tracing::error!(pfn = %entry.pfn, "bad size/checksum information {:?}", entry.lfn);
            return UserFileStatus::Invalid(reason);
        }
    };

    if let Some(size) = expect.size {
        if meta.len() < size {
            return UserFileStatus::Missing;
        }
        if meta.len() > size {
            return UserFileStatus::Invalid("Delivered file is bigger than specified.".into());
        }
    }

    match (uploaded, &expect.sha256) {
        (Some(list), _) if !confirmed(list) => UserFileStatus::Missing,
        (Some(_), _) | (None, None) => UserFileStatus::Present,
        (None, Some(expected)) => match checksum::sha256_path(&path) {
            Err(_) => UserFileStatus::Invalid("Delivered file is unreadable.".into()),
            Ok(actual) if &actual == expected => {
                tracing::debug!(pfn = %entry.pfn, "checksum {} verified", actual);
                UserFileStatus::Present
            }
            // With a matching size the upload is complete, so the content is wrong.
            Ok(_) if expect.size.is_some() => {
                UserFileStatus::Invalid("Delivered file has wrong checksum.".into())
            }
            Ok(_) => UserFileStatus::Missing,
        },
    }
}

/// Run the user-file check for a job at `now`.
pub fn check_uploaded_files_at(store: &dyn JobFileStore, job: &mut Job, now: SystemTime) -> UploadCheck {
    let mut inputs = match store.read_input(&job.id) {
        Ok(files) => files,
        Err(e) => {
            tracing::error!(job_id = %job.id, "can't read list of input files: {:#}", e);
            job.add_failure("Error reading list of input files");
            return UploadCheck::Failed;
        }
    };
    let uploaded = match store.read_input_status(&job.id) {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(job_id = %job.id, "can't read input status list: {:#}", e);
            None
        }
    };

    let mut result = UploadCheck::Done;
    let mut i = 0;
    while i < inputs.len() {
        let entry = &inputs[i];
        if entry.is_remote() {
            i += 1;
            continue;
        }
        match user_file_exists(entry, &job.session_dir, uploaded.as_deref()) {
            UserFileStatus::Present => {
                tracing::debug!(job_id = %job.id, pfn = %entry.pfn, "user has uploaded file");
                inputs.remove(i);
                if let Err(e) = store.write_input(&job.id, &inputs) {
                    tracing::warn!(job_id = %job.id, "failed writing changed input file: {:#}", e);
                }
            }
            UserFileStatus::Invalid(reason) => {
                tracing::error!(job_id = %job.id, pfn = %entry.pfn, "critical error for uploadable file: {}", reason);
                job.add_failure(format!("User file: {} - {}", entry.pfn, reason));
                return UploadCheck::Failed;
            }
            UserFileStatus::Missing => {
                result = UploadCheck::Pending;
                i += 1;
            }
        }
    }

    let waited = now.duration_since(job.start_time).unwrap_or_default();
    if result == UploadCheck::Pending && waited > USER_FILE_TIMEOUT {
        for entry in inputs.iter().filter(|e| !e.is_remote()) {
            job.add_failure(format!("User file: {} - Timeout waiting", entry.pfn));
        }
        tracing::error!(job_id = %job.id, "uploadable files timed out");
        return UploadCheck::Failed;
    }
    result
}

pub fn check_uploaded_files(store: &dyn JobFileStore, job: &mut Job) -> UploadCheck {
    check_uploaded_files_at(store, job, SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_list::ControlDir;
    use crate::job::{JobState, LocalUser};

    const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn entry(pfn: &str, lfn: &str) -> FileEntry {
        FileEntry::new(pfn, lfn)
    }

    #[test]
    fn wildcard_never_waits() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            user_file_exists(&entry("/absent", "*.*"), dir.path(), None),
            UserFileStatus::Present
        );
    }

    #[test]
    fn missing_and_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            user_file_exists(&entry("/f", ""), dir.path(), None),
            UserFileStatus::Missing
        );
        fs::write(dir.path().join("f"), b"hello\n").unwrap();
        assert_eq!(
            user_file_exists(&entry("/f", ""), dir.path(), None),
            UserFileStatus::Present
        );
        let status_list = vec!["/other".to_string()];
        assert_eq!(
            user_file_exists(&entry("/f", ""), dir.path(), Some(&status_list)),
            UserFileStatus::Missing
        );
    }

    #[test]
    fn size_bounds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello\n").unwrap();
        assert_eq!(
            user_file_exists(&entry("/f", "6"), dir.path(), None),
            UserFileStatus::Present
        );
        assert_eq!(
            user_file_exists(&entry("/f", "10"), dir.path(), None),
            UserFileStatus::Missing
        );
        assert_eq!(
            user_file_exists(&entry("/f", "3"), dir.path(), None),
            UserFileStatus::Invalid("Delivered file is bigger than specified.".into())
        );
        assert_eq!(
            user_file_exists(&entry("/f", "abc"), dir.path(), None),
            UserFileStatus::Invalid("Invalid file size information".into())
        );
    }

    #[test]
    fn checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello\n").unwrap();
        assert_eq!(
            user_file_exists(&entry("/f", &format!("6.{}", HELLO_SHA)), dir.path(), None),
            UserFileStatus::Present
        );
        assert_eq!(
            user_file_exists(&entry("/f", &format!(".{}", HELLO_SHA)), dir.path(), None),
            UserFileStatus::Present
        );
        assert_eq!(
            user_file_exists(&entry("/f", "6.00ff"), dir.path(), None),
            UserFileStatus::Invalid("Delivered file has wrong checksum.".into())
        );
        // Without a size a mismatch may be an upload in progress.
        assert_eq!(
            user_file_exists(&entry("/f", ".00ff"), dir.path(), None),
            UserFileStatus::Missing
        );
        assert_eq!(
            user_file_exists(&entry("/f", "6.zz"), dir.path(), None),
            UserFileStatus::Invalid("Invalid checksum information".into())
        );
        assert_eq!(
            user_file_exists(&entry("/f", "6.ab.cd"), dir.path(), None),
            UserFileStatus::Invalid("Invalid size/checksum information".into())
        );
    }

    #[test]
    fn directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        assert_eq!(
            user_file_exists(&entry("/d", "10"), dir.path(), None),
            UserFileStatus::Invalid("Expected file. Directory found.".into())
        );
    }

    #[test]
    fn status_list_replaces_checksum() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello\n").unwrap();
        let confirmed = vec!["/f".to_string()];
        assert_eq!(
            user_file_exists(&entry("/f", "6.00ff"), dir.path(), Some(&confirmed)),
            UserFileStatus::Present
        );
    }

    fn job_with_inputs(dir: &Path, inputs: &str) -> (ControlDir, Job) {
        let control = dir.join("control");
        let session = dir.join("session");
        fs::create_dir_all(&control).unwrap();
        fs::create_dir_all(&session).unwrap();
        let store = ControlDir::new(&control);
        let job = Job::new("J5", LocalUser::new(1, 1, "u"), &session, JobState::Preparing);
        fs::write(store.job_file(&job.id, "input"), inputs).unwrap();
        (store, job)
    }

    #[test]
    fn confirmed_files_leave_the_input_list() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut job) = job_with_inputs(dir.path(), "/a 6\n/b\n/c http://host/c\n");
        fs::write(job.session_dir.join("a"), b"hello\n").unwrap();
        assert_eq!(check_uploaded_files(&store, &mut job), UploadCheck::Pending);
        assert_eq!(
            store.read_input(&job.id).unwrap(),
            vec![entry("/b", ""), entry("/c", "http://host/c")]
        );
        fs::write(job.session_dir.join("b"), b"").unwrap();
        assert_eq!(check_uploaded_files(&store, &mut job), UploadCheck::Done);
        assert!(job.failures().is_empty());
    }

    #[test]
    fn invalid_file_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut job) = job_with_inputs(dir.path(), "/a 2\n");
        fs::write(job.session_dir.join("a"), b"hello\n").unwrap();
        assert_eq!(check_uploaded_files(&store, &mut job), UploadCheck::Failed);
        assert_eq!(
            job.failures(),
            ["User file: /a - Delivered file is bigger than specified.".to_string()]
        );
    }

    #[test]
    fn waiting_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut job) = job_with_inputs(dir.path(), "/a\n/b 10\n");
        let later = job.start_time + USER_FILE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(
            check_uploaded_files_at(&store, &mut job.clone(), job.start_time),
            UploadCheck::Pending
        );
        assert_eq!(check_uploaded_files_at(&store, &mut job, later), UploadCheck::Failed);
        assert_eq!(
            job.failures(),
            [
                "User file: /a - Timeout waiting".to_string(),
                "User file: /b - Timeout waiting".to_string()
            ]
        );
    }

    #[test]
    fn unreadable_input_list_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlDir::new(dir.path());
        let mut job = Job::new("J6", LocalUser::new(1, 1, "u"), dir.path(), JobState::Preparing);
        assert_eq!(check_uploaded_files(&store, &mut job), UploadCheck::Failed);
        assert_eq!(job.failures(), ["Error reading list of input files".to_string()]);
    }
}
