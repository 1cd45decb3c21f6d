//! Control-directory store for per-job file lists and local metadata.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{format_line, read_list, write_list, FileEntry};
use crate::job::JobId;

/// Job metadata kept next to the file lists (`job.<id>.local`).
///
/// Only the fields data staging uses are typed; the rest of the job manager's
/// record is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLocal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_share: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Read/write contract for the job manager's file-list stores.
pub trait JobFileStore: Send + Sync {
    fn read_input(&self, job: &JobId) -> Result<Vec<FileEntry>>;
    fn write_input(&self, job: &JobId, files: &[FileEntry]) -> Result<()>;
    fn read_output(&self, job: &JobId) -> Result<Vec<FileEntry>>;
    fn write_output(&self, job: &JobId, files: &[FileEntry]) -> Result<()>;
    /// Pfns the user has confirmed as uploaded; `None` when no status list exists.
    fn read_input_status(&self, job: &JobId) -> Result<Option<Vec<String>>>;
    /// Record an output entry that was successfully uploaded.
    fn add_output_status(&self, job: &JobId, entry: &FileEntry) -> Result<()>;
    /// Read a dynamic list file (absolute path inside the session dir).
    fn read_dynamic(&self, path: &Path) -> Result<Vec<FileEntry>>;
    fn write_dynamic(&self, path: &Path, files: &[FileEntry]) -> Result<()>;
    fn read_local(&self, job: &JobId) -> Result<JobLocal>;
    fn write_local(&self, job: &JobId, local: &JobLocal) -> Result<()>;
    fn statistics_path(&self, job: &JobId) -> PathBuf;
    fn proxy_path(&self, job: &JobId) -> PathBuf;
}

/// File-backed store: `job.<id>.<suffix>` files in one control directory.
#[derive(Debug, Clone)]
pub struct ControlDir {
    root: PathBuf,
}

impl ControlDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_file(&self, job: &JobId, suffix: &str) -> PathBuf {
        self.root.join(format!("job.{}.{}", job, suffix))
    }
}

impl JobFileStore for ControlDir {
    fn read_input(&self, job: &JobId) -> Result<Vec<FileEntry>> {
        read_list(&self.job_file(job, "input"))
    }

    fn write_input(&self, job: &JobId, files: &[FileEntry]) -> Result<()> {
        write_list(&self.job_file(job, "input"), files)
    }

    fn read_output(&self, job: &JobId) -> Result<Vec<FileEntry>> {
        read_list(&self.job_file(job, "output"))
    }

    fn write_output(&self, job: &JobId, files: &[FileEntry]) -> Result<()> {
        write_list(&self.job_file(job, "output"), files)
    }

    fn read_input_status(&self, job: &JobId) -> Result<Option<Vec<String>>> {
        let path = self.job_file(job, "input_status");
        if !path.exists() {
            return Ok(None);
        }
        let pfns = read_list(&path)?.into_iter().map(|e| e.pfn).collect();
        Ok(Some(pfns))
    }

    fn add_output_status(&self, job: &JobId, entry: &FileEntry) -> Result<()> {
        let path = self.job_file(job, "output_status");
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(f, "{}", format_line(entry))?;
        Ok(())
    }

    fn read_dynamic(&self, path: &Path) -> Result<Vec<FileEntry>> {
        read_list(path)
    }

    fn write_dynamic(&self, path: &Path, files: &[FileEntry]) -> Result<()> {
        write_list(path, files)
    }

    fn read_local(&self, job: &JobId) -> Result<JobLocal> {
        let path = self.job_file(job, "local");
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read job local info: {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parse job local info: {}", path.display()))
    }

    fn write_local(&self, job: &JobId, local: &JobLocal) -> Result<()> {
        let path = self.job_file(job, "local");
        let json = serde_json::to_string_pretty(local)?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))
    }

    fn statistics_path(&self, job: &JobId) -> PathBuf {
        self.job_file(job, "statistics")
    }

    fn proxy_path(&self, job: &JobId) -> PathBuf {
        self.job_file(job, "proxy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_dir_paths() {
        let store = ControlDir::new("/var/spool/dstage");
        let id = JobId::new("J1");
        assert_eq!(
            store.statistics_path(&id),
            PathBuf::from("/var/spool/dstage/job.J1.statistics")
        );
        assert_eq!(
            store.proxy_path(&id),
            PathBuf::from("/var/spool/dstage/job.J1.proxy")
        );
    }

    #[test]
    fn missing_input_status_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlDir::new(dir.path());
        let id = JobId::new("J1");
        assert!(store.read_input_status(&id).unwrap().is_none());
        fs::write(store.job_file(&id, "input_status"), "/a\n/b\n").unwrap();
        assert_eq!(
            store.read_input_status(&id).unwrap(),
            Some(vec!["/a".to_string(), "/b".to_string()])
        );
    }

    #[test]
    fn output_status_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlDir::new(dir.path());
        let id = JobId::new("J1");
        store
            .add_output_status(&id, &FileEntry::new("/out1", "gsiftp://se/out1"))
            .unwrap();
        store
            .add_output_status(&id, &FileEntry::new("/out2", "gsiftp://se/out2"))
            .unwrap();
        let text = fs::read_to_string(store.job_file(&id, "output_status")).unwrap();
        assert_eq!(text, "/out1 gsiftp://se/out1\n/out2 gsiftp://se/out2\n");
    }

    #[test]
    fn local_info_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlDir::new(dir.path());
        let id = JobId::new("J7");
        fs::write(
            store.job_file(&id, "local"),
            r#"{"session_dir":"/ws/J7","queue":"short"}"#,
        )
        .unwrap();
        let mut local = store.read_local(&id).unwrap();
        assert_eq!(local.session_dir, Some(PathBuf::from("/ws/J7")));
        local.transfer_share = Some("_default-download".into());
        store.write_local(&id, &local).unwrap();
        let again = store.read_local(&id).unwrap();
        assert_eq!(again.transfer_share.as_deref(), Some("_default-download"));
        assert_eq!(again.extra.get("queue"), Some(&serde_json::json!("short")));
    }
}
