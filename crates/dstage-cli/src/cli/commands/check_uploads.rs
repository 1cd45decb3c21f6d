//! `dstage check-uploads`: verify user-uploaded input files once.

use anyhow::Result;
use dstage_core::config::StagingConfig;
use dstage_core::file_list::ControlDir;
use dstage_core::generator::userfiles::check_uploaded_files_at;
use dstage_core::generator::UploadCheck;
use dstage_core::job::{Job, JobState};
use std::path::Path;
use std::time::{Duration, SystemTime};

use super::session_user;

pub fn run_check_uploads(
    cfg: &StagingConfig,
    job_id: &str,
    session_dir: &Path,
    started_ago: Duration,
) -> Result<()> {
    let store = ControlDir::new(&cfg.control_dir);
    let now = SystemTime::now();
    let mut job = Job::new(
        job_id,
        session_user(session_dir, None, None),
        session_dir,
        JobState::Preparing,
    );
    job.start_time = now.checked_sub(started_ago).unwrap_or(job.start_time);

    match check_uploaded_files_at(&store, &mut job, now) {
        UploadCheck::Done => println!("All user files of job {} are in place.", job.id),
        UploadCheck::Pending => println!("Job {} is still waiting for user files.", job.id),
        UploadCheck::Failed => {
            for failure in job.failures() {
                println!("{}", failure);
            }
            anyhow::bail!("user file check failed for job {}", job.id);
        }
    }
    Ok(())
}
