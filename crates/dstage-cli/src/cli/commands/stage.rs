//! `dstage stage`: run scheduler and generator for one job.

use anyhow::{Context, Result};
use dstage_core::cache::JobLinkCache;
use dstage_core::config::StagingConfig;
use dstage_core::delivery::LocalDelivery;
use dstage_core::file_list::{ControlDir, JobFileStore, JobLocal};
use dstage_core::generator::Generator;
use dstage_core::job::{Job, JobState};
use dstage_core::scheduler::Scheduler;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::session_user;

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: String,
    pub session_dir: PathBuf,
    pub staging_in: bool,
    pub priority: i32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

pub async fn run_stage(cfg: &StagingConfig, req: StageRequest) -> Result<()> {
    fs::create_dir_all(&cfg.control_dir)
        .with_context(|| format!("create control dir: {}", cfg.control_dir.display()))?;
    let session_dir = fs::canonicalize(&req.session_dir)
        .with_context(|| format!("session dir: {}", req.session_dir.display()))?;

    let store = Arc::new(ControlDir::new(&cfg.control_dir));
    let state = if req.staging_in {
        JobState::Preparing
    } else {
        JobState::Finishing
    };
    let mut job = Job::new(
        req.job_id,
        session_user(&session_dir, req.uid, req.gid),
        &session_dir,
        state,
    )
    .with_priority(req.priority);

    if store.read_local(&job.id).is_err() {
        let local = JobLocal {
            session_dir: Some(session_dir.clone()),
            ..JobLocal::default()
        };
        store.write_local(&job.id, &local)?;
    }

    let (scheduler, events) =
        Scheduler::start(cfg, Arc::new(LocalDelivery::new()), Arc::new(JobLinkCache))?;
    let (generator, mut wakeups) =
        Generator::start(cfg, scheduler, events, store, Arc::new(JobLinkCache));

    tracing::info!(job_id = %job.id, state = job.state.name(), "staging job");
    if !generator.receive_job(job.clone()) {
        generator.stop().await;
        anyhow::bail!("staging engine is stopping, job {} not accepted", job.id);
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            woken = wakeups.recv() => match woken {
                Some(id) if id == job.id => break,
                Some(_) => continue,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                println!("Interrupted, cancelling job {}...", job.id);
                interrupted = true;
                generator.cancel_job(&job.id);
            }
        }
    }

    let finished = generator.query_job_finished(&mut job);
    generator.remove_job(&job.id);
    generator.stop().await;

    if !finished {
        anyhow::bail!("job {} did not finish staging", job.id);
    }
    if !job.failures().is_empty() {
        for failure in job.failures() {
            println!("{}", failure.trim_end());
        }
        anyhow::bail!("data staging failed for job {}", job.id);
    }
    if interrupted {
        anyhow::bail!("data staging of job {} was cancelled", job.id);
    }
    println!("Data staging of job {} finished.", job.id);
    Ok(())
}
