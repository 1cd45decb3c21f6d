//! DTR generator: turns staging jobs into DTRs and folds finished DTRs back
//! into per-job results.
//!
//! The generator owns no transfer logic. A job handed over with
//! [`Generator::receive_job`] is translated into one DTR per remote file-list
//! entry and submitted to the [`Scheduler`]. Each DTR the scheduler hands back
//! updates the job's file lists and statistics; once the last one is back the
//! job's result lands in the finished index and the job manager is woken with
//! the job id on the [`WakeupReceiver`].

mod reconcile;
mod stats;
mod translate;
pub mod userfiles;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::cache::{CacheConfig, FileCache};
use crate::config::StagingConfig;
use crate::dtr::{Dtr, DtrId};
use crate::file_list::JobFileStore;
use crate::job::{Job, JobId};
use crate::scheduler::{Rejected, Scheduler, SchedulerEvents};
use crate::share::TransferShares;

pub use userfiles::{user_file_exists, UploadCheck, UserFileStatus, USER_FILE_TIMEOUT};

/// Longest time one pass spends translating pending jobs.
const JOB_TIME_BOX: Duration = Duration::from_secs(30);

/// Job ids whose staging result is ready.
pub struct WakeupReceiver {
    rx: mpsc::UnboundedReceiver<JobId>,
}

impl WakeupReceiver {
    pub async fn recv(&mut self) -> Option<JobId> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<JobId> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct GeneratorState {
    pending: Vec<Job>,
    cancelled: Vec<JobId>,
    received: Vec<Dtr>,
    /// Jobs with DTRs in the scheduler, and the ids still outstanding.
    active: HashMap<JobId, HashSet<DtrId>>,
    /// Session directory of each active job.
    sessions: HashMap<JobId, PathBuf>,
    /// Accumulated error text; empty means success.
    finished: HashMap<JobId, String>,
}

struct Inner {
    state: Mutex<GeneratorState>,
    /// Destinations interrupted by a previous run; consumed during translation.
    recovered: Mutex<Vec<String>>,
    notify: Notify,
    stopping: AtomicBool,
    scheduler: Scheduler,
    store: Arc<dyn JobFileStore>,
    cache: Arc<dyn FileCache>,
    cache_config: CacheConfig,
    shares: TransferShares,
    max_retries: u32,
    poll_interval: Duration,
    wakeup: mpsc::UnboundedSender<JobId>,
}

pub struct Generator {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Generator {
    /// Start the processing task. Must be called inside a tokio runtime.
    pub fn start(
        config: &StagingConfig,
        scheduler: Scheduler,
        events: SchedulerEvents,
        store: Arc<dyn JobFileStore>,
        cache: Arc<dyn FileCache>,
    ) -> (Generator, WakeupReceiver) {
        let (wakeup, rx) = mpsc::unbounded_channel();
        let recovered = scheduler.interrupted_destinations().to_vec();
        let inner = Arc::new(Inner {
            state: Mutex::new(GeneratorState::default()),
            recovered: Mutex::new(recovered),
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
            scheduler,
            store,
            cache,
            cache_config: config.cache.clone(),
            shares: TransferShares::from_config(&config.share),
            max_retries: config.max_retries,
            poll_interval: config.poll_interval(),
            wakeup,
        });
        let task = tokio::spawn(run(Arc::clone(&inner), events));
        tracing::info!("generator started");
        (
            Generator {
                inner,
                task: Mutex::new(Some(task)),
            },
            WakeupReceiver { rx },
        )
    }

    /// Queue a job for staging. The job must be in PREPARING or FINISHING.
    /// Returns false, dropping the job, once the generator is stopping.
    pub fn receive_job(&self, job: Job) -> bool {
        let mut st = self.inner.state();
        if self.inner.stopping.load(Ordering::SeqCst) {
            tracing::warn!(job_id = %job.id, "generator is stopping, job not accepted");
            return false;
        }
        tracing::debug!(job_id = %job.id, state = job.state.name(), "received job");
        st.pending.push(job);
        drop(st);
        self.inner.notify.notify_one();
        true
    }

    /// Hand a finished DTR to the generator.
    pub fn receive_dtr(&self, dtr: Dtr) {
        self.inner.receive_dtr(dtr);
    }

    pub fn cancel_job(&self, job_id: &JobId) {
        tracing::info!(job_id = %job_id, "cancel requested");
        self.inner.state().cancelled.push(job_id.clone());
        self.inner.notify.notify_one();
    }

    /// True when staging of the job is over. A failure is added to the job
    /// the first time this reports it.
    pub fn query_job_finished(&self, job: &mut Job) -> bool {
        let mut st = self.inner.state();
        if st.pending.iter().any(|j| j.id == job.id) || st.active.contains_key(&job.id) {
            return false;
        }
        if let Some(error) = st.finished.get_mut(&job.id) {
            if !error.is_empty() {
                job.add_failure(std::mem::take(error));
            }
        }
        true
    }

    pub fn has_job(&self, job_id: &JobId) -> bool {
        let st = self.inner.state();
        st.pending.iter().any(|j| &j.id == job_id)
            || st.active.contains_key(job_id)
            || st.finished.contains_key(job_id)
    }

    /// Forget a finished job. Jobs still pending or in progress are kept.
    pub fn remove_job(&self, job_id: &JobId) {
        let mut st = self.inner.state();
        if st.pending.iter().any(|j| &j.id == job_id) {
            tracing::warn!(job_id = %job_id, "cannot remove job, it is still pending");
            return;
        }
        if st.active.contains_key(job_id) {
            tracing::warn!(job_id = %job_id, "cannot remove job, transfers are in progress");
            return;
        }
        if st.finished.remove(job_id).is_none() {
            tracing::warn!(job_id = %job_id, "cannot remove job, it is unknown");
        }
    }

    /// Check files the user uploads into the session directory.
    pub fn check_uploaded_files(&self, job: &mut Job) -> UploadCheck {
        userfiles::check_uploaded_files(self.inner.store.as_ref(), job)
    }

    /// Stop the scheduler, reconcile every DTR it hands back, and end the processing task.
    pub async fn stop(&self) {
        {
            // Set under the state lock: no job enters the pending list after this.
            let _st = self.inner.state();
            self.inner.stopping.store(true, Ordering::SeqCst);
        }
        self.inner.notify.notify_one();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("generator task failed: {}", e);
            }
        }
    }
}

async fn run(inner: Arc<Inner>, mut events: SchedulerEvents) {
    let mut events_open = true;
    loop {
        while let Some(dtr) = events.try_recv() {
            inner.receive_dtr(dtr);
        }
        let pass = Arc::clone(&inner);
        if let Err(e) = tokio::task::spawn_blocking(move || pass.process_pass()).await {
            tracing::error!("generator pass failed: {}", e);
        }
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            ev = events.recv(), if events_open => match ev {
                Some(dtr) => inner.receive_dtr(dtr),
                None => events_open = false,
            },
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(inner.poll_interval) => {}
        }
    }

    tracing::info!("generator stopping, stopping scheduler");
    inner.scheduler.stop().await;
    while let Some(dtr) = events.recv().await {
        inner.receive_dtr(dtr);
    }
    let pass = Arc::clone(&inner);
    if let Err(e) = tokio::task::spawn_blocking(move || pass.process_received()).await {
        tracing::error!("generator final pass failed: {}", e);
    }
    tracing::info!("generator stopped");
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, GeneratorState> {
        self.state.lock().expect("generator state lock poisoned")
    }

    fn receive_dtr(&self, dtr: Dtr) {
        tracing::debug!(dtr_id = %dtr.id, job_id = %dtr.job_id, status = %dtr.status, "received DTR");
        self.state().received.push(dtr);
        self.notify.notify_one();
    }

    fn wake(&self, job_id: &JobId) {
        let _ = self.wakeup.send(job_id.clone());
    }

    /// One coordination pass: cancellations, then received DTRs, then pending jobs.
    fn process_pass(&self) {
        self.process_cancellations();
        self.process_received();
        self.process_pending();
    }

    fn process_cancellations(&self) {
        let cancelled = std::mem::take(&mut self.state().cancelled);
        for job_id in cancelled {
            let mut st = self.state();
            if let Some(pos) = st.pending.iter().position(|j| j.id == job_id) {
                st.pending.remove(pos);
                st.finished.insert(job_id.clone(), String::new());
                drop(st);
                tracing::info!(job_id = %job_id, "cancelled job before any transfer started");
                self.wake(&job_id);
            } else if st.active.contains_key(&job_id) {
                drop(st);
                self.scheduler.cancel(&job_id);
            } else {
                tracing::debug!(job_id = %job_id, "cancelled job is not staging");
            }
        }
    }

    fn process_received(&self) {
        let received = std::mem::take(&mut self.state().received);
        for dtr in received {
            self.reconcile(dtr);
        }
    }

    fn process_pending(&self) {
        let mut jobs = self.state().pending.clone();
        if jobs.is_empty() {
            return;
        }
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
        let started = Instant::now();
        for job in jobs {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.process_job(job);
            if started.elapsed() > JOB_TIME_BOX {
                tracing::debug!("job processing time box exceeded, continuing next pass");
                break;
            }
        }
    }

    fn process_job(&self, job: Job) {
        let job_id = job.id.clone();
        let dtrs = match self.translate(&job) {
            Ok(dtrs) => dtrs,
            Err(msg) => {
                tracing::error!(job_id = %job_id, "{}", msg);
                self.finish_pending(&job_id, msg);
                return;
            }
        };
        if dtrs.is_empty() {
            tracing::info!(job_id = %job_id, "no remote files to stage");
            if !job.is_staging_in() {
                self.release_cache(&job_id, &self.cache_config.substitute(&job.user));
            }
            self.finish_pending(&job_id, String::new());
            return;
        }

        let share = dtrs[0].transfer_share.clone();
        {
            let mut st = self.state();
            st.pending.retain(|j| j.id != job_id);
            st.active
                .insert(job_id.clone(), dtrs.iter().map(|d| d.id).collect());
            st.sessions.insert(job_id.clone(), job.session_dir.clone());
        }
        tracing::info!(job_id = %job_id, count = dtrs.len(), share = %share, "submitting DTRs");
        for dtr in dtrs {
            if let Err(Rejected(dtr)) = self.scheduler.submit(dtr) {
                self.state().received.push(*dtr);
            }
        }
        self.persist_share(&job_id, &share);
    }

    fn finish_pending(&self, job_id: &JobId, error: String) {
        {
            let mut st = self.state();
            st.pending.retain(|j| &j.id != job_id);
            st.finished.insert(job_id.clone(), error);
        }
        self.wake(job_id);
    }

    fn persist_share(&self, job_id: &JobId, share: &str) {
        let mut local = match self.store.read_local(job_id) {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "failed reading local job information: {:#}", e);
                return;
            }
        };
        local.transfer_share = Some(share.to_string());
        if let Err(e) = self.store.write_local(job_id, &local) {
            tracing::warn!(job_id = %job_id, "failed writing local job information: {:#}", e);
        }
    }

    fn release_cache(&self, job_id: &JobId, params: &crate::cache::CacheParameters) {
        if let Err(e) = self.cache.release(job_id, params) {
            tracing::warn!(job_id = %job_id, "failed to release cache: {:#}", e);
        }
    }
}
