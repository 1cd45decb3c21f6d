//! Dispatch task: owns every waiting and running DTR of one scheduler.
//!
//! Each pass handles commands and finished workers, checks transfer limits,
//! then fills free slots through the share rotation of each phase.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::config::StagingConfig;
use crate::delivery::{ProgressWatch, TransferControl, TransferLimits};
use crate::dtr::{CacheState, DeliveryEndpoint, Dtr, DtrId, DtrStatus};
use crate::job::JobId;
use crate::recovery::{Interrupted, RecoveryLog};
use crate::retry::{DtrError, ErrorPhase, RetryDecision, RetryPolicy};
use crate::share::{ShareRotation, TransferShares};
use crate::url_model::Locator;

use super::slots::{Pool, SlotPools};
use super::worker::{self, WorkerContext, WorkerDone};

pub(crate) enum Command {
    Submit(Box<Dtr>),
    Cancel(JobId),
    Stop(oneshot::Sender<()>),
}

struct Running {
    job_id: JobId,
    share: String,
    pool: Pool,
    control: TransferControl,
    watch: Option<ProgressWatch>,
}

/// DTR waiting for a processing slot, possibly backing off after a failure.
struct Waiting {
    dtr: Dtr,
    not_before: Option<Instant>,
}

pub(crate) struct Dispatcher {
    ctx: WorkerContext,
    shares: TransferShares,
    slots: SlotPools,
    limits: TransferLimits,
    retry: RetryPolicy,
    emergency_priority: i32,
    delivery_services: Vec<String>,
    remote_size_limit: Option<u64>,
    next_service: usize,
    poll_interval: Duration,
    dump: Option<RecoveryLog>,
    carried: Vec<Interrupted>,
    events: mpsc::UnboundedSender<Dtr>,
    queued: Vec<Waiting>,
    resolved: Vec<Dtr>,
    transferred: Vec<Dtr>,
    running: HashMap<DtrId, Running>,
    rotation: HashMap<Pool, ShareRotation>,
    done_tx: mpsc::UnboundedSender<WorkerDone>,
    done_rx: mpsc::UnboundedReceiver<WorkerDone>,
    stopping: bool,
    stop_acks: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    pub(crate) fn new(
        cfg: &StagingConfig,
        ctx: WorkerContext,
        dump: Option<RecoveryLog>,
        carried: Vec<Interrupted>,
        events: mpsc::UnboundedSender<Dtr>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            shares: TransferShares::from_config(&cfg.share),
            slots: SlotPools::from_config(cfg),
            limits: TransferLimits::from_config(&cfg.limits),
            retry: cfg.retry_policy(),
            emergency_priority: cfg.emergency_priority,
            delivery_services: cfg.delivery_services.clone(),
            remote_size_limit: cfg.remote_size_limit,
            next_service: 0,
            poll_interval: cfg.poll_interval(),
            dump,
            carried,
            events,
            queued: Vec::new(),
            resolved: Vec::new(),
            transferred: Vec::new(),
            running: HashMap::new(),
            rotation: HashMap::new(),
            done_tx,
            done_rx,
            stopping: false,
            stop_acks: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        commands_open = false;
                        self.begin_stop();
                    }
                },
                Some(done) = self.done_rx.recv() => self.finish_phase(done),
                _ = tick.tick() => self.check_limits(),
            }

            if self.stopping {
                if self.running.is_empty() {
                    break;
                }
                continue;
            }
            self.fill_slots();
        }

        // Commands that raced with the stop request still get an answer.
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Submit(dtr) => {
                    let mut dtr = *dtr;
                    dtr.cancel();
                    self.publish(dtr);
                }
                Command::Cancel(_) => {}
                Command::Stop(ack) => self.stop_acks.push(ack),
            }
        }

        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.rewrite(&self.carried) {
                tracing::warn!("failed to clear recovery dump: {:#}", e);
            }
        }
        tracing::info!("scheduler stopped");
        for ack in self.stop_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(dtr) => self.submit(*dtr),
            Command::Cancel(job_id) => self.cancel_job(&job_id),
            Command::Stop(ack) => {
                self.stop_acks.push(ack);
                self.begin_stop();
            }
        }
    }

    fn publish(&self, dtr: Dtr) {
        debug_assert!(dtr.status.is_terminal());
        tracing::info!(
            dtr_id = %dtr.id,
            job_id = %dtr.job_id,
            status = %dtr.status,
            "DTR finished: {} -> {}",
            dtr.source(),
            dtr.destination()
        );
        if self.events.send(dtr).is_err() {
            tracing::debug!("scheduler event receiver dropped");
        }
    }

    fn record(&mut self, dtr: &Dtr, phase: DtrStatus) {
        let Some(dump) = self.dump.as_mut() else {
            return;
        };
        if let Err(e) = dump.record(dtr, phase) {
            tracing::warn!(dtr_id = %dtr.id, "failed to write recovery dump: {:#}", e);
        }
        if phase == DtrStatus::Transferring || self.carried.is_empty() {
            return;
        }
        let dest = same_target(dtr.destination());
        let Some(pos) = self
            .carried
            .iter()
            .position(|e| same_target(&e.locator) == dest)
        else {
            return;
        };
        let entry = self.carried.remove(pos);
        if let Err(e) = dump.close(&entry, phase) {
            tracing::warn!(dtr_id = %dtr.id, "failed to write recovery dump: {:#}", e);
        }
    }

    fn submit(&mut self, mut dtr: Dtr) {
        if !dtr.is_valid() {
            tracing::warn!(
                dtr_id = %dtr.id,
                job_id = %dtr.job_id,
                "rejecting invalid DTR {} -> {}",
                dtr.source(),
                dtr.destination()
            );
            dtr.fail_invalid("source and destination must be one remote and one local locator");
            self.publish(dtr);
            return;
        }
        if self.stopping {
            dtr.cancel();
            self.publish(dtr);
            return;
        }
        if dtr.transfer_share.is_empty() {
            dtr.transfer_share =
                self.shares
                    .transfer_share(&dtr.job_id, &dtr.local_user, &dtr.sub_share);
        }
        dtr.set_status(DtrStatus::Queued);
        self.queued.push(Waiting {
            dtr,
            not_before: None,
        });
    }

    fn cancel_job(&mut self, job_id: &JobId) {
        let mut cancelled = Vec::new();
        let (hit, keep): (Vec<_>, Vec<_>) = self
            .queued
            .drain(..)
            .partition(|w| &w.dtr.job_id == job_id);
        self.queued = keep;
        cancelled.extend(hit.into_iter().map(|w| w.dtr));
        for list in [&mut self.resolved, &mut self.transferred] {
            let (hit, keep): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|d| &d.job_id == job_id);
            *list = keep;
            cancelled.extend(hit);
        }
        let in_flight = self
            .running
            .values()
            .filter(|r| &r.job_id == job_id)
            .inspect(|r| r.control.cancel())
            .count();
        tracing::info!(
            job_id = %job_id,
            waiting = cancelled.len(),
            in_flight,
            "cancelling DTRs of job"
        );
        for mut dtr in cancelled {
            dtr.cancel();
            self.publish(dtr);
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        tracing::info!(
            running = self.running.len(),
            "stopping scheduler, cancelling outstanding DTRs"
        );
        self.stopping = true;
        let mut waiting: Vec<Dtr> = self.queued.drain(..).map(|w| w.dtr).collect();
        waiting.append(&mut self.resolved);
        waiting.append(&mut self.transferred);
        for mut dtr in waiting {
            dtr.cancel();
            self.publish(dtr);
        }
        for r in self.running.values() {
            r.control.cancel();
        }
    }

    fn check_limits(&mut self) {
        let now = Instant::now();
        for (id, r) in self.running.iter_mut() {
            let Some(watch) = r.watch.as_mut() else {
                continue;
            };
            if r.control.should_abort() {
                continue;
            }
            if let Some(reason) = self.limits.evaluate(watch, r.control.bytes(), now) {
                tracing::warn!(dtr_id = %id, job_id = %r.job_id, "transfer stalled: {}", reason);
                r.control.flag_stalled(reason);
            }
        }
    }

    fn fill_slots(&mut self) {
        self.fill_processing();
        self.fill_delivery();
        self.fill_prepared();
    }

    fn fill_processing(&mut self) {
        let now = Instant::now();
        while self.slots.available(Pool::Processing) > 0 {
            let eligible: Vec<usize> = self
                .queued
                .iter()
                .enumerate()
                .filter(|(_, w)| w.not_before.map_or(true, |t| t <= now))
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                return;
            }
            let candidates: Vec<&Dtr> = eligible.iter().map(|i| &self.queued[*i].dtr).collect();
            let total = self.slots.limit(Pool::Processing);
            let Some(pick) = choose(
                self.rotation.entry(Pool::Processing).or_default(),
                &self.shares,
                &self.running,
                &[Pool::Processing],
                &candidates,
                total,
            ) else {
                return;
            };
            let mut dtr = self.queued.remove(eligible[pick]).dtr;
            dtr.attempts += 1;
            dtr.started_at.get_or_insert_with(chrono::Utc::now);
            dtr.set_status(DtrStatus::PreProcessing);
            self.start(Pool::Processing, dtr);
        }
    }

    fn fill_delivery(&mut self) {
        while !self.resolved.is_empty() {
            let pool = if self.slots.available(Pool::Delivery) > 0 {
                Pool::Delivery
            } else if self.slots.available(Pool::Emergency) > 0 {
                Pool::Emergency
            } else {
                return;
            };
            let emergency_priority = self.emergency_priority;
            let eligible: Vec<usize> = self
                .resolved
                .iter()
                .enumerate()
                .filter(|(_, d)| pool == Pool::Delivery || d.priority >= emergency_priority)
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                return;
            }
            let candidates: Vec<&Dtr> = eligible.iter().map(|i| &self.resolved[*i]).collect();
            let total = self.slots.limit(Pool::Delivery) + self.slots.limit(Pool::Emergency);
            let Some(pick) = choose(
                self.rotation.entry(pool).or_default(),
                &self.shares,
                &self.running,
                &[Pool::Delivery, Pool::Emergency],
                &candidates,
                total,
            ) else {
                return;
            };
            let mut dtr = self.resolved.remove(eligible[pick]);
            if pool == Pool::Emergency {
                tracing::debug!(dtr_id = %dtr.id, priority = dtr.priority, "using emergency slot");
            }
            dtr.set_status(DtrStatus::Transferring);
            self.record(&dtr, DtrStatus::Transferring);
            self.start(pool, dtr);
        }
    }

    fn fill_prepared(&mut self) {
        while self.slots.available(Pool::Prepared) > 0 && !self.transferred.is_empty() {
            let candidates: Vec<&Dtr> = self.transferred.iter().collect();
            let total = self.slots.limit(Pool::Prepared);
            let Some(pick) = choose(
                self.rotation.entry(Pool::Prepared).or_default(),
                &self.shares,
                &self.running,
                &[Pool::Prepared],
                &candidates,
                total,
            ) else {
                return;
            };
            let mut dtr = self.transferred.remove(pick);
            dtr.set_status(DtrStatus::PostProcessing);
            self.start(Pool::Prepared, dtr);
        }
    }

    fn start(&mut self, pool: Pool, dtr: Dtr) {
        if !self.slots.reserve(pool) {
            tracing::error!(dtr_id = %dtr.id, "no free slot in {:?} pool", pool);
        }
        let control = TransferControl::new();
        let watch = matches!(pool, Pool::Delivery | Pool::Emergency)
            .then(|| ProgressWatch::new(Instant::now()));
        self.running.insert(
            dtr.id,
            Running {
                job_id: dtr.job_id.clone(),
                share: dtr.transfer_share.clone(),
                pool,
                control: control.clone(),
                watch,
            },
        );
        worker::spawn(pool, dtr, self.ctx.clone(), control, self.done_tx.clone());
    }

    fn choose_endpoint(&mut self, dtr: &mut Dtr) {
        dtr.delivery = DeliveryEndpoint::Local;
        let (Some(limit), Some(size)) = (self.remote_size_limit, dtr.source_size) else {
            return;
        };
        if size <= limit || self.delivery_services.is_empty() {
            return;
        }
        let service = self.delivery_services[self.next_service % self.delivery_services.len()].clone();
        self.next_service = self.next_service.wrapping_add(1);
        tracing::debug!(dtr_id = %dtr.id, size, "using delivery service {}", service);
        dtr.delivery = DeliveryEndpoint::Remote(service);
    }

    fn finish_phase(&mut self, done: WorkerDone) {
        let WorkerDone { mut dtr, pool, result } = done;
        let Some(running) = self.running.remove(&dtr.id) else {
            tracing::error!(dtr_id = %dtr.id, "worker result for unknown DTR");
            return;
        };
        self.slots.release(pool);
        let in_transfer = matches!(pool, Pool::Delivery | Pool::Emergency);
        let phase = match pool {
            Pool::Processing => ErrorPhase::PreProcessing,
            Pool::Delivery | Pool::Emergency => ErrorPhase::Transfer,
            Pool::Prepared => ErrorPhase::PostProcessing,
        };

        let cancelled = running.control.is_cancelled()
            || matches!(&result, Err(e) if e.is_cancelled());
        if cancelled {
            if in_transfer {
                self.record(&dtr, DtrStatus::Cancelled);
            }
            dtr.cancel();
            self.publish(dtr);
            return;
        }

        match result {
            Ok(()) => match pool {
                Pool::Processing => {
                    if dtr.cache_state == CacheState::AlreadyPresent {
                        dtr.set_status(DtrStatus::Transferred);
                        self.transferred.push(dtr);
                    } else {
                        self.choose_endpoint(&mut dtr);
                        dtr.set_status(DtrStatus::Resolved);
                        self.resolved.push(dtr);
                    }
                }
                Pool::Delivery | Pool::Emergency => {
                    self.record(&dtr, DtrStatus::Transferred);
                    dtr.set_status(DtrStatus::Transferred);
                    self.transferred.push(dtr);
                }
                Pool::Prepared => {
                    dtr.error = None;
                    dtr.set_status(DtrStatus::Done);
                    self.publish(dtr);
                }
            },
            Err(e) => self.handle_failure(dtr, e.in_phase(phase), in_transfer),
        }
    }

    fn handle_failure(&mut self, mut dtr: Dtr, error: DtrError, in_transfer: bool) {
        match self.retry.decide(dtr.attempts, dtr.tries_left, error.kind) {
            RetryDecision::RetryAfter(_) if self.stopping => {
                tracing::info!(
                    dtr_id = %dtr.id,
                    job_id = %dtr.job_id,
                    "temporary failure while stopping, not retried: {}",
                    error
                );
                if in_transfer {
                    self.record(&dtr, DtrStatus::Cancelled);
                }
                dtr.cancel();
                self.publish(dtr);
            }
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    dtr_id = %dtr.id,
                    job_id = %dtr.job_id,
                    attempt = dtr.attempts,
                    tries_left = dtr.tries_left,
                    "temporary failure, retrying in {:?}: {}",
                    delay,
                    error
                );
                if in_transfer {
                    self.record(&dtr, DtrStatus::FailedTemporary);
                }
                dtr.tries_left -= 1;
                dtr.error = Some(error);
                dtr.set_status(DtrStatus::FailedTemporary);
                dtr.set_status(DtrStatus::Queued);
                self.queued.push(Waiting {
                    dtr,
                    not_before: Some(Instant::now() + delay),
                });
            }
            _ => {
                tracing::error!(
                    dtr_id = %dtr.id,
                    job_id = %dtr.job_id,
                    attempts = dtr.attempts,
                    "DTR failed: {}",
                    error
                );
                if in_transfer {
                    self.record(&dtr, DtrStatus::FailedPermanent);
                }
                dtr.fail(error);
                self.publish(dtr);
            }
        }
    }
}

/// Locator without its options.
fn same_target(locator: &str) -> String {
    Locator::parse(locator)
        .map(|l| l.canonical())
        .unwrap_or_else(|_| locator.to_string())
}

fn running_per_share(running: &HashMap<DtrId, Running>, pools: &[Pool]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for r in running.values().filter(|r| pools.contains(&r.pool)) {
        *counts.entry(r.share.clone()).or_insert(0) += 1;
    }
    counts
}

/// Index into `candidates` of the next DTR to start. `counted` are the pools
/// whose running DTRs count against a share's allotment of `total` slots.
fn choose(
    rotation: &mut ShareRotation,
    shares: &TransferShares,
    running: &HashMap<DtrId, Running>,
    counted: &[Pool],
    candidates: &[&Dtr],
    total: usize,
) -> Option<usize> {
    let running = running_per_share(running, counted);
    let active: BTreeSet<&str> = candidates
        .iter()
        .map(|d| d.transfer_share.as_str())
        .chain(running.keys().map(String::as_str))
        .collect();
    let allotment = shares.calculate_shares(active, total);
    rotation.pick(candidates, &running, &allotment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoCache;
    use crate::delivery::LocalDelivery;
    use crate::job::LocalUser;
    use crate::retry::ErrorKind;
    use std::sync::Arc;

    fn dispatcher(events: mpsc::UnboundedSender<Dtr>) -> Dispatcher {
        let cfg = StagingConfig::default();
        let ctx = WorkerContext {
            delivery: Arc::new(LocalDelivery::new()),
            cache: Arc::new(NoCache),
            url_map: Arc::new(Vec::new()),
        };
        Dispatcher::new(&cfg, ctx, None, Vec::new(), events)
    }

    fn flaky() -> Dtr {
        let mut dtr = Dtr::new(
            JobId::new("J1"),
            "http://host/a",
            "file:/ws/J1/a",
            LocalUser::new(1, 1, "u"),
        );
        dtr.tries_left = 3;
        dtr.attempts = 1;
        dtr
    }

    #[test]
    fn temporary_failure_is_requeued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(tx);
        d.handle_failure(flaky(), DtrError::new(ErrorKind::Connection, "reset"), true);
        assert_eq!(d.queued.len(), 1);
        assert_eq!(d.queued[0].dtr.tries_left, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn temporary_failure_while_stopping_is_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(tx);
        d.stopping = true;
        d.handle_failure(flaky(), DtrError::new(ErrorKind::Connection, "reset"), true);
        assert!(d.queued.is_empty());
        let dtr = rx.try_recv().unwrap();
        assert_eq!(dtr.status, DtrStatus::Cancelled);
        assert!(dtr.error.is_none());
    }

    #[test]
    fn permanent_failure_while_stopping_stays_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(tx);
        d.stopping = true;
        d.handle_failure(flaky(), DtrError::new(ErrorKind::NotFound, "gone"), false);
        assert_eq!(rx.try_recv().unwrap().status, DtrStatus::FailedPermanent);
    }
}
