//! Transfer scheduler.
//!
//! An explicitly constructed actor: `Scheduler::start` spawns the dispatch
//! task and returns a clonable handle plus the channel on which every DTR is
//! handed back exactly once in a terminal state. DTRs move through three slot
//! pools (processing, delivery with emergency overflow, prepared) with fair
//! share rotation in each.

mod dispatch;
mod slots;
mod worker;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::cache::FileCache;
use crate::config::StagingConfig;
use crate::delivery::DataDelivery;
use crate::dtr::Dtr;
use crate::job::JobId;
use crate::recovery::{read_interrupted_records, RecoveryLog};
use crate::retry::{DtrError, ErrorKind, ErrorPhase};

use dispatch::{Command, Dispatcher};
use worker::WorkerContext;

/// A DTR refused because the scheduler is stopped. The DTR is marked
/// permanently failed and handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("scheduler is stopped, DTR {} rejected", .0.id)]
pub struct Rejected(pub Box<Dtr>);

/// Receiving end of the scheduler's terminal-DTR events.
pub struct SchedulerEvents {
    rx: mpsc::UnboundedReceiver<Dtr>,
}

impl SchedulerEvents {
    /// Next terminal DTR; `None` once the scheduler has stopped and every event was received.
    pub async fn recv(&mut self) -> Option<Dtr> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Dtr> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
    interrupted: Arc<Vec<String>>,
}

impl Scheduler {
    /// Read the recovery dump and start dispatching. Must be called inside a tokio runtime.
    pub fn start(
        cfg: &StagingConfig,
        delivery: Arc<dyn DataDelivery>,
        cache: Arc<dyn FileCache>,
    ) -> Result<(Scheduler, SchedulerEvents)> {
        let dump_path = cfg.dump_path();
        let carried = read_interrupted_records(&dump_path)?;
        if !carried.is_empty() {
            tracing::warn!(
                count = carried.len(),
                "found transfers interrupted by a previous run"
            );
        }
        let mut dump = RecoveryLog::open(&dump_path)?;
        // Interrupted records stay in the dump until a new transfer to the same
        // destination leaves the transfer phase.
        dump.rewrite(&carried)?;
        let interrupted = carried.iter().map(|e| e.locator.clone()).collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            delivery,
            cache,
            url_map: Arc::new(cfg.url_map.clone()),
        };
        let dispatcher = Dispatcher::new(cfg, ctx, Some(dump), carried, events_tx);
        tokio::spawn(dispatcher.run(cmd_rx));
        tracing::info!(
            processing = cfg.max_processor,
            delivery = cfg.max_delivery,
            emergency = cfg.max_emergency,
            prepared = cfg.max_prepared,
            dump = %dump_path.display(),
            "scheduler started"
        );

        Ok((
            Scheduler {
                commands: cmd_tx,
                stopped: Arc::new(AtomicBool::new(false)),
                interrupted: Arc::new(interrupted),
            },
            SchedulerEvents { rx: events_rx },
        ))
    }

    /// Queue a DTR. Invalid DTRs come back through the event channel as failed.
    pub fn submit(&self, dtr: Dtr) -> Result<(), Rejected> {
        if self.is_stopped() {
            return Err(reject(dtr));
        }
        tracing::debug!(
            dtr_id = %dtr.id,
            job_id = %dtr.job_id,
            "submit {} -> {}",
            dtr.source(),
            dtr.destination()
        );
        if let Err(mpsc::error::SendError(Command::Submit(dtr))) =
            self.commands.send(Command::Submit(Box::new(dtr)))
        {
            return Err(reject(*dtr));
        }
        Ok(())
    }

    /// Cancel every queued and in-flight DTR of a job.
    pub fn cancel(&self, job_id: &JobId) {
        let _ = self.commands.send(Command::Cancel(job_id.clone()));
    }

    /// Cancel everything and wait until every terminal DTR has been published.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Destinations left mid-transfer by the previous run.
    pub fn interrupted_destinations(&self) -> &[String] {
        &self.interrupted
    }
}

fn reject(mut dtr: Dtr) -> Rejected {
    tracing::error!(dtr_id = %dtr.id, job_id = %dtr.job_id, "scheduler is stopped, rejecting DTR");
    dtr.fail(
        DtrError::new(ErrorKind::Other, "scheduler is stopped").in_phase(ErrorPhase::Scheduler),
    );
    Rejected(Box::new(dtr))
}
