//! Data delivery: the contract between the scheduler and whatever moves bytes.
//!
//! All three operations are blocking and are run on tokio's blocking pool.
//! A transfer must call `TransferControl::checkpoint` before each block it
//! moves; that is where cancellation and stall detection take effect.

mod limits;
mod local;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dtr::{DeliveryEndpoint, Direction, Dtr, DtrId};
use crate::job::JobId;
use crate::retry::{DtrError, ErrorKind};
use crate::url_model::Locator;

pub use limits::{ProgressWatch, TransferLimits};
pub use local::LocalDelivery;

/// What a delivery worker needs to know about one DTR.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub dtr_id: DtrId,
    pub job_id: JobId,
    pub source: Locator,
    pub destination: Locator,
    pub direction: Direction,
    pub credential: Option<PathBuf>,
    pub endpoint: DeliveryEndpoint,
    pub force_registration: bool,
    /// Size learned during resolution.
    pub expected_size: Option<u64>,
}

impl TransferTask {
    pub fn from_dtr(dtr: &Dtr) -> Result<Self, DtrError> {
        let invalid = |e: crate::url_model::LocatorError| {
            DtrError::new(ErrorKind::InvalidRequest, e.to_string())
        };
        Ok(Self {
            dtr_id: dtr.id,
            job_id: dtr.job_id.clone(),
            source: dtr.source_locator().map_err(invalid)?,
            destination: dtr.destination_locator().map_err(invalid)?,
            direction: dtr.direction(),
            credential: dtr.credential.clone(),
            endpoint: dtr.delivery.clone(),
            force_registration: dtr.force_registration,
            expected_size: dtr.source_size,
        })
    }
}

/// Outcome of pre-processing a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub size: Option<u64>,
}

pub trait DataDelivery: Send + Sync {
    /// Check the source exists and learn its size.
    fn resolve(&self, task: &TransferTask) -> Result<Resolution, DtrError>;
    /// Move the bytes.
    fn transfer(&self, task: &TransferTask, control: &TransferControl) -> Result<(), DtrError>;
    /// Register the finished destination (replica catalogues and the like).
    fn register(&self, task: &TransferTask) -> Result<(), DtrError>;
}

#[derive(Debug, Default)]
struct ControlInner {
    cancelled: AtomicBool,
    stalled: AtomicBool,
    stall_reason: Mutex<String>,
    bytes: AtomicU64,
}

/// Shared between a running transfer and the scheduler's dispatch loop.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    inner: Arc<ControlInner>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Mark the transfer as too slow; it fails at its next checkpoint.
    pub fn flag_stalled(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.inner.stall_reason.lock() {
            *r = reason.into();
        }
        self.inner.stalled.store(true, Ordering::Relaxed);
    }

    pub fn is_stalled(&self) -> bool {
        self.inner.stalled.load(Ordering::Relaxed)
    }

    /// True when the transfer should stop at the next opportunity.
    pub fn should_abort(&self) -> bool {
        self.is_cancelled() || self.is_stalled()
    }

    pub fn report_bytes(&self, n: u64) {
        self.inner.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    /// Safe point between blocks. Cancellation wins over a stall.
    pub fn checkpoint(&self) -> Result<(), DtrError> {
        if self.is_cancelled() {
            return Err(DtrError::cancelled());
        }
        if self.is_stalled() {
            let reason = self
                .inner
                .stall_reason
                .lock()
                .map(|r| r.clone())
                .unwrap_or_default();
            return Err(DtrError::stalled(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LocalUser;

    #[test]
    fn checkpoint_reports_cancel_before_stall() {
        let control = TransferControl::new();
        assert!(control.checkpoint().is_ok());
        control.flag_stalled("too slow");
        let err = control.checkpoint().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Stalled);
        assert_eq!(err.message, "too slow");
        control.cancel();
        assert!(control.checkpoint().unwrap_err().is_cancelled());
    }

    #[test]
    fn progress_is_shared_between_clones() {
        let control = TransferControl::new();
        let worker = control.clone();
        worker.report_bytes(10);
        worker.report_bytes(5);
        assert_eq!(control.bytes(), 15);
    }

    #[test]
    fn task_from_dtr_uses_mapped_source() {
        let mut dtr = Dtr::new(
            JobId::new("J1"),
            "gsiftp://se/data/a",
            "file:/ws/J1/a",
            LocalUser::new(1, 1, "u"),
        );
        dtr.mapped_source = Some("file:/mnt/se/data/a".into());
        let task = TransferTask::from_dtr(&dtr).unwrap();
        assert!(task.source.is_local());
        assert_eq!(task.direction, Direction::Download);
    }
}
