//! Data Transfer Request: one file copy between a remote and a local locator.
//!
//! A DTR is built by the generator, owned by the scheduler while it runs and
//! handed back exactly once in a terminal state.

mod status;

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

use crate::cache::CacheParameters;
use crate::job::{JobId, LocalUser};
use crate::retry::{DtrError, ErrorKind, ErrorPhase};
use crate::url_model::{Locator, LocatorError};

pub use status::{DtrStatus, UnknownStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DtrId(uuid::Uuid);

impl DtrId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for DtrId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DtrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote source, local destination (staging-in).
    Download,
    /// Local source, remote destination (staging-out).
    Upload,
}

impl Direction {
    /// Default sub-share label.
    pub fn sub_share(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// Cache outcome of pre-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheState {
    #[default]
    NotCacheable,
    /// Cacheable but not yet in the cache; the transfer fills it.
    CacheableFresh,
    /// Served from the cache; the transfer phase is skipped.
    AlreadyPresent,
}

/// Where the bytes of a transfer are moved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeliveryEndpoint {
    #[default]
    Local,
    /// A remote delivery service endpoint URL.
    Remote(String),
}

#[derive(Debug, Clone)]
pub struct Dtr {
    pub id: DtrId,
    pub job_id: JobId,
    source: String,
    destination: String,
    /// Source after URL mapping, when a rule applied.
    pub mapped_source: Option<String>,
    pub local_user: LocalUser,
    pub sub_share: String,
    /// Fairness bucket, set from the share policy (`<base>-<sub_share>`).
    pub transfer_share: String,
    /// 1..=100, higher runs first.
    pub priority: i32,
    pub tries_left: u32,
    /// Attempts started so far.
    pub attempts: u32,
    pub cache: CacheParameters,
    pub cache_state: CacheState,
    /// Allow registering the same logical name from several DTRs.
    pub force_registration: bool,
    pub credential: Option<PathBuf>,
    pub delivery: DeliveryEndpoint,
    pub source_size: Option<u64>,
    pub bytes_transferred: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: DtrStatus,
    pub error: Option<DtrError>,
}

impl Dtr {
    pub fn new(
        job_id: JobId,
        source: impl Into<String>,
        destination: impl Into<String>,
        local_user: LocalUser,
    ) -> Self {
        let source = source.into();
        let destination = destination.into();
        let direction = direction_of(&source);
        Self {
            id: DtrId::new(),
            job_id,
            source,
            destination,
            mapped_source: None,
            local_user,
            sub_share: direction.sub_share().to_string(),
            transfer_share: String::new(),
            priority: crate::job::DEFAULT_PRIORITY,
            tries_left: 0,
            attempts: 0,
            cache: CacheParameters::default(),
            cache_state: CacheState::NotCacheable,
            force_registration: false,
            credential: None,
            delivery: DeliveryEndpoint::Local,
            source_size: None,
            bytes_transferred: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: DtrStatus::New,
            error: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Source actually read by the transfer (mapped if a rule applied).
    pub fn transfer_source(&self) -> &str {
        self.mapped_source.as_deref().unwrap_or(&self.source)
    }

    pub fn source_locator(&self) -> Result<Locator, LocatorError> {
        Locator::parse(self.transfer_source())
    }

    pub fn destination_locator(&self) -> Result<Locator, LocatorError> {
        Locator::parse(&self.destination)
    }

    pub fn direction(&self) -> Direction {
        direction_of(&self.source)
    }

    /// Both locators parse and exactly one of them is local.
    pub fn is_valid(&self) -> bool {
        match (Locator::parse(&self.source), Locator::parse(&self.destination)) {
            (Ok(src), Ok(dst)) => src.is_local() != dst.is_local(),
            _ => false,
        }
    }

    /// The locator on the remote side.
    pub fn remote_url(&self) -> &str {
        match self.direction() {
            Direction::Download => &self.source,
            Direction::Upload => &self.destination,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == DtrStatus::Cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.status == DtrStatus::FailedPermanent
    }

    /// The failure came from request validation rather than from a transfer.
    pub fn is_invalid_request(&self) -> bool {
        matches!(&self.error, Some(e) if e.kind == ErrorKind::InvalidRequest)
    }

    pub fn error_text(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }

    pub fn set_status(&mut self, status: DtrStatus) {
        tracing::debug!(
            dtr_id = %self.id,
            job_id = %self.job_id,
            from = %self.status,
            to = %status,
            "DTR status change"
        );
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// End the DTR as permanently failed with the given error.
    pub fn fail(&mut self, error: DtrError) {
        self.error = Some(error);
        self.set_status(DtrStatus::FailedPermanent);
    }

    pub fn fail_invalid(&mut self, message: impl Into<String>) {
        self.fail(
            DtrError::new(ErrorKind::InvalidRequest, message).in_phase(ErrorPhase::Scheduler),
        );
    }

    pub fn cancel(&mut self) {
        self.error = None;
        self.set_status(DtrStatus::Cancelled);
    }
}

fn direction_of(source: &str) -> Direction {
    match Locator::parse(source) {
        Ok(loc) if loc.is_local() => Direction::Upload,
        _ => Direction::Download,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> LocalUser {
        LocalUser::new(1000, 1000, "alice")
    }

    #[test]
    fn download_from_remote_source() {
        let d = Dtr::new(JobId::new("J1"), "http://host/a", "file:/ws/J1/a", user());
        assert_eq!(d.direction(), Direction::Download);
        assert_eq!(d.sub_share, "download");
        assert!(d.is_valid());
        assert_eq!(d.remote_url(), "http://host/a");
        assert_eq!(d.status, DtrStatus::New);
    }

    #[test]
    fn upload_from_local_source() {
        let d = Dtr::new(JobId::new("J1"), "file:/ws/J1/out", "gsiftp://se/out", user());
        assert_eq!(d.direction(), Direction::Upload);
        assert_eq!(d.sub_share, "upload");
        assert!(d.is_valid());
    }

    #[test]
    fn both_remote_or_both_local_is_invalid() {
        let d = Dtr::new(JobId::new("J"), "http://a/x", "gsiftp://b/x", user());
        assert!(!d.is_valid());
        let d = Dtr::new(JobId::new("J"), "file:/a", "file:/b", user());
        assert!(!d.is_valid());
        let d = Dtr::new(JobId::new("J"), "", "file:/b", user());
        assert!(!d.is_valid());
    }

    #[test]
    fn mapped_source_is_used_for_transfer() {
        let mut d = Dtr::new(JobId::new("J"), "gsiftp://se/data/a", "file:/ws/J/a", user());
        d.mapped_source = Some("file:/mnt/se/data/a".into());
        assert_eq!(d.source(), "gsiftp://se/data/a");
        assert_eq!(d.transfer_source(), "file:/mnt/se/data/a");
        assert_eq!(d.direction(), Direction::Download);
    }

    #[test]
    fn terminal_status_sets_finish_time() {
        let mut d = Dtr::new(JobId::new("J"), "http://h/a", "file:/ws/a", user());
        d.fail_invalid("bad");
        assert!(d.is_failed());
        assert!(d.is_invalid_request());
        assert!(d.finished_at.is_some());
        assert_eq!(d.error_text(), "scheduler failed: bad");
    }
}
