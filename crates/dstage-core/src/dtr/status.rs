use std::fmt;
use std::str::FromStr;

/// Execution state of a DTR.
///
/// ```text
/// NEW -> QUEUED -> PRE_PROCESSING -> RESOLVED -> TRANSFERRING -> TRANSFERRED
///     -> POST_PROCESSING -> DONE
/// ```
/// Any phase may end in `FAILED_TEMPORARY` (requeued while tries remain),
/// `FAILED_PERMANENT` or `CANCELLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtrStatus {
    New,
    Queued,
    PreProcessing,
    /// Source resolved; waiting for a delivery slot.
    Resolved,
    Transferring,
    /// Bytes moved; waiting for a post-processing slot.
    Transferred,
    PostProcessing,
    Done,
    FailedTemporary,
    FailedPermanent,
    Cancelled,
}

impl DtrStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DtrStatus::Done | DtrStatus::FailedPermanent | DtrStatus::Cancelled
        )
    }

    /// Name used in the recovery dump.
    pub fn as_str(self) -> &'static str {
        match self {
            DtrStatus::New => "NEW",
            DtrStatus::Queued => "QUEUED",
            DtrStatus::PreProcessing => "PRE_PROCESSING",
            DtrStatus::Resolved => "RESOLVED",
            DtrStatus::Transferring => "TRANSFERRING",
            DtrStatus::Transferred => "TRANSFERRED",
            DtrStatus::PostProcessing => "POST_PROCESSING",
            DtrStatus::Done => "DONE",
            DtrStatus::FailedTemporary => "FAILED_TEMPORARY",
            DtrStatus::FailedPermanent => "FAILED_PERMANENT",
            DtrStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for DtrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown DTR phase: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DtrStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "NEW" => DtrStatus::New,
            "QUEUED" => DtrStatus::Queued,
            "PRE_PROCESSING" => DtrStatus::PreProcessing,
            "RESOLVED" => DtrStatus::Resolved,
            // Older dumps used the short form.
            "TRANSFERRING" | "TRANSFER" => DtrStatus::Transferring,
            "TRANSFERRED" => DtrStatus::Transferred,
            "POST_PROCESSING" => DtrStatus::PostProcessing,
            "DONE" => DtrStatus::Done,
            "FAILED_TEMPORARY" => DtrStatus::FailedTemporary,
            "FAILED_PERMANENT" | "ERROR" => DtrStatus::FailedPermanent,
            "CANCELLED" => DtrStatus::Cancelled,
            other => return Err(UnknownStatus(other.to_string())),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DtrStatus::Done.is_terminal());
        assert!(DtrStatus::FailedPermanent.is_terminal());
        assert!(DtrStatus::Cancelled.is_terminal());
        assert!(!DtrStatus::FailedTemporary.is_terminal());
        assert!(!DtrStatus::Transferred.is_terminal());
    }

    #[test]
    fn legacy_transfer_phase_parses() {
        assert_eq!("TRANSFER".parse::<DtrStatus>(), Ok(DtrStatus::Transferring));
        assert_eq!(
            "POST_PROCESSING".parse::<DtrStatus>(),
            Ok(DtrStatus::PostProcessing)
        );
        assert!("BOGUS".parse::<DtrStatus>().is_err());
    }
}
