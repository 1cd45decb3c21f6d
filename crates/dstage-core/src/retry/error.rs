//! Error carried by a failed transfer request.

use std::fmt;

use super::policy::ErrorKind;

/// Execution phase in which a DTR failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    PreProcessing,
    Transfer,
    PostProcessing,
    Scheduler,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorPhase::PreProcessing => "pre-processing",
            ErrorPhase::Transfer => "transfer",
            ErrorPhase::PostProcessing => "post-processing",
            ErrorPhase::Scheduler => "scheduler",
        };
        f.write_str(s)
    }
}

/// Failure of one DTR phase. Surfaces to the generator only through the DTR's
/// terminal status and `error` field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct DtrError {
    pub kind: ErrorKind,
    pub phase: Option<ErrorPhase>,
    pub message: String,
}

impl DtrError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase: None,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transfer cancelled")
    }

    pub fn stalled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stalled, message)
    }

    /// Attach the phase unless the error already carries one.
    pub fn in_phase(mut self, phase: ErrorPhase) -> Self {
        self.phase.get_or_insert(phase);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    fn describe(&self) -> String {
        match self.phase {
            Some(phase) => format!("{} failed: {}", phase, self.message),
            None => self.message.clone(),
        }
    }
}

impl From<std::io::Error> for DtrError {
    fn from(e: std::io::Error) -> Self {
        DtrError::new(super::classify::classify_io_error(&e), e.to_string())
    }
}
