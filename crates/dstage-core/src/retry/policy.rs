use std::time::Duration;

/// Classification of a transfer failure for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation timed out (connect/read).
    Timeout,
    /// Server asked us to slow down (e.g. 429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// HTTP status that is retryable but not strictly throttling (5xx).
    Http5xx(u16),
    /// Transfer fell below the bandwidth floor or stopped making progress.
    Stalled,
    /// Source does not exist.
    NotFound,
    /// Authentication or authorisation rejected.
    Auth,
    /// Size or checksum verification failed.
    Integrity,
    /// Destination already exists and overwrite was not requested.
    DestinationExists,
    /// Local disk failure (disk full, permission denied).
    Storage,
    /// Request is internally inconsistent (bad locators, both ends remote).
    InvalidRequest,
    /// Cooperative abort; not an error, ends the DTR as CANCELLED.
    Cancelled,
    /// Anything else (not retried).
    Other,
}

impl ErrorKind {
    /// True for failures worth another attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Throttled
                | ErrorKind::Connection
                | ErrorKind::Http5xx(_)
                | ErrorKind::Stalled
        )
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry; the DTR fails permanently.
    NoRetry,
    /// Requeue after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff between attempts. The number of attempts is carried by
/// each DTR (`tries_left`), so one policy serves every job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `attempt` is 1-based (1 = first attempt), `tries_left` is the DTR's
    /// remaining retry budget before this failure is charged.
    pub fn decide(&self, attempt: u32, tries_left: u32, kind: ErrorKind) -> RetryDecision {
        if tries_left == 0 || !kind.is_transient() {
            return RetryDecision::NoRetry;
        }
        // base * 2^(attempt-1), capped.
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_kinds_never_retry() {
        let p = RetryPolicy::default();
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Auth,
            ErrorKind::Integrity,
            ErrorKind::InvalidRequest,
            ErrorKind::Cancelled,
            ErrorKind::Other,
        ] {
            assert_eq!(p.decide(1, 5, kind), RetryDecision::NoRetry, "{kind:?}");
        }
    }

    #[test]
    fn exhausted_budget_stops_retrying() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(4, 0, ErrorKind::Timeout), RetryDecision::NoRetry);
        assert!(matches!(
            p.decide(4, 1, ErrorKind::Timeout),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        };
        let delay = |attempt| match p.decide(attempt, 10, ErrorKind::Stalled) {
            RetryDecision::RetryAfter(d) => d,
            RetryDecision::NoRetry => panic!("expected retry"),
        };
        assert_eq!(delay(1), Duration::from_millis(250));
        assert_eq!(delay(2), Duration::from_millis(500));
        assert_eq!(delay(12), Duration::from_secs(5));
    }
}
