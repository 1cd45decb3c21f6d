//! Retry and backoff policy for transfer requests.
//!
//! Protocol outcomes (HTTP status, curl errors, local I/O failures) are
//! classified into an `ErrorKind`; the kind decides whether a failed DTR goes
//! back to the queue or becomes permanently failed, and the policy decides how
//! long it waits before the next attempt.

mod classify;
mod error;
mod policy;

pub use classify::{classify_curl_error, classify_http_status, classify_io_error};
pub use error::{DtrError, ErrorPhase};
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
