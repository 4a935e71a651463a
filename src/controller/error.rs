//! Error types for the controller.
//!
//! Domain states (upstream not ready, quota exceeded, claim lost, ...) are
//! never errors: they are written as conditions. What remains here is
//! infrastructure failure, optimistic-concurrency conflicts and invariant
//! violations.

use std::time::Duration;
use thiserror::Error;

use crate::quantity::QuantityError;

/// Suffix of every invariant violation message.
pub const REPORT_BUG: &str = "please report a bug";

/// Base delay of the retry backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound of the retry backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delay before retrying a pass that lost an optimistic-concurrency race.
pub const CONFLICT_RETRY: Duration = Duration::from_millis(100);

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// The object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A controller invariant does not hold
    #[error("{0}, {report}", report = REPORT_BUG)]
    Bug(String),

    /// Unparsable Kubernetes quantity
    #[error("Invalid quantity: {0}")]
    Quantity(#[from] QuantityError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409 && e.reason == "Conflict",
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_) | Error::Conflict(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Bug(_) | Error::Quantity(_) | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration after `attempt` consecutive failures.
    ///
    /// Conflicts retry right away; everything else backs off exponentially.
    pub fn requeue_after(&self, attempt: u32) -> Duration {
        if self.is_conflict() {
            return CONFLICT_RETRY;
        }
        if !self.is_retryable() {
            return BACKOFF_MAX;
        }
        exponential_backoff(BACKOFF_BASE, BACKOFF_MAX, attempt)
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`. Attempt 0 means no delay.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
