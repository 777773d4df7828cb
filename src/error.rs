//! Error kinds for the event pipeline.
//!
//! "No alignment found" is never an error — the finder returns an empty
//! set. Everything here is either a caller mistake, a transient fault
//! the queue retries, or a recoverable inconsistency.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad coordinate or out-of-range parameter. Fails at the boundary,
    /// never reaches persistence.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The ephemeris failed for one specific instant. Isolated per
    /// search window; the rest of the day continues.
    #[error("ephemeris failure for location {location_id} at {instant}: {detail}")]
    EphemerisTransient {
        location_id: i64,
        instant: String,
        detail: String,
    },

    /// Backing database fault. Retried through the queue's backoff.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The queue could not accept work. Surfaced synchronously to the
    /// scheduler's caller.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A job handler exceeded its per-kind deadline.
    #[error("job timed out after {0:?}")]
    JobTimeout(Duration),

    /// A location row whose derived (bearing, elevation, distance) no
    /// longer match its base fields. Recoverable via reconciliation.
    #[error("stale derived geometry for location {0}")]
    StaleDerivedGeometry(i64),

    /// Cooperative cancellation. Distinct reason so retries do not fire.
    #[error("cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the queue should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Storage(_) | CoreError::EphemerisTransient { .. } => true,
            CoreError::JobTimeout(_) => true,
            CoreError::InvalidInput(_)
            | CoreError::QueueUnavailable(_)
            | CoreError::StaleDerivedGeometry(_)
            | CoreError::Cancelled
            | CoreError::NotFound(_)
            | CoreError::Payload(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
