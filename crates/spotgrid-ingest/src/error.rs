//! Ingestion error types.

use thiserror::Error;

/// Result type alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Rejection reasons for inbound telemetry. These are local failures:
/// the report is dropped, logged, and never retried.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("price {0} is not a finite positive number")]
    BadPrice(f64),

    #[error("timestamp {captured_at} is {ahead}s in the future (window {window}s)")]
    FutureTimestamp {
        captured_at: u64,
        ahead: u64,
        window: u64,
    },

    #[error("unknown heartbeat status: {0}")]
    UnknownStatus(String),

    #[error("state store error: {0}")]
    State(#[from] spotgrid_state::StateError),
}
