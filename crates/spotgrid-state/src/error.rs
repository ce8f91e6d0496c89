//! Error types for the spotgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Lost optimistic-concurrency race. The caller re-reads and retries
    /// or abandons; the row was not mutated.
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Illegal lifecycle edge. Surfaced, never retried.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("agent {0} already has a primary in a non-terminal state")]
    PrimaryExists(String),

    #[error("agent {0} already has a live replica")]
    ReplicaExists(String),

    #[error("failover mode conflict for agent {agent_id}: {detail}")]
    ModeConflict { agent_id: String, detail: String },
}
