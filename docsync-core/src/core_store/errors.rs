/*
    errors.rs - Error types for the storage subsystem

    Covers:
    - Optimistic concurrency and idempotency violations of the operation log
    - Cancellation of storage calls
    - SQLite, pool and serialization failures
*/

use thiserror::Error;

use super::types::StreamKey;

/// Errors that can occur in the storage subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream head moved since the caller read it; refetch and retry
    #[error("Revision mismatch on {stream}: expected {expected}, actual {actual}")]
    RevisionMismatch {
        stream: StreamKey,
        expected: u64,
        actual: u64,
    },

    /// An operation with this id is already stored; treat as applied
    #[error("Duplicate operation: {0}")]
    DuplicateOperation(String),

    /// The caller's abort signal fired
    #[error("Operation aborted")]
    Aborted,

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No operation has ever been recorded for the requested document or stream
    #[error("Synchronization unit not found: {0}")]
    SynchronizationUnitNotFound(String),

    /// Malformed write batch
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Errors the caller may retry after refreshing its view of the stream
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::RevisionMismatch { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Storage(format!("Failed to get connection: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Storage(format!("Task join error: {}", err))
    }
}
