//! Error types for the mindo-sync crate.

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors returned by durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the underlying storage failed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A value could not be encoded or decoded as JSON.
    #[error("Storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The key cannot be mapped onto the storage medium.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Domain failures surfaced by engine writes.
///
/// These are carried inside a [`WriteOutcome`](crate::engine::WriteOutcome),
/// never returned as `Err` from an engine operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Invalid parameters provided by the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// No item with the given id is known locally or remotely.
    #[error("Item not found: {0}")]
    NotFound(String),
    /// The authoritative store rejected or never received the write.
    #[error("{0}")]
    Remote(#[from] RemoteError),
}
