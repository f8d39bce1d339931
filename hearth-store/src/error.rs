//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the backend failed. Shared by every waiter of the same batch.
    #[error("connection error: {0}")]
    Connection(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Partition name cannot be used as a table name.
    #[error("invalid partition name: {0}")]
    InvalidPartition(String),

    /// Partition was not declared when the connection was opened.
    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    /// A blocking backend task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The store's worker is gone.
    #[error("store closed")]
    Closed,
}
