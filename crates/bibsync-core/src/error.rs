//! Error types for bibsync-core

use thiserror::Error;

/// Result type alias using bibsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the local store and model layer.
///
/// Sync-level failures are classified separately in [`crate::sync::SyncError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A record could not be addressed by its primary key
    #[error("Primary key unavailable: {0}")]
    PrimaryKeyUnavailable(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
