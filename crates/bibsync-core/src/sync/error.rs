//! Failure classification for sync runs.

use thiserror::Error;

use crate::api::ApiError;
use crate::models::{LibraryIdentifier, ObjectType};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network failure or 5xx; retried per the sync delay table.
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// The server rejected a push because the library moved on.
    #[error("Version conflict in {library} {object_type}")]
    VersionConflict {
        library: LibraryIdentifier,
        object_type: ObjectType,
    },

    #[error("Attachment file is missing: {0}")]
    FileMissing(String),

    #[error("Attachment file could not be copied: {0}")]
    FileNotCopied(String),

    #[error("Upload authorization expired for {key}")]
    UploadAuthorizationExpired { key: String },

    #[error("Primary key unavailable: {0}")]
    PrimaryKeyUnavailable(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Expired or revoked credentials.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// The remote service returned something unusable.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::Error),

    #[error("Sync was cancelled")]
    Cancelled,
}

impl SyncError {
    /// Worth retrying after a delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Aborts the whole run instead of the current object or step.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Store(_) | Self::Cancelled)
    }

    /// Maps an API error raised while working on one library and type.
    pub(crate) fn from_api(
        error: ApiError,
        library: LibraryIdentifier,
        object_type: ObjectType,
    ) -> Self {
        match error {
            ApiError::PreconditionFailed => Self::VersionConflict {
                library,
                object_type,
            },
            other => other.into(),
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(error: ApiError) -> Self {
        if error.is_transient() {
            return Self::TransientNetwork(error.to_string());
        }
        match error {
            ApiError::Unauthorized(message) => Self::Unauthorized(message),
            ApiError::Status { status: 404, message } => Self::ObjectNotFound(message),
            other => Self::Remote(other.to_string()),
        }
    }
}
