//! Upload pipeline failures.

use thiserror::Error;

use crate::api::ApiError;
use crate::models::LibraryIdentifier;
use crate::sync::SyncError;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    /// The source is absent, unreadable or empty.
    #[error("Attachment file is missing: {0}")]
    FileMissing(String),

    /// Placing the file at its canonical location failed.
    #[error("Attachment file could not be copied: {0}")]
    FileNotCopied(String),

    /// The pre-signed destination is no longer valid.
    #[error("Upload authorization expired for {key}")]
    AuthorizationExpired { key: String },

    #[error("Library {0} does not allow file uploads")]
    ReadOnly(LibraryIdentifier),

    #[error("Attachment {0} not found")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::Error),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl From<UploadError> for SyncError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::FileMissing(message) => Self::FileMissing(message),
            UploadError::FileNotCopied(message) => Self::FileNotCopied(message),
            UploadError::AuthorizationExpired { key } => Self::UploadAuthorizationExpired { key },
            UploadError::NotFound(key) => Self::ObjectNotFound(key),
            UploadError::Store(error) => Self::Store(error),
            UploadError::Api(error) => error.into(),
            UploadError::Sync(error) => error,
            UploadError::ReadOnly(library) => {
                Self::Remote(format!("library {library} does not allow file uploads"))
            }
        }
    }
}
