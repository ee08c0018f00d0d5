use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] bibsync_core::Error),
    #[error(transparent)]
    Sync(#[from] bibsync_core::sync::SyncError),
    #[error(transparent)]
    Upload(#[from] bibsync_core::upload::UploadError),
    #[error(transparent)]
    Api(#[from] bibsync_core::api::ApiError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Sync run aborted: {0}")]
    Aborted(String),
    #[error(
        "Sync is not configured. Run `bibsync config init` or set BIBSYNC_API_BASE_URL, BIBSYNC_API_KEY and BIBSYNC_USER_ID."
    )]
    SyncNotConfigured,
}
