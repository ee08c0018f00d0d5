//! Persisted upload sessions handed to the background transfer subsystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::LibraryIdentifier;
use crate::error::Error;

/// Leading text of `last_error` when the destination refused a stale
/// authorization.
pub const AUTHORIZATION_EXPIRED: &str = "Upload authorization expired";

/// Progress of one background transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl UploadState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("Unknown upload state: {other}"))),
        }
    }
}

/// A fully described attachment transfer.
///
/// The record is durable: any process instance may claim and finish it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub attachment_key: String,
    pub library: LibraryIdentifier,
    pub user_id: i64,
    pub remote_url: String,
    pub method: String,
    pub local_path: PathBuf,
    /// Token the server expects when the upload is registered.
    pub upload_token: String,
    pub content_hash: String,
    pub headers: BTreeMap<String, String>,
    pub state: UploadState,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadSession {
    /// A pending session with a fresh time-ordered id.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attachment_key: String,
        library: LibraryIdentifier,
        user_id: i64,
        remote_url: String,
        method: String,
        local_path: PathBuf,
        upload_token: String,
        content_hash: String,
        headers: BTreeMap<String, String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            attachment_key,
            library,
            user_id,
            remote_url,
            method,
            local_path,
            upload_token,
            content_hash,
            headers,
            state: UploadState::Pending,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// The transfer failed because its pre-signed destination was rejected.
    #[must_use]
    pub fn authorization_expired(&self) -> bool {
        self.state == UploadState::Failed
            && self
                .last_error
                .as_deref()
                .is_some_and(|error| error.starts_with(AUTHORIZATION_EXPIRED))
    }
}
