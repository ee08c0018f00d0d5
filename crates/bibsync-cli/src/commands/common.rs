use std::path::{Path, PathBuf};
use std::sync::Arc;

use bibsync_core::api::HttpSyncApi;
use bibsync_core::clock::{Clock, SystemClock};
use bibsync_core::config::EngineConfig;
use bibsync_core::db::LibraryStore;
use bibsync_core::models::{SyncConflict, UploadSession};
use bibsync_core::sync::{SyncContext, SyncController};
use bibsync_core::upload::{AttachmentUploader, TransferQueue};
use bibsync_core::LibraryIdentifier;
use serde::Serialize;

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

/// Everything a command needs to talk to the store and the server.
pub struct Engine {
    pub store: LibraryStore,
    pub queue: TransferQueue,
    pub uploader: Arc<AttachmentUploader>,
    pub controller: Arc<SyncController>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.controller.context().config
    }
}

pub fn default_data_dir() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("bibsync"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match cli_db_path {
        Some(path) => Ok(path),
        None => Ok(default_data_dir()?.join("library.db")),
    }
}

/// Environment first (`BIBSYNC_*`, `.env`), then the active profile.
pub fn resolve_engine_config(profile: Option<&str>) -> Result<EngineConfig, CliError> {
    if let Some(config) = EngineConfig::from_env()? {
        return Ok(config);
    }

    let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
    let name = profiles.resolve_profile_name(profile);
    let attachments_dir = default_data_dir()?.join("attachments");
    profiles
        .profile(&name)
        .map(|profile| profile.engine_config(&attachments_dir))
        .transpose()
        .map_err(CliError::Config)?
        .flatten()
        .ok_or(CliError::SyncNotConfigured)
}

pub async fn open_store(db_path: &Path) -> Result<LibraryStore, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(LibraryStore::open(db_path).await?)
}

pub async fn open_engine(db_path: &Path, profile: Option<&str>) -> Result<Engine, CliError> {
    let config = resolve_engine_config(profile)?;
    let store = open_store(db_path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let api = HttpSyncApi::new(&config)?;

    let queue = TransferQueue::new(store.clone(), clock.clone());
    let context = SyncContext::new(store.clone(), Arc::new(api), config, clock);
    let uploader = Arc::new(AttachmentUploader::new(
        context.clone(),
        Arc::new(queue.clone()),
    ));
    let controller = Arc::new(SyncController::new(context).with_uploads(uploader.clone()));
    Ok(Engine {
        store,
        queue,
        uploader,
        controller,
    })
}

pub fn parse_library(value: &str) -> Result<LibraryIdentifier, CliError> {
    Ok(value.parse::<LibraryIdentifier>()?)
}

pub fn parse_libraries(values: &[String]) -> Result<Vec<LibraryIdentifier>, CliError> {
    values.iter().map(|value| parse_library(value)).collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

#[derive(Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub library: String,
    pub object_type: String,
    pub key: String,
    pub kind: String,
    pub local_version: i64,
    pub remote_version: Option<i64>,
    pub recorded_at: i64,
}

pub fn conflict_to_item(conflict: &SyncConflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.clone(),
        library: conflict.library.to_string(),
        object_type: conflict.object_type.to_string(),
        key: conflict.key.clone(),
        kind: conflict.kind.to_string(),
        local_version: conflict.local_version,
        remote_version: conflict.remote_version,
        recorded_at: conflict.recorded_at,
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict], now_ms: i64) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let remote = conflict
                .remote_version
                .map_or_else(|| "deleted".to_string(), |version| format!("v{version}"));
            format!(
                "{}  {} {} {:<12} local v{} / remote {}  ({})",
                conflict.id,
                conflict.library,
                conflict.object_type,
                conflict.kind,
                conflict.local_version,
                remote,
                format_relative_time(conflict.recorded_at, now_ms)
            )
        })
        .collect()
}

pub fn format_session_lines(sessions: &[UploadSession]) -> Vec<String> {
    sessions
        .iter()
        .map(|session| {
            let mut line = format!(
                "{}  {} {} {:<9} {}",
                session.id,
                session.library,
                session.attachment_key,
                session.state,
                format_timestamp(session.updated_at)
            );
            if let Some(error) = &session.last_error {
                line.push_str("  ");
                line.push_str(error);
            }
            line
        })
        .collect()
}
