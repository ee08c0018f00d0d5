use std::collections::BTreeMap;

use bibsync_core::db::requests::{
    ReadConflictsRequest, ReadLibrariesRequest, ReadLibraryVersionRequest, ReadStateCountsRequest,
    ReadUploadSessionsRequest,
};
use bibsync_core::db::LibraryStore;
use bibsync_core::models::{SyncState, UploadState};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct LibraryStatus {
    pub library: String,
    pub name: String,
    pub version: i64,
    pub editable: bool,
    pub files_editable: bool,
    /// Object counts keyed by sync state.
    pub objects: BTreeMap<String, i64>,
    pub conflicts: usize,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub libraries: Vec<LibraryStatus>,
    pub pending_uploads: usize,
    pub failed_uploads: usize,
}

pub async fn collect_status(store: &LibraryStore) -> Result<StoreStatus, CliError> {
    let libraries = store.read(ReadLibrariesRequest).await?;
    let counts = store.read(ReadStateCountsRequest).await?;
    let conflicts = store.read(ReadConflictsRequest { library: None }).await?;
    let sessions = store.read(ReadUploadSessionsRequest { state: None }).await?;

    let mut status = StoreStatus::default();
    for library in libraries {
        let version = store
            .read(ReadLibraryVersionRequest {
                library: library.identifier,
            })
            .await?;
        let mut objects = BTreeMap::new();
        for count in counts.iter().filter(|count| count.library == library.identifier) {
            *objects
                .entry(count.sync_state.as_str().to_string())
                .or_insert(0) += count.count;
        }
        status.libraries.push(LibraryStatus {
            library: library.identifier.to_string(),
            name: library.name,
            version,
            editable: library.metadata_editable,
            files_editable: library.files_editable,
            objects,
            conflicts: conflicts
                .iter()
                .filter(|conflict| conflict.library == library.identifier)
                .count(),
        });
    }
    status.pending_uploads = sessions
        .iter()
        .filter(|session| matches!(session.state, UploadState::Pending | UploadState::InFlight))
        .count();
    status.failed_uploads = sessions
        .iter()
        .filter(|session| session.state == UploadState::Failed)
        .count();
    Ok(status)
}

pub fn format_status_lines(status: &StoreStatus) -> Vec<String> {
    let mut lines = Vec::new();
    if status.libraries.is_empty() {
        lines.push("No libraries yet. Run `bibsync sync` first.".to_string());
    }
    for library in &status.libraries {
        let access = match (library.editable, library.files_editable) {
            (true, true) => "read-write",
            (true, false) => "metadata only",
            (false, _) => "read-only",
        };
        let unsynced: i64 = library
            .objects
            .iter()
            .filter(|(state, _)| state.as_str() != SyncState::Synced.as_str())
            .map(|(_, count)| count)
            .sum();
        lines.push(format!(
            "{:<6} {} (v{}, {access}): {} unsynced, {} conflict{}",
            library.library,
            library.name,
            library.version,
            unsynced,
            library.conflicts,
            if library.conflicts == 1 { "" } else { "s" },
        ));
    }
    if status.pending_uploads > 0 || status.failed_uploads > 0 {
        lines.push(format!(
            "Uploads: {} pending, {} failed",
            status.pending_uploads, status.failed_uploads
        ));
    }
    lines
}

pub async fn run_status(store: &LibraryStore, as_json: bool) -> Result<(), CliError> {
    let status = collect_status(store).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}
