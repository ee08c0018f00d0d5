use bibsync_core::clock::{Clock, SystemClock};
use bibsync_core::db::requests::{ReadConflictsRequest, ResolveConflictRequest};
use bibsync_core::db::LibraryStore;
use bibsync_core::models::{ConflictResolution, SyncConflict};

use crate::commands::common::{conflict_to_item, format_conflict_lines, parse_library, ConflictItem};
use crate::error::CliError;

pub async fn list_conflicts(
    store: &LibraryStore,
    library: Option<&str>,
) -> Result<Vec<SyncConflict>, CliError> {
    let library = library.map(parse_library).transpose()?;
    Ok(store.read(ReadConflictsRequest { library }).await?)
}

pub async fn run_conflicts_list(
    store: &LibraryStore,
    library: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = list_conflicts(store, library).await?;

    if as_json {
        let items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts queued.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts, SystemClock.now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    store: &LibraryStore,
    id: &str,
    resolution: &str,
) -> Result<(), CliError> {
    let resolution = resolution.parse::<ConflictResolution>()?;
    let conflict = store
        .perform(ResolveConflictRequest {
            id: id.trim().to_string(),
            resolution,
        })
        .await?;

    let verb = match resolution {
        ConflictResolution::KeepLocal => "kept local edits for",
        ConflictResolution::AcceptRemote => "accepted server copy of",
    };
    println!(
        "Resolved: {verb} {} {} in {}. Run `bibsync sync` to apply.",
        conflict.object_type, conflict.key, conflict.library
    );
    Ok(())
}
