//! Version diffing: decides which keys need a full fetch.

use std::collections::{BTreeMap, BTreeSet};

use super::tracker;
use crate::config::DelayTable;
use crate::models::{Library, LibraryIdentifier, SyncMeta, SyncState};

/// Locally known version and bookkeeping of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersion {
    pub key: String,
    pub meta: SyncMeta,
}

/// Keys of `manifest` that need a full fetch.
///
/// With `force_all` every manifest key is returned. Otherwise a key is kept
/// when it is missing locally, when its version differs, or when the local
/// object is not in the `synced` state.
#[must_use]
pub fn diff(
    manifest: &BTreeMap<String, i64>,
    local: &[LocalVersion],
    force_all: bool,
) -> Vec<String> {
    if force_all {
        return manifest.keys().cloned().collect();
    }

    let local: BTreeMap<&str, &SyncMeta> = local
        .iter()
        .map(|object| (object.key.as_str(), &object.meta))
        .collect();

    manifest
        .iter()
        .filter(|(key, version)| match local.get(key.as_str()) {
            None => true,
            Some(meta) => meta.sync_state != SyncState::Synced || meta.version != **version,
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Outdated objects and placeholders whose retry backoff has elapsed.
///
/// These are fetched even when an incremental manifest does not list them.
#[must_use]
pub fn resync_candidates(local: &[LocalVersion], now_ms: i64, delays: &DelayTable) -> Vec<String> {
    local
        .iter()
        .filter(|object| object.meta.needs_resync())
        .filter(|object| tracker::is_due_for_retry(&object.meta, now_ms, delays))
        .map(|object| object.key.clone())
        .collect()
}

/// Result of comparing the accessible groups with the local libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryDiff {
    /// Groups whose metadata must be fetched.
    pub fetch: Vec<i64>,
    /// Local groups that are no longer accessible and must be purged.
    pub remove: Vec<LibraryIdentifier>,
}

/// Group-level variant of [`diff`] over `{group id -> version}`.
///
/// The custom library is never part of the removal set.
#[must_use]
pub fn diff_groups(
    manifest: &BTreeMap<i64, i64>,
    local: &[Library],
    force_all: bool,
) -> LibraryDiff {
    let known: BTreeMap<i64, i64> = local
        .iter()
        .filter_map(|library| {
            library
                .identifier
                .group_id()
                .map(|id| (id, library.version))
        })
        .collect();

    let fetch = manifest
        .iter()
        .filter(|(id, version)| force_all || known.get(id) != Some(version))
        .map(|(id, _)| *id)
        .collect();

    let accessible: BTreeSet<i64> = manifest.keys().copied().collect();
    let remove = known
        .keys()
        .filter(|id| !accessible.contains(id))
        .map(|id| LibraryIdentifier::Group(*id))
        .collect();

    LibraryDiff { fetch, remove }
}
