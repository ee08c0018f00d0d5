//! Conflict resolution between incoming remote data and local state.

use serde::{Deserialize, Serialize};

use super::tracker;
use crate::models::{
    ConflictKind, FieldMask, LibraryIdentifier, ObjectType, SyncConflict, Syncable,
};

/// How remote data is applied over local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The server is ground truth; local edits and tombstones are discarded.
    PreferRemote,
    /// Locally changed objects are left untouched and reported as conflicts.
    PreferLocalIfConflicting,
}

/// What a successful apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    /// Raw mask of the parts that differed from the local copy.
    Updated(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Remote version is older than the local one.
    StaleRemote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Write `object` to the store.
    Applied { object: T, applied: Applied },
    /// Local copy already matches; nothing to write.
    Unchanged,
    Skipped(SkipReason),
}

/// A remote update refused because of local changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: String,
    pub kind: ConflictKind,
    pub local_version: i64,
    pub remote_version: Option<i64>,
}

impl Conflict {
    /// Queue record for this conflict.
    #[must_use]
    pub fn into_record(
        self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        now_ms: i64,
    ) -> SyncConflict {
        SyncConflict {
            id: uuid::Uuid::now_v7().to_string(),
            library,
            object_type,
            key: self.key,
            kind: self.kind,
            local_version: self.local_version,
            remote_version: self.remote_version,
            recorded_at: now_ms,
        }
    }
}

/// Decides how `remote` lands on `local` under `policy`.
///
/// Never mutates `local`; the merged copy is returned for the caller to write.
pub fn apply<T: Syncable>(
    library: LibraryIdentifier,
    remote: &T::Remote,
    local: Option<&T>,
    policy: ConflictPolicy,
) -> Result<Resolution<T>, Conflict> {
    let remote_version = T::remote_version(remote);

    let Some(local) = local else {
        return Ok(Resolution::Applied {
            object: T::from_remote(library, remote),
            applied: Applied::Created,
        });
    };

    let meta = local.meta();
    if meta.is_changed() && policy == ConflictPolicy::PreferLocalIfConflicting {
        return Err(Conflict {
            key: local.key().to_string(),
            kind: if meta.deleted {
                ConflictKind::ItemDeleted
            } else {
                ConflictKind::ItemChanged
            },
            local_version: meta.version,
            remote_version: Some(remote_version),
        });
    }

    if !meta.is_changed() && remote_version < meta.version {
        return Ok(Resolution::Skipped(SkipReason::StaleRemote));
    }

    let mut merged = local.clone();
    let differed = merged.sync_from(remote);
    let merged_meta = merged.meta_mut();
    tracker::mark_synced(merged_meta, remote_version);
    if differed.bits() != 0 {
        // A remote change supersedes any pending retry bookkeeping
        merged_meta.last_sync_date = None;
    }

    if &merged == local {
        return Ok(Resolution::Unchanged);
    }
    Ok(Resolution::Applied {
        object: merged,
        applied: Applied::Updated(differed.bits()),
    })
}
