//! Store requests, grouped by the table they mostly touch.
//!
//! Helpers in this module run on a connection that already holds the
//! surrounding transaction; they never open one themselves.

mod conflicts;
mod libraries;
mod objects;
mod uploads;

pub use conflicts::{ReadConflictKeysRequest, ReadConflictsRequest, ResolveConflictRequest};
pub use libraries::{
    DeleteGroupRequest, EnsureLibraryRequest, ReadLibrariesRequest, ReadLibraryVersionRequest,
    ReadVersionRequest, SetVersionRequest, StoreGroupRequest, VersionSlot,
};
pub use objects::{
    ApplyRemoteDeletionsRequest, ApplyReport, DeleteObjectRequest, DeletionReport,
    EditObjectRequest, MarkPushedRequest, ObjectStateCount, PushedObject,
    ReadLocalVersionsRequest, ReadObjectRequest, ReadObjectsRequest, ReadPushQueueRequest,
    ReadStateCountsRequest, RecordFailuresRequest, RemoveObjectsRequest, SaveObjectRequest,
    StoreRemoteObjectsRequest,
};
pub use uploads::{
    ClaimCompletedSessionRequest, ClaimCompletedSessionsRequest, ClaimUploadSessionsRequest, DeleteUploadSessionRequest,
    InsertUploadSessionRequest, ReadUploadSessionRequest, ReadUploadSessionsRequest,
    UpdateUploadSessionRequest,
};

pub(crate) use libraries::ensure_library;
pub(crate) use objects::{insert_placeholder, load_meta, save_meta};

use libsql::Row;

use crate::error::Result;
use crate::models::{ChangeType, SyncMeta, SyncState};

/// Reads the seven bookkeeping columns starting at `offset`:
/// version, sync state, change type, changed mask, tombstone, retries, last sync date.
pub(crate) fn meta_from_row(row: &Row, offset: i32) -> Result<SyncMeta> {
    let sync_state: String = row.get(offset + 1)?;
    let change_type: String = row.get(offset + 2)?;
    let changed: i64 = row.get(offset + 3)?;
    let deleted: i64 = row.get(offset + 4)?;
    let retries: i64 = row.get(offset + 5)?;

    Ok(SyncMeta {
        version: row.get(offset)?,
        sync_state: sync_state.parse::<SyncState>()?,
        change_type: change_type.parse::<ChangeType>()?,
        changed: u32::try_from(changed).unwrap_or_default(),
        deleted: deleted != 0,
        sync_retries: u32::try_from(retries).unwrap_or_default(),
        last_sync_date: row.get::<Option<i64>>(offset + 6)?,
    })
}
