//! Change tracking: per-object sync state, changed-field mask and retry bookkeeping.

use async_trait::async_trait;

use crate::config::DelayTable;
use crate::db::requests::{ensure_library, insert_placeholder, load_meta, save_meta};
use crate::db::{DbRequest, StoreContext};
use crate::error::Result;
use crate::models::{ChangeType, LibraryIdentifier, ObjectType, SyncMeta, SyncState};

/// Adds `bits` to the pending changes.
///
/// A `sync` origin never replaces a pending `user` origin and bits are only
/// ever added, never removed.
pub fn mark_dirty(meta: &mut SyncMeta, bits: u32, origin: ChangeType) {
    meta.changed |= bits;
    if meta.sync_state != SyncState::New {
        meta.sync_state = SyncState::Dirty;
    }
    if !(origin == ChangeType::Sync && meta.change_type == ChangeType::User) {
        meta.change_type = origin;
    }
}

/// Records that the object matches server `version`.
pub fn mark_synced(meta: &mut SyncMeta, version: i64) {
    meta.version = version;
    meta.sync_state = SyncState::Synced;
    meta.change_type = ChangeType::Sync;
    meta.changed = 0;
    meta.deleted = false;
    meta.sync_retries = 0;
}

/// Counts one more failed attempt at reconciling the object.
pub fn record_failure(meta: &mut SyncMeta, now_ms: i64) {
    meta.sync_retries = meta.sync_retries.saturating_add(1);
    meta.last_sync_date = Some(now_ms);
}

/// Whether the backoff for the last failure has elapsed.
#[must_use]
pub fn is_due_for_retry(meta: &SyncMeta, now_ms: i64, delays: &DelayTable) -> bool {
    let Some(last) = meta.last_sync_date else {
        return true;
    };
    if meta.sync_retries == 0 {
        return true;
    }
    let index = usize::try_from(meta.sync_retries - 1).unwrap_or(usize::MAX);
    let wait = i64::try_from(delays.delay(index).as_millis()).unwrap_or(i64::MAX);
    now_ms >= last.saturating_add(wait)
}

/// State after a resync request for one key, or `None` when the key is left
/// as is. Missing keys become placeholders; synced objects become outdated.
#[must_use]
pub fn resync_transition(current: Option<&SyncMeta>, now_ms: i64) -> Option<SyncMeta> {
    let Some(meta) = current else {
        return Some(SyncMeta::placeholder(now_ms));
    };
    if meta.sync_state != SyncState::Synced {
        return None;
    }
    let mut next = meta.clone();
    next.sync_state = SyncState::Outdated;
    next.change_type = ChangeType::Sync;
    record_failure(&mut next, now_ms);
    Some(next)
}

/// Flags keys for re-fetch after the server reported them invalid or a fetch
/// failed. Returns the keys whose state actually changed.
///
/// Running it twice with the same keys leaves the same state as running it
/// once.
pub struct MarkForResyncRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for MarkForResyncRequest {
    type Output = Vec<String>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<String>> {
        ensure_library(ctx.conn(), self.library).await?;

        let mut touched = Vec::new();
        for key in &self.keys {
            let current = load_meta(ctx.conn(), self.library, self.object_type, key).await?;
            let Some(next) = resync_transition(current.as_ref(), self.now_ms) else {
                continue;
            };
            if current.is_some() {
                save_meta(ctx.conn(), self.library, self.object_type, key, &next).await?;
            } else {
                insert_placeholder(ctx.conn(), self.library, self.object_type, key, &next).await?;
            }
            touched.push(key.clone());
        }

        if !touched.is_empty() {
            tracing::debug!(
                library = %self.library,
                object_type = %self.object_type,
                count = touched.len(),
                "Marked objects for resync"
            );
        }
        ctx.notify(
            self.library,
            self.object_type,
            touched.clone(),
            ChangeType::Sync,
        );
        Ok(touched)
    }
}
