//! Syncable object rows: local edits, remote applies and push bookkeeping.

use std::marker::PhantomData;

use async_trait::async_trait;
use libsql::{Connection, Row};
use serde_json::Value;

use super::conflicts::{delete_conflicts, insert_conflict};
use super::libraries::{ensure_library, set_version};
use super::{meta_from_row, VersionSlot};
use crate::db::{DbRequest, StoreContext};
use crate::error::{Error, Result};
use crate::models::{
    ChangeType, ConflictKind, FieldMask, LibraryIdentifier, ObjectType, SyncConflict, SyncMeta,
    SyncState, Syncable,
};
use crate::sync::diff::LocalVersion;
use crate::sync::resolver::{self, Applied, Conflict, ConflictPolicy, Resolution};
use crate::sync::tracker;

const OBJECT_COLUMNS: &str = "key, version, sync_state, change_type, changed_fields, deleted, \
                              sync_retries, last_sync_date, payload";

fn object_from_row<T: Syncable>(library: LibraryIdentifier, row: &Row) -> Result<T> {
    let key: String = row.get(0)?;
    let meta = meta_from_row(row, 1)?;
    let payload: String = row.get(8)?;
    let data = serde_json::from_str(&payload)?;
    Ok(T::from_parts(key, library, meta, data))
}

async fn load<T: Syncable>(
    conn: &Connection,
    library: LibraryIdentifier,
    key: &str,
) -> Result<Option<T>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {OBJECT_COLUMNS} FROM objects
                 WHERE library_key = ? AND object_type = ? AND key = ?"
            ),
            [library.as_key().as_str(), T::OBJECT_TYPE.as_str(), key],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(object_from_row(library, &row)?)),
        None => Ok(None),
    }
}

async fn load_all<T: Syncable>(
    conn: &Connection,
    library: LibraryIdentifier,
    filter: &str,
) -> Result<Vec<T>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {OBJECT_COLUMNS} FROM objects o
                 WHERE o.library_key = ? AND o.object_type = ? {filter}
                 ORDER BY o.parent_key IS NOT NULL, o.key"
            ),
            [library.as_key().as_str(), T::OBJECT_TYPE.as_str()],
        )
        .await?;
    let mut objects = Vec::new();
    while let Some(row) = rows.next().await? {
        objects.push(object_from_row(library, &row)?);
    }
    Ok(objects)
}

async fn save<T: Syncable>(conn: &Connection, object: &T) -> Result<()> {
    let meta = object.meta();
    let payload = serde_json::to_string(object.data())?;
    write_row(
        conn,
        object.library(),
        T::OBJECT_TYPE,
        object.key(),
        meta,
        object.parent_key().map(str::to_string),
        payload,
    )
    .await
}

async fn write_row(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    key: &str,
    meta: &SyncMeta,
    parent_key: Option<String>,
    payload: String,
) -> Result<()> {
    conn.execute(
        "INSERT INTO objects (
            library_key, object_type, key, version, sync_state, change_type,
            changed_fields, deleted, sync_retries, last_sync_date, parent_key, payload
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(library_key, object_type, key) DO UPDATE SET
            version = excluded.version,
            sync_state = excluded.sync_state,
            change_type = excluded.change_type,
            changed_fields = excluded.changed_fields,
            deleted = excluded.deleted,
            sync_retries = excluded.sync_retries,
            last_sync_date = excluded.last_sync_date,
            parent_key = excluded.parent_key,
            payload = excluded.payload",
        libsql::params![
            library.as_key(),
            object_type.as_str(),
            key,
            meta.version,
            meta.sync_state.as_str(),
            meta.change_type.as_str(),
            i64::from(meta.changed),
            i64::from(meta.deleted),
            i64::from(meta.sync_retries),
            meta.last_sync_date,
            parent_key,
            payload
        ],
    )
    .await?;
    Ok(())
}

/// Bookkeeping of one object, tombstones included.
pub(crate) async fn load_meta(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    key: &str,
) -> Result<Option<SyncMeta>> {
    let mut rows = conn
        .query(
            "SELECT version, sync_state, change_type, changed_fields, deleted, sync_retries, last_sync_date
             FROM objects WHERE library_key = ? AND object_type = ? AND key = ?",
            [library.as_key().as_str(), object_type.as_str(), key],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(meta_from_row(&row, 0)?)),
        None => Ok(None),
    }
}

/// Rewrites bookkeeping without touching the payload.
pub(crate) async fn save_meta(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    key: &str,
    meta: &SyncMeta,
) -> Result<()> {
    conn.execute(
        "UPDATE objects SET
            version = ?, sync_state = ?, change_type = ?, changed_fields = ?,
            deleted = ?, sync_retries = ?, last_sync_date = ?
         WHERE library_key = ? AND object_type = ? AND key = ?",
        libsql::params![
            meta.version,
            meta.sync_state.as_str(),
            meta.change_type.as_str(),
            i64::from(meta.changed),
            i64::from(meta.deleted),
            i64::from(meta.sync_retries),
            meta.last_sync_date,
            library.as_key(),
            object_type.as_str(),
            key
        ],
    )
    .await?;
    Ok(())
}

/// Inserts an empty object that the next pull fills in.
pub(crate) async fn insert_placeholder(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    key: &str,
    meta: &SyncMeta,
) -> Result<()> {
    write_row(conn, library, object_type, key, meta, None, "{}".to_string()).await
}

pub(super) async fn remove_rows(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    keys: &[String],
) -> Result<u64> {
    let mut removed = 0;
    for key in keys {
        removed += conn
            .execute(
                "DELETE FROM objects WHERE library_key = ? AND object_type = ? AND key = ?",
                [library.as_key().as_str(), object_type.as_str(), key.as_str()],
            )
            .await?;
    }
    delete_conflicts(conn, library, object_type, keys).await?;
    Ok(removed)
}

/// One object, tombstones included.
pub struct ReadObjectRequest<T> {
    pub library: LibraryIdentifier,
    pub key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReadObjectRequest<T> {
    pub fn new(library: LibraryIdentifier, key: impl Into<String>) -> Self {
        Self {
            library,
            key: key.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Syncable> DbRequest for ReadObjectRequest<T> {
    type Output = Option<T>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Option<T>> {
        load(ctx.conn(), self.library, &self.key).await
    }
}

/// Objects visible to the application: tombstones are excluded.
pub struct ReadObjectsRequest<T> {
    pub library: LibraryIdentifier,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReadObjectsRequest<T> {
    pub const fn new(library: LibraryIdentifier) -> Self {
        Self {
            library,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Syncable> DbRequest for ReadObjectsRequest<T> {
    type Output = Vec<T>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<T>> {
        load_all(ctx.conn(), self.library, "AND o.deleted = 0").await
    }
}

/// Key, version and bookkeeping of every local object of one type.
pub struct ReadLocalVersionsRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
}

#[async_trait]
impl DbRequest for ReadLocalVersionsRequest {
    type Output = Vec<LocalVersion>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<LocalVersion>> {
        let mut rows = ctx
            .conn()
            .query(
                "SELECT key, version, sync_state, change_type, changed_fields, deleted, sync_retries, last_sync_date
                 FROM objects WHERE library_key = ? AND object_type = ?
                 ORDER BY key",
                [self.library.as_key().as_str(), self.object_type.as_str()],
            )
            .await?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(LocalVersion {
                key: row.get(0)?,
                meta: meta_from_row(&row, 1)?,
            });
        }
        Ok(versions)
    }
}

/// Objects the next push must carry, excluding those with an open conflict.
pub struct ReadPushQueueRequest<T> {
    pub library: LibraryIdentifier,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReadPushQueueRequest<T> {
    pub const fn new(library: LibraryIdentifier) -> Self {
        Self {
            library,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Syncable> DbRequest for ReadPushQueueRequest<T> {
    type Output = Vec<T>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<T>> {
        load_all(
            ctx.conn(),
            self.library,
            "AND (o.sync_state = 'new' OR o.changed_fields != 0 OR o.deleted = 1)
             AND NOT EXISTS (
                SELECT 1 FROM sync_conflicts c
                WHERE c.library_key = o.library_key
                  AND c.object_type = o.object_type
                  AND c.key = o.key
             )",
        )
        .await
    }
}

/// Writes a whole object, e.g. one created by the user.
pub struct SaveObjectRequest<T> {
    pub object: T,
    pub origin: ChangeType,
}

#[async_trait]
impl<T: Syncable> DbRequest for SaveObjectRequest<T> {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        ensure_library(ctx.conn(), self.object.library()).await?;
        save(ctx.conn(), &self.object).await?;
        ctx.notify(
            self.object.library(),
            T::OBJECT_TYPE,
            vec![self.object.key().to_string()],
            self.origin,
        );
        Ok(())
    }
}

/// Applies a user edit and flags the parts the edit reports as changed.
///
/// An edit reporting no changed parts is still stored when it altered the
/// object, without queuing a push.
pub struct EditObjectRequest<T, F> {
    pub library: LibraryIdentifier,
    pub key: String,
    pub edit: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> EditObjectRequest<T, F>
where
    T: Syncable,
    F: Fn(&mut T) -> T::Changes + Send + Sync,
{
    pub fn new(library: LibraryIdentifier, key: impl Into<String>, edit: F) -> Self {
        Self {
            library,
            key: key.into(),
            edit,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> DbRequest for EditObjectRequest<T, F>
where
    T: Syncable,
    F: Fn(&mut T) -> T::Changes + Send + Sync,
{
    type Output = T;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<T> {
        let mut object: T = load(ctx.conn(), self.library, &self.key)
            .await?
            .filter(|object: &T| !object.meta().deleted)
            .ok_or_else(|| Error::NotFound(format!("{} {}", T::OBJECT_TYPE, self.key)))?;

        let original = object.clone();
        let changes = (self.edit)(&mut object);
        if changes.bits() == 0 {
            // Local-only state such as attachment bookkeeping: stored, never pushed
            if object != original {
                save(ctx.conn(), &object).await?;
                ctx.notify(
                    self.library,
                    T::OBJECT_TYPE,
                    vec![self.key.clone()],
                    ChangeType::Sync,
                );
            }
            return Ok(object);
        }
        object.mark_dirty(changes, ChangeType::User);
        save(ctx.conn(), &object).await?;
        ctx.notify(
            self.library,
            T::OBJECT_TYPE,
            vec![self.key.clone()],
            ChangeType::User,
        );
        Ok(object)
    }
}

/// Tombstones an object so the next push deletes it remotely.
///
/// Objects the server never saw are removed right away.
pub struct DeleteObjectRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub key: String,
}

#[async_trait]
impl DbRequest for DeleteObjectRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        let conn = ctx.conn();
        let mut meta = load_meta(conn, self.library, self.object_type, &self.key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}", self.object_type, self.key)))?;

        if meta.sync_state == SyncState::New {
            remove_rows(conn, self.library, self.object_type, &[self.key.clone()]).await?;
        } else {
            meta.deleted = true;
            tracker::mark_dirty(&mut meta, 0, ChangeType::User);
            save_meta(conn, self.library, self.object_type, &self.key, &meta).await?;
        }
        ctx.notify(
            self.library,
            self.object_type,
            vec![self.key.clone()],
            ChangeType::User,
        );
        Ok(())
    }
}

/// Drops rows after the server acknowledged their deletion.
pub struct RemoveObjectsRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
}

#[async_trait]
impl DbRequest for RemoveObjectsRequest {
    type Output = u64;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<u64> {
        let removed = remove_rows(ctx.conn(), self.library, self.object_type, &self.keys).await?;
        ctx.notify(
            self.library,
            self.object_type,
            self.keys.clone(),
            ChangeType::Sync,
        );
        Ok(removed)
    }
}

/// Outcome of applying one batch of remote objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<String>,
    pub conflicts: Vec<SyncConflict>,
}

impl ApplyReport {
    #[must_use]
    pub fn applied(&self) -> usize {
        self.created.len() + self.updated.len()
    }
}

/// Merges fetched remote objects into the store under a conflict policy.
///
/// Refused objects are queued as conflicts and get a retry recorded.
pub struct StoreRemoteObjectsRequest<T: Syncable> {
    pub library: LibraryIdentifier,
    pub remotes: Vec<T::Remote>,
    pub policy: ConflictPolicy,
    pub now_ms: i64,
}

#[async_trait]
impl<T: Syncable> DbRequest for StoreRemoteObjectsRequest<T> {
    type Output = ApplyReport;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<ApplyReport> {
        let conn = ctx.conn();
        ensure_library(conn, self.library).await?;

        let mut report = ApplyReport::default();
        for remote in &self.remotes {
            let key = T::remote_key(remote).to_string();
            let local: Option<T> = load(conn, self.library, &key).await?;

            match resolver::apply(self.library, remote, local.as_ref(), self.policy) {
                Ok(Resolution::Applied { object, applied }) => {
                    save(conn, &object).await?;
                    match applied {
                        Applied::Created => report.created.push(key),
                        Applied::Updated(_) => report.updated.push(key),
                    }
                }
                Ok(Resolution::Unchanged) => report.unchanged.push(key),
                Ok(Resolution::Skipped(reason)) => {
                    tracing::debug!(key = %key, ?reason, "Skipped remote object");
                    report.skipped.push(key);
                }
                Err(conflict) => {
                    let record =
                        queue_conflict(conn, self.library, T::OBJECT_TYPE, conflict, self.now_ms)
                            .await?;
                    report.conflicts.push(record);
                }
            }
        }

        if self.policy == ConflictPolicy::PreferRemote {
            let applied: Vec<String> = report
                .created
                .iter()
                .chain(&report.updated)
                .cloned()
                .collect();
            delete_conflicts(conn, self.library, T::OBJECT_TYPE, &applied).await?;
        }

        let mut keys = report.created.clone();
        keys.extend(report.updated.iter().cloned());
        ctx.notify(self.library, T::OBJECT_TYPE, keys, ChangeType::Sync);
        Ok(report)
    }
}

async fn queue_conflict(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    conflict: Conflict,
    now_ms: i64,
) -> Result<SyncConflict> {
    let record = conflict.into_record(library, object_type, now_ms);
    insert_conflict(conn, &record).await?;
    if let Some(mut meta) = load_meta(conn, library, object_type, &record.key).await? {
        tracker::record_failure(&mut meta, now_ms);
        save_meta(conn, library, object_type, &record.key, &meta).await?;
    }
    tracing::warn!(
        library = %library,
        object_type = %object_type,
        key = %record.key,
        kind = %record.kind,
        "Queued sync conflict"
    );
    Ok(record)
}

/// Outcome of applying remote deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub removed: Vec<String>,
    pub conflicts: Vec<SyncConflict>,
}

/// Applies keys the server reported deleted.
///
/// Under `PreferLocalIfConflicting` locally changed objects are kept and
/// queued as `item_deleted` conflicts.
pub struct ApplyRemoteDeletionsRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
    pub policy: ConflictPolicy,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for ApplyRemoteDeletionsRequest {
    type Output = DeletionReport;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<DeletionReport> {
        let conn = ctx.conn();
        let mut report = DeletionReport::default();

        for key in &self.keys {
            let Some(meta) = load_meta(conn, self.library, self.object_type, key).await? else {
                continue;
            };
            let keep_local = self.policy == ConflictPolicy::PreferLocalIfConflicting
                && meta.is_changed()
                && !meta.deleted;
            if keep_local {
                let conflict = Conflict {
                    key: key.clone(),
                    kind: ConflictKind::ItemDeleted,
                    local_version: meta.version,
                    remote_version: None,
                };
                let record =
                    queue_conflict(conn, self.library, self.object_type, conflict, self.now_ms)
                        .await?;
                report.conflicts.push(record);
            } else {
                report.removed.push(key.clone());
            }
        }

        remove_rows(conn, self.library, self.object_type, &report.removed).await?;
        ctx.notify(
            self.library,
            self.object_type,
            report.removed.clone(),
            ChangeType::Sync,
        );
        Ok(report)
    }
}

/// One object acknowledged by a push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedObject {
    pub key: String,
    /// Parameters that were sent.
    pub params: Value,
    /// Version assigned by the server.
    pub version: i64,
}

/// Records acknowledged pushes.
///
/// An object is marked synced only when its current parameters still equal
/// what was sent; edits made while the push was in flight stay dirty.
pub struct MarkPushedRequest<T> {
    pub library: LibraryIdentifier,
    pub objects: Vec<PushedObject>,
    /// Library version reported by the server for the whole submission.
    pub library_version: Option<i64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MarkPushedRequest<T> {
    pub const fn new(
        library: LibraryIdentifier,
        objects: Vec<PushedObject>,
        library_version: Option<i64>,
    ) -> Self {
        Self {
            library,
            objects,
            library_version,
            _marker: PhantomData,
        }
    }
}

fn without_version(params: &Value) -> Value {
    let mut params = params.clone();
    if let Some(map) = params.as_object_mut() {
        map.remove("version");
    }
    params
}

#[async_trait]
impl<T: Syncable> DbRequest for MarkPushedRequest<T> {
    type Output = Vec<String>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<String>> {
        let conn = ctx.conn();
        let mut synced = Vec::new();

        for pushed in &self.objects {
            let Some(mut object) = load::<T>(conn, self.library, &pushed.key).await? else {
                continue;
            };
            let unchanged_since_push =
                without_version(&object.update_params()) == without_version(&pushed.params);

            if unchanged_since_push {
                let pushed_changes = object.changes();
                object.clear_pushed(pushed_changes);
                tracker::mark_synced(object.meta_mut(), pushed.version);
                synced.push(pushed.key.clone());
            } else {
                let meta = object.meta_mut();
                meta.version = pushed.version;
                if meta.sync_state == SyncState::New {
                    meta.sync_state = SyncState::Dirty;
                }
                tracing::debug!(key = %pushed.key, "Object changed during push; keeping it dirty");
            }
            save(conn, &object).await?;
        }

        if let Some(version) = self.library_version {
            set_version(
                conn,
                self.library,
                VersionSlot::Objects(T::OBJECT_TYPE),
                version,
            )
            .await?;
        }
        ctx.notify(self.library, T::OBJECT_TYPE, synced.clone(), ChangeType::Sync);
        Ok(synced)
    }
}

/// Counts one more failed attempt for each key.
pub struct RecordFailuresRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub keys: Vec<String>,
    pub now_ms: i64,
}

#[async_trait]
impl DbRequest for RecordFailuresRequest {
    type Output = ();

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<()> {
        let conn = ctx.conn();
        for key in &self.keys {
            if let Some(mut meta) = load_meta(conn, self.library, self.object_type, key).await? {
                tracker::record_failure(&mut meta, self.now_ms);
                save_meta(conn, self.library, self.object_type, key, &meta).await?;
            }
        }
        Ok(())
    }
}

/// Number of objects per library, type and sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStateCount {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub sync_state: SyncState,
    pub count: i64,
}

pub struct ReadStateCountsRequest;

#[async_trait]
impl DbRequest for ReadStateCountsRequest {
    type Output = Vec<ObjectStateCount>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<ObjectStateCount>> {
        let mut rows = ctx
            .conn()
            .query(
                "SELECT library_key, object_type, sync_state, COUNT(*) FROM objects
                 GROUP BY library_key, object_type, sync_state
                 ORDER BY library_key, object_type, sync_state",
                (),
            )
            .await?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await? {
            let library: String = row.get(0)?;
            let object_type: String = row.get(1)?;
            let sync_state: String = row.get(2)?;
            counts.push(ObjectStateCount {
                library: library.parse()?,
                object_type: object_type.parse()?,
                sync_state: sync_state.parse()?,
                count: row.get(3)?,
            });
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::requests::{ReadConflictsRequest, ReadVersionRequest};
    use crate::db::LibraryStore;
    use crate::models::{Collection, Item, ItemChanges, RemoteItem};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LIBRARY: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn remote_item(key: &str, version: i64, title: &str) -> RemoteItem {
        serde_json::from_value(json!({
            "key": key,
            "version": version,
            "itemType": "book",
            "title": title
        }))
        .unwrap()
    }

    async fn seeded(remotes: Vec<RemoteItem>) -> LibraryStore {
        let store = LibraryStore::open_in_memory().await.unwrap();
        store
            .perform(StoreRemoteObjectsRequest::<Item> {
                library: LIBRARY,
                remotes,
                policy: ConflictPolicy::PreferRemote,
                now_ms: 1,
            })
            .await
            .unwrap();
        store
    }

    async fn edit_title(store: &LibraryStore, key: &str, title: &'static str) -> Item {
        store
            .perform(EditObjectRequest::new(LIBRARY, key, move |item: &mut Item| {
                item.set_field("title", title);
                item.changes()
            }))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_objects_are_created_then_unchanged() {
        let store = seeded(vec![remote_item("A1", 3, "One")]).await;

        let report = store
            .perform(StoreRemoteObjectsRequest::<Item> {
                library: LIBRARY,
                remotes: vec![remote_item("A1", 3, "One")],
                policy: ConflictPolicy::PreferLocalIfConflicting,
                now_ms: 2,
            })
            .await
            .unwrap();
        assert_eq!(report.unchanged, vec!["A1".to_string()]);
        assert_eq!(report.applied(), 0);

        let item = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "A1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.data.derived.display_title, "One");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_remote_leaves_local_untouched() {
        let store = seeded(vec![remote_item("X1", 5, "Original")]).await;
        let edited = edit_title(&store, "X1", "Mine").await;
        assert_eq!(edited.changes(), ItemChanges::FIELDS);

        let report = store
            .perform(StoreRemoteObjectsRequest::<Item> {
                library: LIBRARY,
                remotes: vec![remote_item("X1", 6, "Theirs")],
                policy: ConflictPolicy::PreferLocalIfConflicting,
                now_ms: 50,
            })
            .await
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, ConflictKind::ItemChanged);

        let item = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "X1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.data.field("title"), Some("Mine"));
        assert_eq!(item.meta.version, 5);
        assert_eq!(item.meta.sync_retries, 1);

        let queued = store
            .read(ReadPushQueueRequest::<Item>::new(LIBRARY))
            .await
            .unwrap();
        assert!(queued.is_empty());
        let conflicts = store
            .read(ReadConflictsRequest { library: None })
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_pushed_keeps_later_edits_dirty() {
        let store = seeded(vec![
            remote_item("A1", 3, "One"),
            remote_item("B2", 3, "Two"),
        ])
        .await;
        let a = edit_title(&store, "A1", "One edited").await;
        let b = edit_title(&store, "B2", "Two edited").await;
        let pushed = vec![
            PushedObject {
                key: "A1".to_string(),
                params: a.update_params(),
                version: 4,
            },
            PushedObject {
                key: "B2".to_string(),
                params: b.update_params(),
                version: 4,
            },
        ];
        // Edit made while the push was in flight
        edit_title(&store, "B2", "Two edited again").await;

        let synced = store
            .perform(MarkPushedRequest::<Item>::new(LIBRARY, pushed, Some(4)))
            .await
            .unwrap();
        assert_eq!(synced, vec!["A1".to_string()]);

        let queue = store
            .read(ReadPushQueueRequest::<Item>::new(LIBRARY))
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].key, "B2");
        assert_eq!(queue[0].meta.version, 4);

        let a = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "A1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.meta.sync_state, SyncState::Synced);
        assert!(a.data.fields.iter().all(|field| !field.changed));

        let version = store
            .read(ReadVersionRequest {
                library: LIBRARY,
                slot: VersionSlot::Objects(ObjectType::Item),
            })
            .await
            .unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_tombstones_synced_and_drops_new_objects() {
        let store = seeded(vec![remote_item("A1", 3, "One")]).await;
        store
            .perform(SaveObjectRequest {
                object: Collection::new_local(LIBRARY, "C1".to_string(), "Local only"),
                origin: ChangeType::User,
            })
            .await
            .unwrap();

        for (object_type, key) in [(ObjectType::Item, "A1"), (ObjectType::Collection, "C1")] {
            store
                .perform(DeleteObjectRequest {
                    library: LIBRARY,
                    object_type,
                    key: key.to_string(),
                })
                .await
                .unwrap();
        }

        let visible = store
            .read(ReadObjectsRequest::<Item>::new(LIBRARY))
            .await
            .unwrap();
        assert!(visible.is_empty());
        let tombstone = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "A1"))
            .await
            .unwrap()
            .unwrap();
        assert!(tombstone.meta.deleted);
        assert_eq!(tombstone.meta.change_type, ChangeType::User);

        let collection = store
            .read(ReadObjectRequest::<Collection>::new(LIBRARY, "C1"))
            .await
            .unwrap();
        assert!(collection.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_deletions_respect_local_changes() {
        let store = seeded(vec![
            remote_item("A1", 3, "One"),
            remote_item("B2", 3, "Two"),
        ])
        .await;
        edit_title(&store, "B2", "Mine").await;

        let report = store
            .perform(ApplyRemoteDeletionsRequest {
                library: LIBRARY,
                object_type: ObjectType::Item,
                keys: vec!["A1".to_string(), "B2".to_string(), "ZZ".to_string()],
                policy: ConflictPolicy::PreferLocalIfConflicting,
                now_ms: 9,
            })
            .await
            .unwrap();

        assert_eq!(report.removed, vec!["A1".to_string()]);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, ConflictKind::ItemDeleted);
        assert_eq!(report.conflicts[0].remote_version, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_counts_group_by_state() {
        let store = seeded(vec![
            remote_item("A1", 3, "One"),
            remote_item("B2", 3, "Two"),
        ])
        .await;
        edit_title(&store, "B2", "Mine").await;

        let counts = store.read(ReadStateCountsRequest).await.unwrap();
        assert_eq!(
            counts,
            vec![
                ObjectStateCount {
                    library: LIBRARY,
                    object_type: ObjectType::Item,
                    sync_state: SyncState::Dirty,
                    count: 1,
                },
                ObjectStateCount {
                    library: LIBRARY,
                    object_type: ObjectType::Item,
                    sync_state: SyncState::Synced,
                    count: 1,
                },
            ]
        );
    }
}
