//! Conflict queue: conflicts recorded during pulls and their resolution.

use std::collections::BTreeSet;

use async_trait::async_trait;
use libsql::{Connection, Row};

use super::objects::{load_meta, remove_rows, save_meta};
use crate::db::{DbRequest, StoreContext};
use crate::error::{Error, Result};
use crate::models::{
    all_changes, ChangeType, ConflictKind, ConflictResolution, LibraryIdentifier, ObjectType,
    SyncConflict, SyncMeta, SyncState,
};

const CONFLICT_COLUMNS: &str =
    "id, library_key, object_type, key, kind, local_version, remote_version, recorded_at";

fn conflict_from_row(row: &Row) -> Result<SyncConflict> {
    let library: String = row.get(1)?;
    let object_type: String = row.get(2)?;
    let kind: String = row.get(4)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        library: library.parse()?,
        object_type: object_type.parse()?,
        key: row.get(3)?,
        kind: kind.parse()?,
        local_version: row.get(5)?,
        remote_version: row.get::<Option<i64>>(6)?,
        recorded_at: row.get(7)?,
    })
}

/// Queues a conflict. A newer conflict for the same object replaces the old one.
pub(crate) async fn insert_conflict(conn: &Connection, conflict: &SyncConflict) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_conflicts (
            id, library_key, object_type, key, kind, local_version, remote_version, recorded_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(library_key, object_type, key) DO UPDATE SET
            kind = excluded.kind,
            local_version = excluded.local_version,
            remote_version = excluded.remote_version,
            recorded_at = excluded.recorded_at",
        libsql::params![
            conflict.id.clone(),
            conflict.library.as_key(),
            conflict.object_type.as_str(),
            conflict.key.clone(),
            conflict.kind.as_str(),
            conflict.local_version,
            conflict.remote_version,
            conflict.recorded_at
        ],
    )
    .await?;
    Ok(())
}

pub(crate) async fn delete_conflicts(
    conn: &Connection,
    library: LibraryIdentifier,
    object_type: ObjectType,
    keys: &[String],
) -> Result<()> {
    for key in keys {
        conn.execute(
            "DELETE FROM sync_conflicts WHERE library_key = ? AND object_type = ? AND key = ?",
            [library.as_key().as_str(), object_type.as_str(), key.as_str()],
        )
        .await?;
    }
    Ok(())
}

/// Queued conflicts, newest first.
pub struct ReadConflictsRequest {
    /// Restrict to one library; `None` lists every library.
    pub library: Option<LibraryIdentifier>,
}

#[async_trait]
impl DbRequest for ReadConflictsRequest {
    type Output = Vec<SyncConflict>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<Vec<SyncConflict>> {
        let mut rows = match self.library {
            Some(library) => {
                ctx.conn()
                    .query(
                        &format!(
                            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                             WHERE library_key = ? ORDER BY recorded_at DESC, id"
                        ),
                        [library.as_key()],
                    )
                    .await?
            }
            None => {
                ctx.conn()
                    .query(
                        &format!(
                            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                             ORDER BY recorded_at DESC, id"
                        ),
                        (),
                    )
                    .await?
            }
        };

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(conflict_from_row(&row)?);
        }
        Ok(conflicts)
    }
}

/// Keys with an open conflict for one library and object type.
pub struct ReadConflictKeysRequest {
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
}

#[async_trait]
impl DbRequest for ReadConflictKeysRequest {
    type Output = BTreeSet<String>;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<BTreeSet<String>> {
        let mut rows = ctx
            .conn()
            .query(
                "SELECT key FROM sync_conflicts WHERE library_key = ? AND object_type = ?",
                [self.library.as_key().as_str(), self.object_type.as_str()],
            )
            .await?;
        let mut keys = BTreeSet::new();
        while let Some(row) = rows.next().await? {
            keys.insert(row.get::<String>(0)?);
        }
        Ok(keys)
    }
}

/// What resolving a conflict does to the object row.
enum Outcome {
    Save(SyncMeta),
    Remove,
}

fn resolve_meta(conflict: &SyncConflict, resolution: ConflictResolution, meta: &SyncMeta) -> Outcome {
    let mut next = meta.clone();
    match (resolution, conflict.kind, conflict.remote_version) {
        (ConflictResolution::AcceptRemote, ConflictKind::ItemDeleted, None) => {
            return Outcome::Remove;
        }
        (ConflictResolution::AcceptRemote, _, _) => {
            // The next pull refetches the server copy
            next.changed = 0;
            next.deleted = false;
            next.sync_state = SyncState::Outdated;
            next.change_type = ChangeType::Sync;
            next.sync_retries = 0;
            next.last_sync_date = None;
        }
        (ConflictResolution::KeepLocal, ConflictKind::ItemDeleted, None) => {
            // Recreate remotely with every part
            next.version = 0;
            next.sync_state = SyncState::New;
            next.changed = all_changes(conflict.object_type);
            next.change_type = ChangeType::User;
            next.sync_retries = 0;
            next.last_sync_date = None;
        }
        (ConflictResolution::KeepLocal, _, Some(remote_version)) => {
            next.version = remote_version;
            if next.sync_state != SyncState::New {
                next.sync_state = SyncState::Dirty;
            }
            next.change_type = ChangeType::User;
            next.sync_retries = 0;
            next.last_sync_date = None;
        }
        (ConflictResolution::KeepLocal, ConflictKind::ItemChanged, None) => {
            next.change_type = ChangeType::User;
        }
    }
    Outcome::Save(next)
}

/// Applies the user's decision for one queued conflict and dequeues it.
pub struct ResolveConflictRequest {
    pub id: String,
    pub resolution: ConflictResolution,
}

#[async_trait]
impl DbRequest for ResolveConflictRequest {
    type Output = SyncConflict;

    async fn process(&self, ctx: &mut StoreContext<'_>) -> Result<SyncConflict> {
        let conn = ctx.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [self.id.as_str()],
            )
            .await?;
        let conflict = match rows.next().await? {
            Some(row) => conflict_from_row(&row)?,
            None => return Err(Error::NotFound(format!("conflict {}", self.id))),
        };

        let library = conflict.library;
        let object_type = conflict.object_type;
        if let Some(meta) = load_meta(conn, library, object_type, &conflict.key).await? {
            match resolve_meta(&conflict, self.resolution, &meta) {
                Outcome::Save(next) => {
                    save_meta(conn, library, object_type, &conflict.key, &next).await?;
                }
                Outcome::Remove => {
                    remove_rows(conn, library, object_type, &[conflict.key.clone()]).await?;
                }
            }
        }
        conn.execute("DELETE FROM sync_conflicts WHERE id = ?", [self.id.as_str()])
            .await?;

        let origin = match self.resolution {
            ConflictResolution::KeepLocal => ChangeType::User,
            ConflictResolution::AcceptRemote => ChangeType::Sync,
        };
        ctx.notify(library, object_type, vec![conflict.key.clone()], origin);
        tracing::info!(
            key = %conflict.key,
            kind = %conflict.kind,
            resolution = ?self.resolution,
            "Resolved sync conflict"
        );
        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::requests::{
        ApplyRemoteDeletionsRequest, EditObjectRequest, ReadObjectRequest, ReadPushQueueRequest,
        StoreRemoteObjectsRequest,
    };
    use crate::db::LibraryStore;
    use crate::models::{Item, RemoteItem, Syncable};
    use crate::sync::resolver::ConflictPolicy;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LIBRARY: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn remote(version: i64, title: &str) -> RemoteItem {
        serde_json::from_value(json!({
            "key": "X1",
            "version": version,
            "itemType": "book",
            "title": title
        }))
        .unwrap()
    }

    async fn conflicted_store() -> (LibraryStore, SyncConflict) {
        let store = LibraryStore::open_in_memory().await.unwrap();
        store
            .perform(StoreRemoteObjectsRequest::<Item> {
                library: LIBRARY,
                remotes: vec![remote(5, "Original")],
                policy: ConflictPolicy::PreferRemote,
                now_ms: 1,
            })
            .await
            .unwrap();
        store
            .perform(EditObjectRequest::new(LIBRARY, "X1", |item: &mut Item| {
                item.set_field("title", "Mine");
                item.changes()
            }))
            .await
            .unwrap();
        let report = store
            .perform(StoreRemoteObjectsRequest::<Item> {
                library: LIBRARY,
                remotes: vec![remote(6, "Theirs")],
                policy: ConflictPolicy::PreferLocalIfConflicting,
                now_ms: 2,
            })
            .await
            .unwrap();
        let conflict = report.conflicts.into_iter().next().unwrap();
        (store, conflict)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_requeues_the_edit_on_the_remote_version() {
        let (store, conflict) = conflicted_store().await;

        let resolved = store
            .perform(ResolveConflictRequest {
                id: conflict.id.clone(),
                resolution: ConflictResolution::KeepLocal,
            })
            .await
            .unwrap();
        assert_eq!(resolved.key, "X1");

        let queue = store
            .read(ReadPushQueueRequest::<Item>::new(LIBRARY))
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].meta.version, 6);
        assert_eq!(queue[0].data.field("title"), Some("Mine"));
        assert!(store
            .read(ReadConflictsRequest { library: None })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accept_remote_marks_object_outdated() {
        let (store, conflict) = conflicted_store().await;

        store
            .perform(ResolveConflictRequest {
                id: conflict.id,
                resolution: ConflictResolution::AcceptRemote,
            })
            .await
            .unwrap();

        let item = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "X1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.meta.sync_state, SyncState::Outdated);
        assert_eq!(item.meta.changed, 0);
        assert!(store
            .read(ReadPushQueueRequest::<Item>::new(LIBRARY))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accepting_a_remote_deletion_removes_the_object() {
        let (store, conflict) = conflicted_store().await;
        store
            .perform(ResolveConflictRequest {
                id: conflict.id,
                resolution: ConflictResolution::KeepLocal,
            })
            .await
            .unwrap();
        let report = store
            .perform(ApplyRemoteDeletionsRequest {
                library: LIBRARY,
                object_type: ObjectType::Item,
                keys: vec!["X1".to_string()],
                policy: ConflictPolicy::PreferLocalIfConflicting,
                now_ms: 3,
            })
            .await
            .unwrap();
        let deletion = report.conflicts.into_iter().next().unwrap();

        let keys = store
            .read(ReadConflictKeysRequest {
                library: LIBRARY,
                object_type: ObjectType::Item,
            })
            .await
            .unwrap();
        assert!(keys.contains("X1"));

        store
            .perform(ResolveConflictRequest {
                id: deletion.id,
                resolution: ConflictResolution::AcceptRemote,
            })
            .await
            .unwrap();
        let item = store
            .read(ReadObjectRequest::<Item>::new(LIBRARY, "X1"))
            .await
            .unwrap();
        assert!(item.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_conflict_is_not_found() {
        let store = LibraryStore::open_in_memory().await.unwrap();
        let err = store
            .perform(ResolveConflictRequest {
                id: "missing".to_string(),
                resolution: ConflictResolution::KeepLocal,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn keeping_a_locally_deleted_remote_object_recreates_it() {
        let conflict = SyncConflict {
            id: "c".to_string(),
            library: LIBRARY,
            object_type: ObjectType::Collection,
            key: "C1".to_string(),
            kind: ConflictKind::ItemDeleted,
            local_version: 4,
            remote_version: None,
            recorded_at: 1,
        };
        let Outcome::Save(meta) =
            resolve_meta(&conflict, ConflictResolution::KeepLocal, &SyncMeta::synced(4))
        else {
            panic!("expected save");
        };
        assert_eq!(meta.sync_state, SyncState::New);
        assert_eq!(meta.version, 0);
        assert_eq!(meta.changed, all_changes(ObjectType::Collection));
    }
}
