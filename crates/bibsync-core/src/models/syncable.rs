//! Capability shared by every per-library syncable object.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{ChangeType, FieldMask, LibraryIdentifier, ObjectType, SyncMeta, SyncState};
use crate::sync::tracker;

/// An object that carries version, sync state and a changed-field mask.
///
/// Concrete types keep their content in a serializable `Data` payload and
/// their bookkeeping in [`SyncMeta`]; the store persists the two separately.
pub trait Syncable: Clone + PartialEq + Send + Sync + 'static {
    /// Typed changed-field flag set.
    type Changes: FieldMask;
    /// Content payload stored as JSON.
    type Data: Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync;
    /// Remote representation returned by the API.
    type Remote: DeserializeOwned + Send + Sync;

    const OBJECT_TYPE: ObjectType;

    fn from_parts(key: String, library: LibraryIdentifier, meta: SyncMeta, data: Self::Data)
        -> Self;

    fn key(&self) -> &str;
    fn library(&self) -> LibraryIdentifier;
    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;
    fn data(&self) -> &Self::Data;

    /// Key of the containing object (parent collection or parent item).
    fn parent_key(&self) -> Option<&str>;

    fn remote_key(remote: &Self::Remote) -> &str;
    fn remote_version(remote: &Self::Remote) -> i64;

    /// Merges remote content sub-part by sub-part and returns the parts that
    /// actually differed. Derived fields are recomputed afterwards.
    fn sync_from(&mut self, remote: &Self::Remote) -> Self::Changes;

    /// Partial-update parameters covering only the parts in `changes`.
    fn update_fields(&self, changes: Self::Changes, params: &mut Map<String, Value>);

    /// Clears per-part bookkeeping after `pushed` was acknowledged.
    fn clear_pushed(&mut self, _pushed: Self::Changes) {}

    fn changes(&self) -> Self::Changes {
        Self::Changes::from_bits_truncate(self.meta().changed)
    }

    /// Flags local edits on the given parts.
    fn mark_dirty(&mut self, changes: Self::Changes, origin: ChangeType) {
        tracker::mark_dirty(self.meta_mut(), changes.bits(), origin);
    }

    /// Builds a fresh local copy of a remote object.
    fn from_remote(library: LibraryIdentifier, remote: &Self::Remote) -> Self {
        let mut object = Self::from_parts(
            Self::remote_key(remote).to_string(),
            library,
            SyncMeta::synced(Self::remote_version(remote)),
            Self::Data::default(),
        );
        object.sync_from(remote);
        object
    }

    /// Parameters for the next push. New objects carry every part.
    fn update_params(&self) -> Value {
        let meta = self.meta();
        let changes = if meta.sync_state == SyncState::New || meta.version == 0 {
            Self::Changes::EVERYTHING
        } else {
            self.changes()
        };

        let mut params = Map::new();
        params.insert("key".to_string(), Value::from(self.key()));
        params.insert("version".to_string(), Value::from(meta.version));
        self.update_fields(changes, &mut params);
        Value::Object(params)
    }
}
