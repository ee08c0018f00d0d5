//! Collection model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::remote;
use super::{CollectionChanges, LibraryIdentifier, ObjectType, SyncMeta, Syncable};

/// Content of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionData {
    pub name: String,
    pub parent_key: Option<String>,
    pub trash: bool,
    pub relations: BTreeMap<String, Vec<String>>,
}

/// A named container of items, optionally nested under another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub key: String,
    pub library: LibraryIdentifier,
    pub meta: SyncMeta,
    pub data: CollectionData,
}

/// Collection as returned by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCollection {
    pub key: String,
    pub version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "remote::optional_key")]
    pub parent_collection: Option<String>,
    #[serde(default, deserialize_with = "remote::truthy")]
    pub deleted: bool,
    #[serde(default, deserialize_with = "remote::relations")]
    pub relations: BTreeMap<String, Vec<String>>,
}

impl Collection {
    /// A collection created locally by the user.
    #[must_use]
    pub fn new_local(library: LibraryIdentifier, key: String, name: impl Into<String>) -> Self {
        Self {
            key,
            library,
            meta: SyncMeta::new_local(CollectionChanges::all().bits()),
            data: CollectionData {
                name: name.into(),
                ..CollectionData::default()
            },
        }
    }
}

impl Syncable for Collection {
    type Changes = CollectionChanges;
    type Data = CollectionData;
    type Remote = RemoteCollection;

    const OBJECT_TYPE: ObjectType = ObjectType::Collection;

    fn from_parts(
        key: String,
        library: LibraryIdentifier,
        meta: SyncMeta,
        data: CollectionData,
    ) -> Self {
        Self {
            key,
            library,
            meta,
            data,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn library(&self) -> LibraryIdentifier {
        self.library
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn data(&self) -> &CollectionData {
        &self.data
    }

    fn parent_key(&self) -> Option<&str> {
        self.data.parent_key.as_deref()
    }

    fn remote_key(remote: &RemoteCollection) -> &str {
        &remote.key
    }

    fn remote_version(remote: &RemoteCollection) -> i64 {
        remote.version
    }

    fn sync_from(&mut self, remote: &RemoteCollection) -> CollectionChanges {
        let mut changed = CollectionChanges::empty();
        if self.data.name != remote.name {
            self.data.name.clone_from(&remote.name);
            changed |= CollectionChanges::NAME;
        }
        if self.data.parent_key != remote.parent_collection {
            self.data.parent_key.clone_from(&remote.parent_collection);
            changed |= CollectionChanges::PARENT;
        }
        if self.data.trash != remote.deleted {
            self.data.trash = remote.deleted;
            changed |= CollectionChanges::TRASH;
        }
        if self.data.relations != remote.relations {
            self.data.relations.clone_from(&remote.relations);
            changed |= CollectionChanges::RELATIONS;
        }
        changed
    }

    fn update_fields(&self, changes: CollectionChanges, params: &mut Map<String, Value>) {
        if changes.contains(CollectionChanges::NAME) {
            params.insert("name".to_string(), Value::from(self.data.name.clone()));
        }
        if changes.contains(CollectionChanges::PARENT) {
            let parent = self
                .data
                .parent_key
                .clone()
                .map_or(Value::Bool(false), Value::from);
            params.insert("parentCollection".to_string(), parent);
        }
        if changes.contains(CollectionChanges::TRASH) {
            params.insert("deleted".to_string(), Value::Bool(self.data.trash));
        }
        if changes.contains(CollectionChanges::RELATIONS) {
            params.insert(
                "relations".to_string(),
                remote::relations_value(&self.data.relations),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, SyncState};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(value: Value) -> RemoteCollection {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn from_remote_is_synced() {
        let collection = Collection::from_remote(
            LibraryIdentifier::MY_LIBRARY,
            &remote(json!({"key": "AAAA2222", "version": 7, "name": "Papers", "parentCollection": false})),
        );
        assert_eq!(collection.meta.version, 7);
        assert_eq!(collection.meta.sync_state, SyncState::Synced);
        assert_eq!(collection.data.name, "Papers");
        assert_eq!(collection.data.parent_key, None);
    }

    #[test]
    fn sync_from_reports_only_differing_parts() {
        let mut collection = Collection::from_remote(
            LibraryIdentifier::MY_LIBRARY,
            &remote(json!({"key": "AAAA2222", "version": 7, "name": "Papers"})),
        );
        let changed = collection.sync_from(&remote(
            json!({"key": "AAAA2222", "version": 8, "name": "Papers", "parentCollection": "BBBB3333"}),
        ));
        assert_eq!(changed, CollectionChanges::PARENT);
        assert_eq!(collection.data.parent_key.as_deref(), Some("BBBB3333"));
    }

    #[test]
    fn update_params_carry_changed_parts_only() {
        let mut collection = Collection::from_remote(
            LibraryIdentifier::MY_LIBRARY,
            &remote(json!({"key": "AAAA2222", "version": 7, "name": "Papers"})),
        );
        collection.data.name = "Reading".to_string();
        collection.mark_dirty(CollectionChanges::NAME, ChangeType::User);

        assert_eq!(
            collection.update_params(),
            json!({"key": "AAAA2222", "version": 7, "name": "Reading"})
        );
    }

    #[test]
    fn new_collection_pushes_everything() {
        let collection = Collection::new_local(
            LibraryIdentifier::MY_LIBRARY,
            "CCCC4444".to_string(),
            "Inbox",
        );
        let params = collection.update_params();
        assert_eq!(params["parentCollection"], json!(false));
        assert_eq!(params["deleted"], json!(false));
        assert_eq!(params["name"], json!("Inbox"));
    }
}
