//! Saved search model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::remote;
use super::{LibraryIdentifier, ObjectType, SearchChanges, SyncMeta, Syncable};

/// One condition of a saved search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCondition {
    pub condition: String,
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchData {
    pub name: String,
    pub conditions: Vec<SearchCondition>,
    pub trash: bool,
}

/// A saved search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub key: String,
    pub library: LibraryIdentifier,
    pub meta: SyncMeta,
    pub data: SearchData,
}

/// Saved search as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSearch {
    pub key: String,
    pub version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<SearchCondition>,
    #[serde(default, deserialize_with = "remote::truthy")]
    pub deleted: bool,
}

impl Syncable for Search {
    type Changes = SearchChanges;
    type Data = SearchData;
    type Remote = RemoteSearch;

    const OBJECT_TYPE: ObjectType = ObjectType::Search;

    fn from_parts(key: String, library: LibraryIdentifier, meta: SyncMeta, data: SearchData) -> Self {
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

    fn data(&self) -> &SearchData {
        &self.data
    }

    fn parent_key(&self) -> Option<&str> {
        None
    }

    fn remote_key(remote: &RemoteSearch) -> &str {
        &remote.key
    }

    fn remote_version(remote: &RemoteSearch) -> i64 {
        remote.version
    }

    fn sync_from(&mut self, remote: &RemoteSearch) -> SearchChanges {
        let mut changed = SearchChanges::empty();
        if self.data.name != remote.name {
            self.data.name.clone_from(&remote.name);
            changed |= SearchChanges::NAME;
        }
        if self.data.conditions != remote.conditions {
            self.data.conditions.clone_from(&remote.conditions);
            changed |= SearchChanges::CONDITIONS;
        }
        if self.data.trash != remote.deleted {
            self.data.trash = remote.deleted;
            changed |= SearchChanges::TRASH;
        }
        changed
    }

    fn update_fields(&self, changes: SearchChanges, params: &mut Map<String, Value>) {
        if changes.contains(SearchChanges::NAME) {
            params.insert("name".to_string(), Value::from(self.data.name.clone()));
        }
        if changes.contains(SearchChanges::CONDITIONS) {
            let conditions = serde_json::to_value(&self.data.conditions).unwrap_or_default();
            params.insert("conditions".to_string(), conditions);
        }
        if changes.contains(SearchChanges::TRASH) {
            params.insert("deleted".to_string(), Value::Bool(self.data.trash));
        }
    }
}
