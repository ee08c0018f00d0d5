//! Remote REST API: wire types and the client seam used by the sync engine.

mod error;
mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{ApiError, ApiResult};
pub use http::HttpSyncApi;

use crate::models::{Library, LibraryIdentifier, ObjectType};

/// A conditional response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// The server reported no change since the requested version.
    Unchanged,
    Changed(T),
}

/// `{key -> version}` for one library and object type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionManifest {
    pub versions: BTreeMap<String, i64>,
    /// Library version the manifest was computed at.
    pub last_modified_version: i64,
}

/// Keys deleted on the server since a given version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Deletions {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(skip)]
    pub last_modified_version: i64,
}

impl Deletions {
    #[must_use]
    pub fn keys(&self, object_type: ObjectType) -> &[String] {
        match object_type {
            ObjectType::Collection => &self.collections,
            ObjectType::Search => &self.searches,
            ObjectType::Item => &self.items,
        }
    }
}

/// Group metadata as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGroup {
    pub id: i64,
    pub version: i64,
    pub name: String,
    pub owner: i64,
    #[serde(default)]
    pub admins: Vec<i64>,
    /// `members` or `admins`.
    #[serde(default = "default_library_editing")]
    pub library_editing: String,
    /// `members`, `admins` or `none`.
    #[serde(default = "default_file_editing")]
    pub file_editing: String,
}

fn default_library_editing() -> String {
    "admins".to_string()
}

fn default_file_editing() -> String {
    "none".to_string()
}

impl RemoteGroup {
    /// Library record with permissions evaluated for `user_id`.
    #[must_use]
    pub fn into_library(self, user_id: i64) -> Library {
        let is_admin = self.owner == user_id || self.admins.contains(&user_id);
        let allowed = |policy: &str| match policy {
            "members" => true,
            "admins" => is_admin,
            _ => false,
        };
        Library {
            identifier: LibraryIdentifier::Group(self.id),
            metadata_editable: allowed(&self.library_editing),
            files_editable: allowed(&self.file_editing),
            name: self.name,
            version: self.version,
        }
    }
}

/// One object rejected inside an otherwise accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    /// Position in the submitted batch.
    pub index: usize,
    pub key: Option<String>,
    pub code: u16,
    pub message: String,
}

/// Per-object outcome of a batch submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// `(index, key, new version)` of accepted objects.
    pub successful: Vec<(usize, String, i64)>,
    /// `(index, key)` of objects the server already held as sent.
    pub unchanged: Vec<(usize, String)>,
    pub failed: Vec<FailedWrite>,
    pub last_modified_version: i64,
}

/// File description sent when asking for upload authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRequest {
    /// SHA-256 of the file contents (hex).
    pub content_hash: String,
    pub size: u64,
    pub filename: String,
    pub mtime_ms: i64,
}

/// Pre-signed destination for a new file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub url: String,
    #[serde(default = "default_upload_method")]
    pub method: String,
    /// Token to register the upload with once the transfer is done.
    pub upload_key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_upload_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadAuthorization {
    /// The server already holds a file with the same hash.
    Exists,
    New(UploadTarget),
}

/// Operations the sync engine needs from the remote service.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// `{group id -> version}` of every group the user can access.
    async fn group_versions(&self) -> ApiResult<BTreeMap<i64, i64>>;

    async fn group(&self, group_id: i64) -> ApiResult<RemoteGroup>;

    /// Versions of objects modified after `since`.
    async fn versions(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        since: i64,
    ) -> ApiResult<Fetched<VersionManifest>>;

    /// Full objects for `keys`, one JSON value per object found.
    async fn fetch_objects(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
    ) -> ApiResult<Vec<Value>>;

    async fn deletions(&self, library: LibraryIdentifier, since: i64)
        -> ApiResult<Fetched<Deletions>>;

    /// Submits partial updates; fails with `PreconditionFailed` when the
    /// library moved past `since_version`.
    async fn submit(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        params: &[Value],
        since_version: i64,
    ) -> ApiResult<WriteResult>;

    /// Deletes `keys` and returns the new library version.
    async fn delete(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
        since_version: i64,
    ) -> ApiResult<i64>;

    async fn authorize_upload(
        &self,
        library: LibraryIdentifier,
        key: &str,
        request: &UploadRequest,
    ) -> ApiResult<UploadAuthorization>;

    /// Registers a finished transfer under `upload_key`.
    async fn register_upload(
        &self,
        library: LibraryIdentifier,
        key: &str,
        upload_key: &str,
    ) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_permissions_follow_policy() {
        let group: RemoteGroup = serde_json::from_value(json!({
            "id": 9,
            "version": 3,
            "name": "Lab",
            "owner": 1,
            "admins": [2],
            "libraryEditing": "members",
            "fileEditing": "admins"
        }))
        .unwrap();

        let member = group.clone().into_library(5);
        assert!(member.metadata_editable);
        assert!(!member.files_editable);

        let admin = group.into_library(2);
        assert!(admin.files_editable);
        assert_eq!(admin.identifier, LibraryIdentifier::Group(9));
    }

    #[test]
    fn deletions_are_listed_per_type() {
        let deletions: Deletions = serde_json::from_value(json!({
            "collections": ["C1"],
            "items": ["I1", "I2"],
            "tags": ["ignored"]
        }))
        .unwrap();
        assert_eq!(deletions.keys(ObjectType::Item).len(), 2);
        assert!(deletions.keys(ObjectType::Search).is_empty());
    }
}
