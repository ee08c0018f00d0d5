//! In-process fake of the remote service for engine tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use crate::api::{
    ApiError, ApiResult, Deletions, FailedWrite, Fetched, RemoteGroup, SyncApi,
    UploadAuthorization, UploadRequest, VersionManifest, WriteResult,
};
use crate::models::{LibraryIdentifier, ObjectType};

#[derive(Default)]
struct LibraryState {
    version: i64,
    objects: BTreeMap<(ObjectType, String), Value>,
    deleted: Vec<(i64, ObjectType, String)>,
}

#[derive(Default)]
pub struct FakeState {
    libraries: BTreeMap<LibraryIdentifier, LibraryState>,
    pub groups: BTreeMap<i64, RemoteGroup>,
    /// Transient failures returned by the next calls, any endpoint.
    pub transient_failures: usize,
    /// Whole-batch 412 responses returned by the next submissions.
    pub precondition_failures: usize,
    pub submissions: Vec<(LibraryIdentifier, ObjectType, Vec<Value>)>,
    pub authorizations: VecDeque<UploadAuthorization>,
    pub authorized: Vec<(String, UploadRequest)>,
    pub registered: Vec<(String, String)>,
    pub fetch_calls: usize,
}

impl FakeState {
    fn library(&mut self, library: LibraryIdentifier) -> &mut LibraryState {
        self.libraries.entry(library).or_default()
    }

    fn take_transient(&mut self) -> ApiResult<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(ApiError::Status {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    /// Stores an object as the server's copy, bumping the library version.
    pub fn put(&mut self, library: LibraryIdentifier, object_type: ObjectType, mut object: Value) -> i64 {
        let state = self.library(library);
        state.version += 1;
        let version = state.version;
        let key = object["key"].as_str().unwrap_or_default().to_string();
        object["version"] = json!(version);
        state.objects.insert((object_type, key), object);
        version
    }

    pub fn remove(&mut self, library: LibraryIdentifier, object_type: ObjectType, key: &str) {
        let state = self.library(library);
        state.version += 1;
        let version = state.version;
        state.objects.remove(&(object_type, key.to_string()));
        state.deleted.push((version, object_type, key.to_string()));
    }

    pub fn object(&self, library: LibraryIdentifier, object_type: ObjectType, key: &str) -> Option<Value> {
        self.libraries
            .get(&library)
            .and_then(|state| state.objects.get(&(object_type, key.to_string())))
            .cloned()
    }

    pub fn version(&self, library: LibraryIdentifier) -> i64 {
        self.libraries.get(&library).map_or(0, |state| state.version)
    }
}

/// Fake [`SyncApi`] backed by in-memory state.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
    /// When set, `group_versions` waits for one permit.
    gate: Option<Arc<Semaphore>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            state: Arc::default(),
            gate: Some(gate),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

fn merge_params(existing: Option<Value>, params: &Value) -> Value {
    let mut object = match existing {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Value::Object(params) = params {
        for (key, value) in params {
            object.insert(key.clone(), value.clone());
        }
    }
    Value::Object(object)
}

#[async_trait]
impl SyncApi for FakeApi {
    async fn group_versions(&self) -> ApiResult<BTreeMap<i64, i64>> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let mut state = self.state();
        state.take_transient()?;
        Ok(state
            .groups
            .values()
            .map(|group| (group.id, group.version))
            .collect())
    }

    async fn group(&self, group_id: i64) -> ApiResult<RemoteGroup> {
        let mut state = self.state();
        state.take_transient()?;
        state.groups.get(&group_id).cloned().ok_or(ApiError::Status {
            status: 404,
            message: format!("group {group_id}"),
        })
    }

    async fn versions(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        since: i64,
    ) -> ApiResult<Fetched<VersionManifest>> {
        let mut state = self.state();
        state.take_transient()?;
        let library = state.library(library);
        if since > 0 && library.version <= since {
            return Ok(Fetched::Unchanged);
        }
        let versions = library
            .objects
            .iter()
            .filter(|((kind, _), _)| *kind == object_type)
            .filter_map(|((_, key), object)| {
                let version = object["version"].as_i64()?;
                (version > since).then(|| (key.clone(), version))
            })
            .collect();
        Ok(Fetched::Changed(VersionManifest {
            versions,
            last_modified_version: library.version,
        }))
    }

    async fn fetch_objects(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
    ) -> ApiResult<Vec<Value>> {
        let mut state = self.state();
        state.take_transient()?;
        state.fetch_calls += 1;
        let library = state.library(library);
        Ok(keys
            .iter()
            .filter_map(|key| library.objects.get(&(object_type, key.clone())).cloned())
            .collect())
    }

    async fn deletions(
        &self,
        library: LibraryIdentifier,
        since: i64,
    ) -> ApiResult<Fetched<Deletions>> {
        let mut state = self.state();
        state.take_transient()?;
        let library = state.library(library);
        if since > 0 && library.version <= since {
            return Ok(Fetched::Unchanged);
        }
        let mut deletions = Deletions {
            last_modified_version: library.version,
            ..Deletions::default()
        };
        for (version, object_type, key) in &library.deleted {
            if *version <= since {
                continue;
            }
            let list = match object_type {
                ObjectType::Collection => &mut deletions.collections,
                ObjectType::Search => &mut deletions.searches,
                ObjectType::Item => &mut deletions.items,
            };
            list.push(key.clone());
        }
        Ok(Fetched::Changed(deletions))
    }

    async fn submit(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        params: &[Value],
        since_version: i64,
    ) -> ApiResult<WriteResult> {
        let mut state = self.state();
        state.take_transient()?;
        if state.precondition_failures > 0 {
            state.precondition_failures -= 1;
            return Err(ApiError::PreconditionFailed);
        }
        state
            .submissions
            .push((library, object_type, params.to_vec()));

        let lib = state.library(library);
        if since_version < lib.version {
            return Err(ApiError::PreconditionFailed);
        }
        lib.version += 1;
        let version = lib.version;

        let mut result = WriteResult {
            last_modified_version: version,
            ..WriteResult::default()
        };
        for (index, param) in params.iter().enumerate() {
            let Some(key) = param["key"].as_str() else {
                result.failed.push(FailedWrite {
                    index,
                    key: None,
                    code: 400,
                    message: "missing key".to_string(),
                });
                continue;
            };
            let slot = (object_type, key.to_string());
            let mut object = merge_params(lib.objects.remove(&slot), param);
            object["version"] = json!(version);
            lib.objects.insert(slot, object);
            result.successful.push((index, key.to_string(), version));
        }
        Ok(result)
    }

    async fn delete(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
        since_version: i64,
    ) -> ApiResult<i64> {
        let mut state = self.state();
        state.take_transient()?;
        let lib = state.library(library);
        if since_version < lib.version {
            return Err(ApiError::PreconditionFailed);
        }
        lib.version += 1;
        let version = lib.version;
        for key in keys {
            lib.objects.remove(&(object_type, key.clone()));
            lib.deleted.push((version, object_type, key.clone()));
        }
        Ok(version)
    }

    async fn authorize_upload(
        &self,
        _library: LibraryIdentifier,
        key: &str,
        request: &UploadRequest,
    ) -> ApiResult<UploadAuthorization> {
        let mut state = self.state();
        state.take_transient()?;
        state.authorized.push((key.to_string(), request.clone()));
        Ok(state
            .authorizations
            .pop_front()
            .unwrap_or(UploadAuthorization::Exists))
    }

    async fn register_upload(
        &self,
        _library: LibraryIdentifier,
        key: &str,
        upload_key: &str,
    ) -> ApiResult<()> {
        let mut state = self.state();
        state.take_transient()?;
        state
            .registered
            .push((key.to_string(), upload_key.to_string()));
        Ok(())
    }
}
