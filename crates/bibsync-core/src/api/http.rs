//! reqwest implementation of [`SyncApi`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{
    ApiError, ApiResult, Deletions, FailedWrite, Fetched, RemoteGroup, SyncApi, UploadAuthorization,
    UploadRequest, UploadTarget, VersionManifest, WriteResult,
};
use crate::config::EngineConfig;
use crate::models::{LibraryIdentifier, ObjectType};
use crate::util::is_http_url;

const LAST_MODIFIED_VERSION: &str = "Last-Modified-Version";
const IF_MODIFIED_SINCE_VERSION: &str = "If-Modified-Since-Version";
const IF_UNMODIFIED_SINCE_VERSION: &str = "If-Unmodified-Since-Version";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the versioned REST API.
#[derive(Clone)]
pub struct HttpSyncApi {
    base_url: String,
    api_key: String,
    user_id: i64,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpSyncApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpSyncApi")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl HttpSyncApi {
    pub fn new(config: &EngineConfig) -> ApiResult<Self> {
        let base_url = config.api_base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(ApiError::InvalidConfiguration(
                "base URL must include http:// or https://".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            user_id: config.user_id,
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }

    fn library_url(&self, library: LibraryIdentifier) -> String {
        match library {
            LibraryIdentifier::Custom(_) => format!("{}/users/{}", self.base_url, self.user_id),
            LibraryIdentifier::Group(id) => format!("{}/groups/{id}", self.base_url),
        }
    }

    fn objects_url(&self, library: LibraryIdentifier, object_type: ObjectType) -> String {
        format!("{}/{}", self.library_url(library), object_type.api_path())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_response(status, &body))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> ApiResult<T> {
        let response = self.send(self.client.get(url)).await?;
        Ok(response.json::<T>().await?)
    }

    fn file_url(&self, library: LibraryIdentifier, key: &str) -> String {
        format!(
            "{}/items/{}/file",
            self.library_url(library),
            urlencoding::encode(key)
        )
    }
}

fn last_modified_version(headers: &HeaderMap) -> ApiResult<i64> {
    headers
        .get(LAST_MODIFIED_VERSION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| ApiError::InvalidPayload(format!("missing {LAST_MODIFIED_VERSION} header")))
}

fn joined_keys(keys: &[String]) -> String {
    keys.iter()
        .map(|key| urlencoding::encode(key).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

fn authorization_form(request: &UploadRequest) -> [(&'static str, String); 4] {
    [
        ("hash", request.content_hash.clone()),
        ("filename", request.filename.clone()),
        ("filesize", request.size.to_string()),
        ("mtime", request.mtime_ms.to_string()),
    ]
}

/// Object payloads may come wrapped as `{key, version, data}`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(mut data)) => {
                for field in ["key", "version"] {
                    if let Some(value) = map.remove(field) {
                        data.entry(field).or_insert(value);
                    }
                }
                Value::Object(data)
            }
            Some(other) => {
                map.insert("data".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    successful: BTreeMap<String, Value>,
    #[serde(default)]
    unchanged: BTreeMap<String, String>,
    #[serde(default)]
    failed: BTreeMap<String, FailedBody>,
}

#[derive(Debug, Deserialize)]
struct FailedBody {
    key: Option<String>,
    code: u16,
    #[serde(default)]
    message: String,
}

fn parse_index(raw: &str) -> ApiResult<usize> {
    raw.parse::<usize>()
        .map_err(|_| ApiError::InvalidPayload(format!("invalid batch index {raw}")))
}

fn parse_write_response(body: WriteResponse, last_modified_version: i64) -> ApiResult<WriteResult> {
    let mut result = WriteResult {
        last_modified_version,
        ..WriteResult::default()
    };
    for (index, object) in body.successful {
        let object = unwrap_envelope(object);
        let key = object
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::InvalidPayload("successful write without key".to_string()))?
            .to_string();
        let version = object
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or(last_modified_version);
        result.successful.push((parse_index(&index)?, key, version));
    }
    for (index, key) in body.unchanged {
        result.unchanged.push((parse_index(&index)?, key));
    }
    for (index, failed) in body.failed {
        result.failed.push(FailedWrite {
            index: parse_index(&index)?,
            key: failed.key,
            code: failed.code,
            message: failed.message,
        });
    }
    result.successful.sort_by_key(|(index, ..)| *index);
    result.unchanged.sort_by_key(|(index, _)| *index);
    result.failed.sort_by_key(|failed| failed.index);
    Ok(result)
}

fn parse_authorization(body: Value) -> ApiResult<UploadAuthorization> {
    let exists = match body.get("exists") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().unwrap_or_default() != 0,
        _ => false,
    };
    if exists {
        return Ok(UploadAuthorization::Exists);
    }
    serde_json::from_value::<UploadTarget>(body)
        .map(UploadAuthorization::New)
        .map_err(|error| ApiError::InvalidPayload(format!("upload authorization: {error}")))
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn group_versions(&self) -> ApiResult<BTreeMap<i64, i64>> {
        let url = format!(
            "{}/users/{}/groups?format=versions",
            self.base_url, self.user_id
        );
        let raw: BTreeMap<String, i64> = self.get_json(&url).await?;
        raw.into_iter()
            .map(|(id, version)| {
                id.parse::<i64>()
                    .map(|id| (id, version))
                    .map_err(|_| ApiError::InvalidPayload(format!("invalid group id {id}")))
            })
            .collect()
    }

    async fn group(&self, group_id: i64) -> ApiResult<RemoteGroup> {
        let url = format!("{}/groups/{group_id}", self.base_url);
        let value: Value = self.get_json(&url).await?;
        serde_json::from_value(unwrap_envelope(value))
            .map_err(|error| ApiError::InvalidPayload(error.to_string()))
    }

    async fn versions(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        since: i64,
    ) -> ApiResult<Fetched<VersionManifest>> {
        let url = format!(
            "{}?since={since}&format=versions",
            self.objects_url(library, object_type)
        );
        let response = self
            .send(
                self.client
                    .get(url)
                    .header(IF_MODIFIED_SINCE_VERSION, since.to_string()),
            )
            .await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::Unchanged);
        }
        let last_modified_version = last_modified_version(response.headers())?;
        let versions = response.json::<BTreeMap<String, i64>>().await?;
        Ok(Fetched::Changed(VersionManifest {
            versions,
            last_modified_version,
        }))
    }

    async fn fetch_objects(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
    ) -> ApiResult<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}?{}={}",
            self.objects_url(library, object_type),
            object_type.key_param(),
            joined_keys(keys)
        );
        let values: Vec<Value> = self.get_json(&url).await?;
        Ok(values.into_iter().map(unwrap_envelope).collect())
    }

    async fn deletions(
        &self,
        library: LibraryIdentifier,
        since: i64,
    ) -> ApiResult<Fetched<Deletions>> {
        let url = format!("{}/deleted?since={since}", self.library_url(library));
        let response = self
            .send(
                self.client
                    .get(url)
                    .header(IF_MODIFIED_SINCE_VERSION, since.to_string()),
            )
            .await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::Unchanged);
        }
        let last_modified_version = last_modified_version(response.headers())?;
        let mut deletions = response.json::<Deletions>().await?;
        deletions.last_modified_version = last_modified_version;
        Ok(Fetched::Changed(deletions))
    }

    async fn submit(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        params: &[Value],
        since_version: i64,
    ) -> ApiResult<WriteResult> {
        let response = self
            .send(
                self.client
                    .post(self.objects_url(library, object_type))
                    .header(IF_UNMODIFIED_SINCE_VERSION, since_version.to_string())
                    .json(params),
            )
            .await?;
        let last_modified_version = last_modified_version(response.headers())?;
        let body = response.json::<WriteResponse>().await?;
        parse_write_response(body, last_modified_version)
    }

    async fn delete(
        &self,
        library: LibraryIdentifier,
        object_type: ObjectType,
        keys: &[String],
        since_version: i64,
    ) -> ApiResult<i64> {
        let url = format!(
            "{}?{}={}",
            self.objects_url(library, object_type),
            object_type.key_param(),
            joined_keys(keys)
        );
        let response = self
            .send(
                self.client
                    .delete(url)
                    .header(IF_UNMODIFIED_SINCE_VERSION, since_version.to_string()),
            )
            .await?;
        last_modified_version(response.headers())
    }

    async fn authorize_upload(
        &self,
        library: LibraryIdentifier,
        key: &str,
        request: &UploadRequest,
    ) -> ApiResult<UploadAuthorization> {
        let response = self
            .send(
                self.client
                    .post(self.file_url(library, key))
                    .header("If-None-Match", "*")
                    .form(&authorization_form(request)),
            )
            .await?;
        parse_authorization(response.json::<Value>().await?)
    }

    async fn register_upload(
        &self,
        library: LibraryIdentifier,
        key: &str,
        upload_key: &str,
    ) -> ApiResult<()> {
        self.send(
            self.client
                .post(self.file_url(library, key))
                .header("If-None-Match", "*")
                .form(&[("upload", upload_key)]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn api() -> HttpSyncApi {
        HttpSyncApi::new(&EngineConfig::new(
            "https://api.example.org/",
            "secret",
            7,
            "/tmp",
        ))
        .unwrap()
    }

    #[test]
    fn library_urls_use_user_or_group_prefix() {
        let api = api();
        assert_eq!(
            api.objects_url(LibraryIdentifier::MY_LIBRARY, ObjectType::Item),
            "https://api.example.org/users/7/items"
        );
        assert_eq!(
            api.file_url(LibraryIdentifier::Group(3), "AB CD"),
            "https://api.example.org/groups/3/items/AB%20CD/file"
        );
        assert!(!format!("{api:?}").contains("secret"));
    }

    #[test]
    fn rejects_base_url_without_scheme() {
        let config = EngineConfig::new("api.example.org", "secret", 7, "/tmp");
        assert!(matches!(
            HttpSyncApi::new(&config),
            Err(ApiError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn envelopes_are_flattened() {
        let value = unwrap_envelope(json!({
            "key": "K1",
            "version": 4,
            "library": {"type": "user"},
            "data": {"itemType": "book", "title": "T"}
        }));
        assert_eq!(
            value,
            json!({"key": "K1", "version": 4, "itemType": "book", "title": "T"})
        );
    }

    #[test]
    fn write_response_is_split_per_object() {
        let body: WriteResponse = serde_json::from_value(json!({
            "successful": {"0": {"key": "A", "version": 12}, "2": {"key": "C"}},
            "unchanged": {"1": "B"},
            "failed": {"3": {"key": "D", "code": 412, "message": "Item has been modified"}}
        }))
        .unwrap();

        let result = parse_write_response(body, 13).unwrap();
        assert_eq!(
            result.successful,
            vec![(0, "A".to_string(), 12), (2, "C".to_string(), 13)]
        );
        assert_eq!(result.unchanged, vec![(1, "B".to_string())]);
        assert_eq!(result.failed[0].code, 412);
        assert_eq!(result.failed[0].index, 3);
    }

    #[test]
    fn authorization_is_exists_or_target() {
        assert_eq!(
            parse_authorization(json!({"exists": 1})).unwrap(),
            UploadAuthorization::Exists
        );
        let UploadAuthorization::New(target) = parse_authorization(json!({
            "url": "https://files.example.org/upload",
            "uploadKey": "u-1",
            "headers": {"content-type": "application/pdf"}
        }))
        .unwrap() else {
            panic!("expected target");
        };
        assert_eq!(target.method, "POST");
        assert_eq!(target.upload_key, "u-1");
        assert!(parse_authorization(json!({})).is_err());
    }

    #[test]
    fn authorization_form_is_urlencoded() {
        let upload = UploadRequest {
            content_hash: "ab".repeat(16),
            filename: "a b&c.pdf".to_string(),
            size: 3,
            mtime_ms: 1_000,
        };
        let api = api();
        let request = api
            .client
            .post(api.file_url(LibraryIdentifier::MY_LIBRARY, "ABCD2345"))
            .form(&authorization_form(&upload))
            .build()
            .unwrap();

        assert_eq!(
            request.headers()[reqwest::header::CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        let body = request.body().and_then(|body| body.as_bytes()).unwrap();
        assert_eq!(
            std::str::from_utf8(body).unwrap(),
            format!("hash={}&filename=a+b%26c.pdf&filesize=3&mtime=1000", "ab".repeat(16))
        );
    }
}
