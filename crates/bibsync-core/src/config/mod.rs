//! Engine configuration.
//!
//! Everything the sync engine needs is carried in one explicit
//! [`EngineConfig`] handed to constructors; nothing is read from process-wide
//! state after startup.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const ENV_API_BASE_URL: &str = "BIBSYNC_API_BASE_URL";
const ENV_API_KEY: &str = "BIBSYNC_API_KEY";
const ENV_USER_ID: &str = "BIBSYNC_USER_ID";
const ENV_ATTACHMENTS_DIR: &str = "BIBSYNC_ATTACHMENTS_DIR";
const ENV_SYNC_DELAYS: &str = "BIBSYNC_SYNC_DELAYS";
const ENV_CONFLICT_DELAYS: &str = "BIBSYNC_CONFLICT_DELAYS";
const ENV_BACKGROUND_INTERVAL: &str = "BIBSYNC_BACKGROUND_INTERVAL_SECS";

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_FETCH_CONCURRENCY: usize = 4;
const DEFAULT_DEBOUNCE_MS: u64 = 3_000;

/// Ordered retry delay table consumed by retry index.
///
/// Indices past the end are clamped to the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelayTable(Vec<u64>);

impl DelayTable {
    /// Build a table from delays expressed in seconds.
    #[must_use]
    pub fn from_secs(secs: &[u64]) -> Self {
        Self(secs.iter().map(|value| value.saturating_mul(1_000)).collect())
    }

    /// Build a table from delays expressed in milliseconds.
    #[must_use]
    pub fn from_millis(millis: &[u64]) -> Self {
        Self(millis.to_vec())
    }

    /// Delay for the given zero-based retry index.
    #[must_use]
    pub fn delay(&self, index: usize) -> Duration {
        let millis = self
            .0
            .get(index)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or_default();
        Duration::from_millis(millis)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn parse(raw: &str, name: &str) -> Result<Self> {
        let secs = raw
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                value.parse::<u64>().map_err(|_| {
                    Error::InvalidInput(format!("{name} must be a comma-separated list of seconds"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if secs.is_empty() {
            return Err(Error::InvalidInput(format!("{name} must not be empty")));
        }
        Ok(Self::from_secs(&secs))
    }
}

/// The two named retry tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayIntervals {
    /// General sync retries (transient failures, resync eligibility).
    pub sync: DelayTable,
    /// Conflict-resolution retries (pull-then-retry after a rejected push).
    pub conflict: DelayTable,
}

impl Default for DelayIntervals {
    fn default() -> Self {
        Self {
            sync: DelayTable::from_secs(&[2, 5, 10, 30, 60, 300]),
            conflict: DelayTable::from_secs(&[1, 3, 10, 30]),
        }
    }
}

/// Configuration for one sync engine instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the remote REST API.
    pub api_base_url: String,
    /// API key sent with every request.
    pub api_key: String,
    /// Numeric id of the signed-in user (owner of the custom library).
    pub user_id: i64,
    /// Root directory of the canonical attachment location.
    pub attachments_dir: PathBuf,
    #[serde(default)]
    pub delays: DelayIntervals,
    /// Maximum attempts for a single network step (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Maximum objects per fetch or submission batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum fetch batches in flight within one object-type step.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Window used to coalesce local change notifications.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Optional periodic background sync interval.
    #[serde(default)]
    pub background_interval_secs: Option<u64>,
}

const fn default_max_attempts() -> usize {
    4
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_fetch_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

const fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("attachments_dir", &self.attachments_dir)
            .field("delays", &self.delays)
            .field("max_attempts", &self.max_attempts)
            .field("batch_size", &self.batch_size)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("debounce_ms", &self.debounce_ms)
            .field("background_interval_secs", &self.background_interval_secs)
            .finish()
    }
}

impl EngineConfig {
    /// Create a configuration with default tuning values.
    pub fn new(
        api_base_url: impl Into<String>,
        api_key: impl Into<String>,
        user_id: i64,
        attachments_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            user_id,
            attachments_dir: attachments_dir.into(),
            delays: DelayIntervals::default(),
            max_attempts: default_max_attempts(),
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            background_interval_secs: None,
        }
    }

    /// Load configuration from `BIBSYNC_*` environment variables.
    ///
    /// Returns `Ok(None)` when no variables are set and an error when only a
    /// partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    #[must_use]
    pub fn with_delays(mut self, delays: DelayIntervals) -> Self {
        self.delays = delays;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn background_interval(&self) -> Option<Duration> {
        self.background_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.api_base_url) {
            return Err(Error::InvalidInput(
                "API base URL must include http:// or https://".to_string(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidInput("API key must not be empty".to_string()));
        }
        if self.batch_size == 0 || self.fetch_concurrency == 0 || self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "batch_size, fetch_concurrency and max_attempts must be positive".to_string(),
            ));
        }
        if self.delays.sync.is_empty() || self.delays.conflict.is_empty() {
            return Err(Error::InvalidInput(
                "delay tables must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<EngineConfig>> {
    let api_base_url = normalize_text_option(lookup(ENV_API_BASE_URL));
    let api_key = normalize_text_option(lookup(ENV_API_KEY));
    let user_id = normalize_text_option(lookup(ENV_USER_ID));
    let attachments_dir = normalize_text_option(lookup(ENV_ATTACHMENTS_DIR));

    if api_base_url.is_none() && api_key.is_none() && user_id.is_none() {
        return Ok(None);
    }

    let mut missing = Vec::new();
    if api_base_url.is_none() {
        missing.push(ENV_API_BASE_URL);
    }
    if api_key.is_none() {
        missing.push(ENV_API_KEY);
    }
    if user_id.is_none() {
        missing.push(ENV_USER_ID);
    }
    let (Some(api_base_url), Some(api_key), Some(user_id)) = (api_base_url, api_key, user_id)
    else {
        return Err(Error::InvalidInput(format!(
            "Sync configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    };

    let user_id = user_id
        .parse::<i64>()
        .map_err(|_| Error::InvalidInput(format!("{ENV_USER_ID} must be numeric")))?;
    let attachments_dir = attachments_dir.map_or_else(default_attachments_dir, PathBuf::from);

    let mut config = EngineConfig::new(api_base_url, api_key, user_id, attachments_dir);
    if let Some(raw) = normalize_text_option(lookup(ENV_SYNC_DELAYS)) {
        config.delays.sync = DelayTable::parse(&raw, ENV_SYNC_DELAYS)?;
    }
    if let Some(raw) = normalize_text_option(lookup(ENV_CONFLICT_DELAYS)) {
        config.delays.conflict = DelayTable::parse(&raw, ENV_CONFLICT_DELAYS)?;
    }
    if let Some(raw) = normalize_text_option(lookup(ENV_BACKGROUND_INTERVAL)) {
        let secs = raw.parse::<u64>().map_err(|_| {
            Error::InvalidInput(format!("{ENV_BACKGROUND_INTERVAL} must be numeric"))
        })?;
        config.background_interval_secs = Some(secs);
    }

    config.validate()?;
    Ok(Some(config))
}

fn default_attachments_dir() -> PathBuf {
    env::temp_dir().join("bibsync").join("attachments")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<EngineConfig>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn delay_table_clamps_to_last_entry() {
        let table = DelayTable::from_secs(&[1, 5, 30]);
        assert_eq!(table.delay(0), Duration::from_secs(1));
        assert_eq!(table.delay(2), Duration::from_secs(30));
        assert_eq!(table.delay(9), Duration::from_secs(30));
    }

    #[test]
    fn empty_delay_table_yields_zero() {
        assert_eq!(DelayTable::from_secs(&[]).delay(3), Duration::ZERO);
    }

    #[test]
    fn parse_config_none_returns_none() {
        assert!(parse_from_map(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parse_config_reports_missing_values() {
        let mut map = HashMap::new();
        map.insert(ENV_API_BASE_URL, "https://api.example.com");

        let err = parse_from_map(&map).unwrap_err();
        match err {
            Error::InvalidInput(message) => {
                assert!(message.contains(ENV_API_KEY));
                assert!(message.contains(ENV_USER_ID));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_reads_delay_tables() {
        let mut map = HashMap::new();
        map.insert(ENV_API_BASE_URL, "https://api.example.com/");
        map.insert(ENV_API_KEY, "secret");
        map.insert(ENV_USER_ID, "42");
        map.insert(ENV_ATTACHMENTS_DIR, "/tmp/files");
        map.insert(ENV_SYNC_DELAYS, "1, 2, 4");
        map.insert(ENV_CONFLICT_DELAYS, "7");

        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.user_id, 42);
        assert_eq!(config.attachments_dir, PathBuf::from("/tmp/files"));
        assert_eq!(config.delays.sync.delay(2), Duration::from_secs(4));
        assert_eq!(config.delays.conflict.delay(5), Duration::from_secs(7));
    }

    #[test]
    fn parse_config_rejects_bad_delays() {
        let mut map = HashMap::new();
        map.insert(ENV_API_BASE_URL, "https://api.example.com");
        map.insert(ENV_API_KEY, "secret");
        map.insert(ENV_USER_ID, "42");
        map.insert(ENV_SYNC_DELAYS, "1,soon");

        assert!(parse_from_map(&map).is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = EngineConfig::new("https://api.example.com", "secret", 1, "/tmp");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
