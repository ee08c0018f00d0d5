//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bibsync_core::config::EngineConfig;
use bibsync_core::util::is_http_url;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "cli-config.json";
const PROFILE_ENV: &str = "BIBSYNC_PROFILE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub attachments_dir: Option<PathBuf>,
    #[serde(default)]
    pub background_interval_secs: Option<u64>,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("bibsync").join(CONFIG_FILE_NAME))
        .ok_or_else(|| "Failed to resolve CLI config directory".to_string())
}

pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    bibsync_core::util::normalize_text_option(value)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path()?;
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        if let Some(profile) = normalize_profile_name(explicit) {
            return profile;
        }
        if let Some(profile) = normalize_profile_name(std::env::var(PROFILE_ENV).ok().as_deref()) {
            return profile;
        }
        if let Some(profile) = normalize_profile_name(self.active_profile.as_deref()) {
            return profile;
        }
        "default".to_string()
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.normalize();
        }
    }
}

impl CliProfile {
    /// Engine configuration for this profile, or `None` while credentials are
    /// incomplete.
    pub fn engine_config(&self, default_attachments_dir: &Path) -> Result<Option<EngineConfig>, String> {
        let (Some(api_base_url), Some(api_key), Some(user_id)) =
            (self.api_base_url.clone(), self.api_key.clone(), self.user_id)
        else {
            return Ok(None);
        };
        if !is_http_url(&api_base_url) {
            return Err(format!(
                "Profile API base URL must include http:// or https://: {api_base_url}"
            ));
        }

        let attachments_dir = self
            .attachments_dir
            .clone()
            .unwrap_or_else(|| default_attachments_dir.to_path_buf());
        let mut config = EngineConfig::new(api_base_url, api_key, user_id, attachments_dir);
        config.background_interval_secs = self.background_interval_secs;
        config.validate().map_err(|error| error.to_string())?;
        Ok(Some(config))
    }

    /// Profile with the API key replaced, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| "<redacted>".to_string()),
            ..self.clone()
        }
    }

    fn normalize(&mut self) {
        self.api_base_url = normalize_text_option(self.api_base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string());
        self.api_key = normalize_text_option(self.api_key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
        assert_eq!(normalize_profile_name(Some(" work ")), Some("work".to_string()));
    }

    #[test]
    fn config_roundtrip_preserves_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some("default".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                api_base_url: Some(" https://api.example.org/ ".to_string()),
                api_key: Some(" secret ".to_string()),
                user_id: Some(42),
                attachments_dir: None,
                background_interval_secs: Some(900),
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        let profile = loaded.profiles.get("default").unwrap();
        assert_eq!(profile.api_base_url.as_deref(), Some("https://api.example.org"));
        assert_eq!(profile.api_key.as_deref(), Some("secret"));
        assert_eq!(profile.user_id, Some(42));
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(config.resolve_profile_name(Some("laptop")), "laptop");
        if std::env::var(PROFILE_ENV).is_err() {
            assert_eq!(config.resolve_profile_name(None), "work");
        }
    }

    #[test]
    fn incomplete_profile_has_no_engine_config() {
        let profile = CliProfile {
            api_base_url: Some("https://api.example.org".to_string()),
            ..CliProfile::default()
        };
        assert_eq!(profile.engine_config(Path::new("/tmp/files")).unwrap(), None);
    }

    #[test]
    fn complete_profile_builds_engine_config() {
        let profile = CliProfile {
            api_base_url: Some("https://api.example.org".to_string()),
            api_key: Some("secret".to_string()),
            user_id: Some(7),
            attachments_dir: None,
            background_interval_secs: Some(60),
        };
        let config = profile
            .engine_config(Path::new("/tmp/files"))
            .unwrap()
            .unwrap();
        assert_eq!(config.user_id, 7);
        assert_eq!(config.attachments_dir, PathBuf::from("/tmp/files"));
        assert_eq!(config.background_interval_secs, Some(60));
        assert_eq!(profile.redacted().api_key.as_deref(), Some("<redacted>"));
    }

    #[test]
    fn profile_with_bad_url_is_rejected() {
        let profile = CliProfile {
            api_base_url: Some("api.example.org".to_string()),
            api_key: Some("secret".to_string()),
            user_id: Some(7),
            ..CliProfile::default()
        };
        assert!(profile.engine_config(Path::new("/tmp/files")).is_err());
    }
}
