use std::path::PathBuf;

use bibsync_core::util::is_http_url;
use serde::Serialize;

use crate::cli::ConfigCommands;
use crate::config_profiles::{normalize_text_option, CliProfile, CliProfilesConfig};
use crate::error::CliError;

#[derive(Serialize)]
struct ProfileView<'a> {
    profile: &'a str,
    #[serde(flatten)]
    settings: CliProfile,
    environment_override: bool,
}

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => run_config_show(global_profile),
        ConfigCommands::Init {
            profile,
            api_base_url,
            api_key,
            user_id,
            attachments_dir,
            background_interval,
            no_activate,
        } => {
            let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
            let name = config.resolve_profile_name(profile.as_deref().or(global_profile));
            apply_profile_update(
                &mut config,
                &name,
                ProfileUpdate {
                    api_base_url,
                    api_key,
                    user_id,
                    attachments_dir,
                    background_interval,
                },
                !no_activate,
            )?;
            let path = config.save().map_err(CliError::Config)?;
            println!("Saved profile '{name}' to {}", path.display());
            Ok(())
        }
    }
}

fn run_config_show(global_profile: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let name = config.resolve_profile_name(global_profile);
    let settings = config
        .profile(&name)
        .map(CliProfile::redacted)
        .unwrap_or_default();
    let view = ProfileView {
        profile: &name,
        settings,
        environment_override: std::env::var("BIBSYNC_API_BASE_URL").is_ok(),
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Values passed to `config init`; `None` keeps the stored value.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<i64>,
    pub attachments_dir: Option<PathBuf>,
    pub background_interval: Option<u64>,
}

pub fn apply_profile_update(
    config: &mut CliProfilesConfig,
    name: &str,
    update: ProfileUpdate,
    activate: bool,
) -> Result<(), CliError> {
    let api_base_url = normalize_text_option(update.api_base_url);
    if let Some(url) = &api_base_url {
        if !is_http_url(url) {
            return Err(CliError::Config(format!(
                "API base URL must include http:// or https://: {url}"
            )));
        }
    }
    if update.user_id.is_some_and(|id| id <= 0) {
        return Err(CliError::Config("User id must be positive".to_string()));
    }

    let profile = config.profile_mut_or_default(name);
    if let Some(url) = api_base_url {
        profile.api_base_url = Some(url.trim_end_matches('/').to_string());
    }
    if let Some(key) = normalize_text_option(update.api_key) {
        profile.api_key = Some(key);
    }
    if let Some(user_id) = update.user_id {
        profile.user_id = Some(user_id);
    }
    if let Some(dir) = update.attachments_dir {
        profile.attachments_dir = Some(dir);
    }
    if let Some(secs) = update.background_interval {
        profile.background_interval_secs = (secs > 0).then_some(secs);
    }

    if activate {
        config.active_profile = Some(name.to_string());
    }
    Ok(())
}
