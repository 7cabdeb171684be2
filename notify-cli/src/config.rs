use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify_sync::SyncConfig;
use tracing::debug;

use crate::cli::Args;

const CONFIG_DIR: &str = "notify-sync";
const CONFIG_FILE: &str = "config.toml";

/// `<config dir>/notify-sync/config.toml`, when the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load the configuration file.
///
/// An explicit path must exist. The default location is optional and falls
/// back to built-in defaults when absent.
pub fn load(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => read(path),
        None => match default_path() {
            Some(path) if path.exists() => read(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(SyncConfig::default())
            }
        },
    }
}

fn read(path: &Path) -> Result<SyncConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Apply command-line and environment overrides on top of the file.
pub fn apply_overrides(config: &mut SyncConfig, args: &Args) {
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(user_id) = &args.user_id {
        config.user_id = user_id.clone();
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
}

/// TOML rendering with the token masked.
pub fn show(config: &SyncConfig) -> Result<String> {
    let mut redacted = config.clone();
    if redacted.token.is_some() {
        redacted.token = Some("********".to_string());
    }
    toml::to_string_pretty(&redacted).context("Failed to serialize configuration")
}
