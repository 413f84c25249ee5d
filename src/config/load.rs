use std::fs;
use std::path::PathBuf;

use super::Config;
use crate::{Error, Result};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Load the user config, if any, and apply env overrides.
pub fn load() -> Result<Config> {
    let path = config_path();
    let mut config = if path.exists() {
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Like [`load`], but falls back to defaults on any error (logging it).
pub fn load_or_default() -> Config {
    match load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

/// Environment overrides take precedence over the config file.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("FSWATCHD_SETTLE_MS")
        && let Ok(ms) = v.parse()
    {
        config.settle_ms = ms;
    }
    if let Ok(v) = std::env::var("FSWATCHD_SYNC_TIMEOUT_MS")
        && let Ok(ms) = v.parse()
    {
        config.sync_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("FSWATCHD_SOCK")
        && !v.is_empty()
    {
        config.socket = Some(PathBuf::from(v));
    }
}
