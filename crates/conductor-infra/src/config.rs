//! Configuration loading for Conductor.
//!
//! Reads `config.toml` from the data directory (`~/.conductor/` unless
//! `CONDUCTOR_DATA_DIR` is set) into [`EngineConfig`]. A missing or
//! malformed file falls back to defaults.

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";

/// `$CONDUCTOR_DATA_DIR`, else `~/.conductor`, else `./.conductor`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

/// Load engine configuration from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}
