use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Top-level polibot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolibotConfig {
    /// SQLite database file. Defaults to `<config dir>/polibot.sqlite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Directory holding JSON dataset files. Defaults to
    /// `<config dir>/datasets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets_dir: Option<PathBuf>,
}

impl PolibotConfig {
    /// Database path, resolved against the config directory when not set
    /// explicitly.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("polibot.sqlite")),
        }
    }

    /// Datasets directory, resolved against the config directory when not
    /// set explicitly.
    pub fn datasets_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.datasets_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("datasets")),
        }
    }
}

/// Resolve the polibot config directory (~/.polibot/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".polibot"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.polibot/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<PolibotConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<PolibotConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(PolibotConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: PolibotConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory (and datasets subdirectory) exist.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &PolibotConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
