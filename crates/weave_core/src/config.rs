//! Config file locations and format-aware load/save.
//!
//! Files ending in `.json` are read and written as JSON, everything else
//! as TOML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

/// Returns the base directory: `~/.weave/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".weave"))
}

/// Returns the default config file path: `~/.weave/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.toml"))
}

/// Returns the logs directory: `~/.weave/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Parse `content` in the format implied by `path`.
pub fn parse<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    if is_json(path) {
        serde_json::from_str(content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        toml::from_str(content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Load config from `path`. A missing file is created with the default;
/// an unreadable or corrupt one is left alone and the default is used.
pub fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    if path.exists() {
        let loaded = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))
            .and_then(|content| parse(path, &content));
        match loaded {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) => {
                warn!("{e:#}; using defaults");
                Ok(T::default())
            }
        }
    } else {
        let config = T::default();
        save_to_file(&config, path)?;
        info!("Created default config at {}", path.display());
        Ok(config)
    }
}

/// Save config to `path`, creating parent directories as needed.
pub fn save_to_file<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    let content = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
