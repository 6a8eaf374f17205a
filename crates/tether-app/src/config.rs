//! Config file loading for the `tether` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tether_pty::SessionConfig;

/// `~/.config/tether/config.toml` (or the platform equivalent).
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

pub fn from_file(path: &Path) -> Result<SessionConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// An explicit path must exist; the default path is optional.
pub fn load(explicit: Option<&Path>) -> Result<SessionConfig> {
    if let Some(path) = explicit {
        return from_file(path);
    }
    match default_path() {
        Some(path) if path.exists() => {
            log::debug!("loading config from {}", path.display());
            from_file(&path)
        }
        _ => Ok(SessionConfig::default()),
    }
}
