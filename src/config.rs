//! Daemon configuration, loaded from an optional JSON document.
//!
//! Recognised keys: `defaultShell`, `defaultCwd`, `maxSessions`,
//! `bufferSize`. A missing file yields the defaults. `%NAME%` environment
//! references inside `defaultShell` / `defaultCwd` are expanded at session
//! creation time, not at load time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub default_shell: String,
    pub default_cwd: String,
    pub max_sessions: usize,
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cwd: default_cwd(),
            max_sessions: 50,
            buffer_size: 4096,
        }
    }
}

#[cfg(windows)]
fn default_shell() -> String {
    "pwsh.exe".to_string()
}

#[cfg(not(windows))]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_cwd() -> String {
    "%USERPROFILE%".to_string()
}

#[cfg(not(windows))]
fn default_cwd() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] serde_json::Error),
}

impl Config {
    /// Load config from a JSON file path. Returns None if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from the default path, falling back to defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::load(&default_config_path()) {
            Ok(Some(config)) => Ok(config),
            Ok(None) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

/// Platform config file location, e.g. `~/.config/winmux/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("winmux")
        .join("config.json")
}

/// Warn if the config file is group/world-readable.
#[cfg(unix)]
fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); consider restricting to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
fn check_config_permissions(_path: &Path) {}

/// Expand `%NAME%` environment references. Unknown names and unbalanced
/// percent signs are left as-is.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
