//! Centralized path resolution for clusterforge
//!
//! # Environment Variables
//!
//! - `CLUSTERFORGE_CONFIG_DIR` - Override config directory
//! - `CLUSTERFORGE_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `CLUSTERFORGE_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/clusterforge` (if set)
//! 3. `~/.config/clusterforge`
//!
//! For state_dir():
//! 1. `CLUSTERFORGE_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/clusterforge` (if set)
//! 3. `~/.local/state/clusterforge`
//!
//! The state directory holds everything the engine persists between runs:
//!
//! ```text
//! <state>/ledger/<cluster>.toml   completion records
//! <state>/progress.toml           latest status per cluster
//! <state>/locks/<key>.lease       live leases
//! <state>/spans.jsonl             execution spans
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "CLUSTERFORGE_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "CLUSTERFORGE_STATE_DIR";

const APP: &str = "clusterforge";

/// Pick a directory from an explicit override, an XDG base or the home default
fn resolve_dir(
    env_override: Option<String>,
    xdg_base: Option<String>,
    home_default: &[&str],
) -> Result<PathBuf> {
    if let Some(dir) = env_override.filter(|d| !d.trim().is_empty()) {
        return Ok(expand_path(&dir));
    }
    if let Some(base) = xdg_base.filter(|d| !d.trim().is_empty()) {
        return Ok(PathBuf::from(base).join(APP));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let mut path = home;
    for part in home_default {
        path.push(part);
    }
    Ok(path.join(APP))
}

/// Get the clusterforge config directory path
pub fn config_dir() -> Result<PathBuf> {
    let path = resolve_dir(
        std::env::var(ENV_CONFIG_DIR).ok(),
        std::env::var("XDG_CONFIG_HOME").ok(),
        &[".config"],
    )?;
    log::debug!("Using config dir: {}", path.display());
    Ok(path)
}

/// Get the clusterforge state directory path
pub fn state_dir() -> Result<PathBuf> {
    let path = resolve_dir(
        std::env::var(ENV_STATE_DIR).ok(),
        std::env::var("XDG_STATE_HOME").ok(),
        &[".local", "state"],
    )?;
    log::debug!("Using state dir: {}", path.display());
    Ok(path)
}

/// Settings file inside the config directory
pub fn settings_file(config_dir: &Path) -> PathBuf {
    config_dir.join("settings.toml")
}

pub fn ledger_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("ledger")
}

pub fn progress_file(state_dir: &Path) -> PathBuf {
    state_dir.join("progress.toml")
}

pub fn locks_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("locks")
}

pub fn spans_file(state_dir: &Path) -> PathBuf {
    state_dir.join("spans.jsonl")
}

/// File name for a cluster id or lease key.
///
/// ASCII letters, digits, `-` and `_` are kept; every other byte becomes
/// `%XX`. Distinct ids always map to distinct names.
pub fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Inverse of [`file_stem`]; `None` for names it never produces
pub fn from_file_stem(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(path).into_owned());
    PathBuf::from(expanded)
}
