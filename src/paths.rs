//! Base directories for cache and configuration state
//!
//! Follows the XDG Base Directory convention with one platform table instead
//! of scattered OS-specific branches: the `XDG_*_HOME` variables always win,
//! then the per-OS defaults apply.

use std::path::PathBuf;

use crate::error::{BuilderError, Result};

const APPLICATION_DIR: &str = "jvm-image-builder";

/// What the directory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Cache,
    Config,
}

impl Purpose {
    fn xdg_variable(self) -> &'static str {
        match self {
            Purpose::Cache => "XDG_CACHE_HOME",
            Purpose::Config => "XDG_CONFIG_HOME",
        }
    }
}

/// Platform table mapping (os family, purpose) to the base directory,
/// relative to the home directory unless absolute via env.
fn platform_default(os: &str, purpose: Purpose, home: &PathBuf) -> PathBuf {
    match (os, purpose) {
        ("macos", Purpose::Cache) => home.join("Library").join("Caches"),
        ("macos", Purpose::Config) => home.join("Library").join("Application Support"),
        ("windows", _) => std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("AppData").join("Local")),
        (_, Purpose::Cache) => home.join(".cache"),
        (_, Purpose::Config) => home.join(".config"),
    }
}

/// Resolve the application directory for the given purpose.
pub fn base_directory(purpose: Purpose) -> Result<PathBuf> {
    base_directory_for(std::env::consts::OS, purpose)
}

fn base_directory_for(os: &str, purpose: Purpose) -> Result<PathBuf> {
    if let Some(xdg) = std::env::var_os(purpose.xdg_variable()) {
        let base = PathBuf::from(xdg);
        if base.is_absolute() {
            return Ok(base.join(APPLICATION_DIR));
        }
    }

    let home = dirs::home_dir().ok_or_else(|| {
        BuilderError::Io("cannot resolve home directory for cache/config state".to_string())
    })?;
    Ok(platform_default(os, purpose, &home).join(APPLICATION_DIR))
}
