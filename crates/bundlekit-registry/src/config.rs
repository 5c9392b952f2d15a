use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_FREE_HEADROOM_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDecl {
    pub name: String,
    pub is_user: bool,
    /// Relative paths are taken from the state root.
    pub path: PathBuf,
}

/// Contents of `bundlekit.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "config_file_version")]
    pub version: u32,
    #[serde(default = "default_min_free_headroom_bytes")]
    pub min_free_headroom_bytes: u64,
    pub privileged_helper: Option<PathBuf>,
    #[serde(default)]
    pub scopes: Vec<ScopeDecl>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: config_file_version(),
            min_free_headroom_bytes: default_min_free_headroom_bytes(),
            privileged_helper: None,
            scopes: vec![
                ScopeDecl {
                    name: "system".to_string(),
                    is_user: false,
                    path: PathBuf::from("scopes/system"),
                },
                ScopeDecl {
                    name: "user".to_string(),
                    is_user: true,
                    path: PathBuf::from("scopes/user"),
                },
            ],
        }
    }
}

/// `$HOME/.bundlekit`, or `%LOCALAPPDATA%\Bundlekit` on Windows.
pub fn default_state_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows state root")?;
        return Ok(PathBuf::from(app_data).join("Bundlekit"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state root")?;
    Ok(PathBuf::from(home).join(".bundlekit"))
}

pub(crate) fn config_file_version() -> u32 {
    1
}

fn default_min_free_headroom_bytes() -> u64 {
    DEFAULT_MIN_FREE_HEADROOM_BYTES
}
