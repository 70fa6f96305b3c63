//! Centralized path resolution for stagehand
//!
//! # Environment Variables
//!
//! - `STAGEHAND_CONFIG` - Path to the deploy config file
//! - `STAGEHAND_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_file():
//! 1. `--config` flag (or `STAGEHAND_CONFIG`, handled by clap)
//! 2. `stagehand.toml` in the working directory
//! 3. `deploy/stagehand.toml` in the working directory
//!
//! For state_dir():
//! 1. `STAGEHAND_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/stagehand` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\stagehand`
//!    - macOS/Linux: `~/.local/state/stagehand`

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const ENV_CONFIG: &str = "STAGEHAND_CONFIG";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STAGEHAND_STATE_DIR";

/// Config file names searched in the working directory, in order
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stagehand.toml", "deploy/stagehand.toml"];

/// Locate the deploy config file.
pub fn config_file(explicit: Option<&str>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Could not determine working directory")?;
    find_config(explicit, &cwd)
}

fn find_config(explicit: Option<&str>, cwd: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let path = expand(path);
        log::debug!("Using config file from flag: {}", path.display());
        return Ok(path);
    }

    for name in DEFAULT_CONFIG_FILES {
        let candidate = cwd.join(name);
        if candidate.is_file() {
            log::debug!("Found config file: {}", candidate.display());
            return Ok(candidate);
        }
    }

    bail!(
        "No config file found. Create {} or pass --config (or set {ENV_CONFIG})",
        DEFAULT_CONFIG_FILES.join(" or ")
    )
}

/// Get the stagehand state directory path
///
/// Priority:
/// 1. `STAGEHAND_STATE_DIR` env var
/// 2. `XDG_STATE_HOME/stagehand`
/// 3. Platform default
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("stagehand");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            return Ok(local_app_data.join("stagehand"));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join("stagehand"))
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================
