use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

// ============================================================================
// State Structures
// ============================================================================

/// What stagehand remembers about past runs, per stage.
///
/// This is an operator convenience only; the host is the source of truth
/// for which release is active.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StagehandState {
    /// State for each stage
    #[serde(default)]
    pub stages: BTreeMap<String, StageState>,

    /// Last time the state was updated
    pub last_updated: DateTime<Utc>,
}

/// State for a single stage
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StageState {
    /// Release created by the last deploy
    pub last_release: Option<String>,

    /// When the last deploy finished
    pub last_deploy: Option<DateTime<Utc>>,

    /// Whether the last deploy succeeded
    #[serde(default)]
    pub last_success: bool,

    /// The last deploy left an unhealthy release behind
    #[serde(default)]
    pub unhealthy: bool,

    /// Error of the last failed deploy
    pub last_error: Option<String>,

    /// Release the last rollback moved to
    pub rolled_back_to: Option<String>,

    /// Newest backup file seen or taken
    pub last_backup: Option<String>,

    /// Fingerprint of the config file used by the last deploy
    pub config_hash: Option<String>,
}

/// Summary of one finished deploy, as recorded in the state file.
#[derive(Debug, Clone, Default)]
pub struct DeployRecord {
    pub release: Option<String>,
    pub success: bool,
    pub unhealthy: bool,
    pub error: Option<String>,
    pub rolled_back_to: Option<String>,
    pub backup: Option<String>,
}

// ============================================================================
// StagehandState Implementation
// ============================================================================

impl StagehandState {
    /// Get the state file path
    fn state_file() -> Result<PathBuf> {
        Ok(paths::state_dir()?.join("state.toml"))
    }

    /// Load state from disk, or return default if file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::state_file()?)
    }

    /// Load state from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::state_file()?)
    }

    /// Save state to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;
        fs::write(path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Update the last_updated timestamp and save
    pub fn touch(&mut self) -> Result<()> {
        self.last_updated = Utc::now();
        self.save()
    }

    // ========================================================================
    // Stage State Helpers
    // ========================================================================

    /// Get or create stage state
    pub fn stage_mut(&mut self, stage: &str) -> &mut StageState {
        self.stages.entry(stage.to_string()).or_default()
    }

    /// State of a stage, if it was ever deployed from this machine.
    pub fn stage(&self, stage: &str) -> Option<&StageState> {
        self.stages.get(stage)
    }

    /// Record the outcome of a deploy.
    pub fn record_deploy(&mut self, stage: &str, record: DeployRecord, config_hash: Option<String>) {
        let state = self.stage_mut(stage);
        state.last_deploy = Some(Utc::now());
        state.last_success = record.success;
        state.unhealthy = record.unhealthy && record.rolled_back_to.is_none();
        state.last_error = record.error;
        state.rolled_back_to = record.rolled_back_to;
        if record.release.is_some() {
            state.last_release = record.release;
        }
        if record.backup.is_some() {
            state.last_backup = record.backup;
        }
        if record.success {
            state.config_hash = config_hash;
        }
    }

    /// Record a manual rollback.
    pub fn record_rollback(&mut self, stage: &str, to: &str) {
        let state = self.stage_mut(stage);
        state.rolled_back_to = Some(to.to_string());
        state.unhealthy = false;
    }

    /// Record a backup file.
    pub fn record_backup(&mut self, stage: &str, file: &str) {
        self.stage_mut(stage).last_backup = Some(file.to_string());
    }
}

impl Default for StagehandState {
    fn default() -> Self {
        Self {
            stages: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// blake3 fingerprint of the config file contents.
pub fn config_fingerprint(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex()[..16].to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(success: bool) -> DeployRecord {
        DeployRecord {
            release: Some("20260102000000".to_string()),
            success,
            ..DeployRecord::default()
        }
    }

    #[test]
    fn test_missing_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let state = StagehandState::load_from(&dir.path().join("state.toml")).unwrap();
        assert!(state.stages.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.toml");

        let mut state = StagehandState::default();
        state.record_deploy("production", record(true), Some("abc".to_string()));
        state.record_backup("production", "shop_production_2026-01-02_00-00-00.sql.gz");
        state.save_to(&path).unwrap();

        let loaded = StagehandState::load_from(&path).unwrap();
        assert_eq!(loaded.stages, state.stages);
        let stage = loaded.stage("production").unwrap();
        assert_eq!(stage.last_release.as_deref(), Some("20260102000000"));
        assert_eq!(stage.config_hash.as_deref(), Some("abc"));
        assert!(stage.last_backup.is_some());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "stages = 3").unwrap();
        assert!(StagehandState::load_from(&path).is_err());
    }

    #[test]
    fn test_failed_deploy_keeps_previous_hash() {
        let mut state = StagehandState::default();
        state.record_deploy("staging", record(true), Some("first".to_string()));

        let failed = DeployRecord {
            success: false,
            unhealthy: true,
            error: Some("verification failed".to_string()),
            ..record(false)
        };
        state.record_deploy("staging", failed, Some("second".to_string()));

        let stage = state.stage("staging").unwrap();
        assert_eq!(stage.config_hash.as_deref(), Some("first"));
        assert!(stage.unhealthy);
        assert!(!stage.last_success);
    }

    #[test]
    fn test_rollback_clears_unhealthy() {
        let mut state = StagehandState::default();
        let failed = DeployRecord {
            unhealthy: true,
            rolled_back_to: Some("20260101000000".to_string()),
            ..record(false)
        };
        state.record_deploy("staging", failed, None);
        assert!(!state.stage("staging").unwrap().unhealthy);

        state.stage_mut("staging").unhealthy = true;
        state.record_rollback("staging", "20260101000000");
        assert!(!state.stage("staging").unwrap().unhealthy);
    }

    #[test]
    fn test_config_fingerprint_is_stable() {
        assert_eq!(config_fingerprint("a = 1"), config_fingerprint("a = 1"));
        assert_ne!(config_fingerprint("a = 1"), config_fingerprint("a = 2"));
        assert_eq!(config_fingerprint("").len(), 16);
    }
}
