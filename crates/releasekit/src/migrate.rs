//! Guarded schema migrations.
//!
//! ```text
//! CheckPending ─┬─> NoPending
//!               └─> BackupRequested ─┬─> BackupDone ───┬─> Migrating ─┬─> MigrationDone
//!                                    └─> BackupFailed ─┘ (confirmed)   └─> MigrationFailed
//! ```
//!
//! A failed migration is never restored automatically: it may be partially
//! applied, so the error names the backup and the restore command instead.

use crate::backup::{BackupHandle, BackupManager, DatabaseConfig, DatabaseKind};
use crate::conduit::{Conduit, ExecOptions, HostRef};
use crate::context::ConfirmCallback;
use crate::error::{Error, Result};
use crate::shell::{in_dir, quote_path};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Migration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Run migrations during deploy
    pub enabled: bool,
    /// Back up the database before migrating
    pub backup: bool,
    /// Lists pending migrations
    pub status_command: String,
    /// Applies migrations
    pub command: String,
    /// Prints the SQL a migration would run
    pub pretend_command: String,
    /// Migration timeout in seconds
    pub timeout: u64,
    /// Status output fragments meaning nothing is pending
    pub nothing_pending: Vec<String>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup: true,
            status_command: "php artisan migrate:status --pending".to_string(),
            command: "php artisan migrate --force".to_string(),
            pretend_command: "php artisan migrate --force --pretend".to_string(),
            timeout: 300,
            nothing_pending: vec![
                "Nothing to migrate".to_string(),
                "No pending migrations".to_string(),
            ],
        }
    }
}

/// Controller states, in the order they are entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    /// Asking the application for pending migrations
    CheckPending,
    /// Nothing to apply
    NoPending,
    /// Taking the pre-migration backup
    BackupRequested,
    /// Backup written to this path
    BackupDone(String),
    /// Backup failed with this message
    BackupFailed(String),
    /// Migration command running
    Migrating,
    /// Migrations applied
    MigrationDone,
    /// Migration command failed or timed out
    MigrationFailed(String),
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckPending => f.write_str("checking for pending migrations"),
            Self::NoPending => f.write_str("no pending migrations"),
            Self::BackupRequested => f.write_str("backing up database"),
            Self::BackupDone(path) => write!(f, "backup created at {path}"),
            Self::BackupFailed(e) => write!(f, "backup failed: {e}"),
            Self::Migrating => f.write_str("running migrations"),
            Self::MigrationDone => f.write_str("migrations applied"),
            Self::MigrationFailed(e) => write!(f, "migration failed: {e}"),
        }
    }
}

/// What a controller run did.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// States entered, in order
    pub states: Vec<MigrationState>,
    /// Backup taken before migrating
    pub backup: Option<BackupHandle>,
    /// Whether migrations were applied
    pub migrated: bool,
    /// Output of the migration command
    pub output: String,
}

impl MigrationReport {
    fn enter(&mut self, state: MigrationState) {
        log::debug!("migration: {state}");
        self.states.push(state);
    }

    /// Last state entered.
    pub fn state(&self) -> Option<&MigrationState> {
        self.states.last()
    }
}

/// Runs migrations for one release with a backup safety net.
pub struct MigrationController<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    config: &'a MigrateConfig,
    backups: Option<&'a BackupManager<'a>>,
    restore_command: String,
}

impl<'a> MigrationController<'a> {
    /// Create a controller. `restore_command` is quoted in failure messages.
    pub fn new(
        conduit: &'a dyn Conduit,
        host: &'a HostRef,
        config: &'a MigrateConfig,
        restore_command: impl Into<String>,
    ) -> Self {
        Self {
            conduit,
            host,
            config,
            backups: None,
            restore_command: restore_command.into(),
        }
    }

    /// Take backups through `backups` before migrating.
    #[must_use]
    pub fn with_backups(mut self, backups: &'a BackupManager<'a>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Whether the release has migrations to apply.
    ///
    /// Empty output or one of the configured "nothing" markers means none;
    /// anything else, including errors printed by the status command, counts
    /// as pending so that a broken database never skips the safety net.
    pub fn pending(&self, release_dir: &str) -> Result<bool> {
        let out = self.conduit.execute(
            self.host,
            &in_dir(release_dir, &format!("{} 2>&1", self.config.status_command)),
            &ExecOptions::with_timeout(Duration::from_secs(120)),
        )?;
        let text = out.stdout.trim();
        if text.is_empty() {
            return Ok(false);
        }
        Ok(!self
            .config
            .nothing_pending
            .iter()
            .any(|marker| text.contains(marker.as_str())))
    }

    /// Check, back up and migrate.
    pub fn run(&self, release_dir: &str, confirm: &mut dyn ConfirmCallback) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        if !self.config.enabled {
            log::info!("migrations disabled");
            return Ok(report);
        }

        report.enter(MigrationState::CheckPending);
        if !self.pending(release_dir)? {
            report.enter(MigrationState::NoPending);
            return Ok(report);
        }

        match self.backups.filter(|_| self.config.backup) {
            Some(backups) => {
                report.enter(MigrationState::BackupRequested);
                match backups.backup(release_dir) {
                    Ok(handle) => {
                        report.enter(MigrationState::BackupDone(handle.path.clone()));
                        report.backup = Some(handle);
                    }
                    Err(e) => {
                        let message = e.to_string();
                        report.enter(MigrationState::BackupFailed(message.clone()));
                        let prompt = format!("{message}. Continue without backup?");
                        if !confirm.confirm(&prompt)? {
                            return Err(Error::BackupAborted { message });
                        }
                        log::warn!("continuing without a database backup");
                    }
                }
            }
            None => log::warn!("database backup disabled, migrating without a safety net"),
        }

        report.enter(MigrationState::Migrating);
        let result = self.conduit.run(
            self.host,
            &in_dir(release_dir, &self.config.command),
            &ExecOptions::with_timeout(Duration::from_secs(self.config.timeout)),
        );
        match result {
            Ok(output) => {
                report.enter(MigrationState::MigrationDone);
                report.migrated = true;
                report.output = output;
                Ok(report)
            }
            Err(e) => {
                let message = match &e {
                    Error::Timeout { timeout, .. } => {
                        format!("timed out after {}s", timeout.as_secs())
                    }
                    other => other.to_string(),
                };
                report.enter(MigrationState::MigrationFailed(message.clone()));
                Err(Error::Migration {
                    message,
                    backup: report.backup.map(|b| b.path),
                    restore_command: self.restore_command.clone(),
                })
            }
        }
    }

    /// SQL the pending migrations would run, or `None` when nothing is pending.
    pub fn pretend(&self, release_dir: &str) -> Result<Option<String>> {
        let out = self.conduit.run(
            self.host,
            &in_dir(release_dir, &format!("{} 2>&1", self.config.pretend_command)),
            &ExecOptions::with_timeout(Duration::from_secs(self.config.timeout)),
        )?;
        let nothing = out.is_empty()
            || self
                .config
                .nothing_pending
                .iter()
                .any(|marker| out.contains(marker.as_str()));
        Ok((!nothing).then_some(out))
    }

    /// Raw status listing from the application.
    pub fn status(&self, app_dir: &str) -> Result<String> {
        let command = self
            .config
            .status_command
            .trim_end_matches(" --pending")
            .to_string();
        self.conduit.run(
            self.host,
            &in_dir(app_dir, &format!("{command} 2>&1")),
            &ExecOptions::with_timeout(Duration::from_secs(120)),
        )
    }
}

/// Create the shared SQLite file when it does not exist yet.
///
/// Returns true when the file was created. No-op for server databases.
pub fn ensure_sqlite(conduit: &dyn Conduit, host: &HostRef, database: &DatabaseConfig, shared_root: &str) -> Result<bool> {
    if database.kind != DatabaseKind::Sqlite {
        return Ok(false);
    }
    let file = database.sqlite_file(shared_root);
    let parent = file.rsplit_once('/').map_or(".", |(dir, _)| dir);
    let target = quote_path(&file);
    let out = conduit.run(
        host,
        &format!(
            "if [ -f {target} ]; then echo exists; else mkdir -p {} && touch {target} && chmod 664 {target} && echo created; fi",
            quote_path(parent)
        ),
        &ExecOptions::default(),
    )?;
    let created = out == "created";
    if created {
        log::info!("created SQLite database at {file}");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupConfig;
    use crate::conduit::Secret;
    use crate::conduit::mock::ScriptedConduit;
    use crate::context::{AutoConfirm, AutoDecline};

    const RELEASE: &str = "/srv/shop/releases/20260314090000";

    fn pg() -> DatabaseConfig {
        DatabaseConfig {
            name: "shop".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_nothing_pending_is_noop() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "INFO  No pending migrations.");
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production");
        let report = controller.run(RELEASE, &mut AutoDecline).unwrap();
        assert_eq!(report.state(), Some(&MigrationState::NoPending));
        assert!(!report.migrated);
        assert!(!conduit.ran("migrate --force"));
    }

    #[test]
    fn test_backup_precedes_migration() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "2026_03_01_000000_create_orders_table .... Pending");
        conduit.on("stat -c%s", "40960");
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let backup_config = BackupConfig::default();
        let db = pg();
        let backups = BackupManager::new(
            &conduit,
            &host,
            &backup_config,
            &db,
            "production",
            "/srv/shop/shared/backups",
            Some(Secret::new("pw")),
        );
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production")
            .with_backups(&backups);

        let report = controller.run(RELEASE, &mut AutoDecline).unwrap();
        assert!(report.migrated);
        assert!(report.backup.is_some());
        assert!(conduit.position("pg_dump").unwrap() < conduit.position("migrate --force").unwrap());
        assert_eq!(
            conduit.calls()
                .iter()
                .find(|c| c.script.contains("migrate --force"))
                .and_then(|c| c.timeout),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_declined_backup_failure_aborts_before_migrating() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "Pending");
        conduit.on_fail("pg_dump", 1, "connection refused");
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let backup_config = BackupConfig::default();
        let db = pg();
        let backups = BackupManager::new(&conduit, &host, &backup_config, &db, "production", "/b", Some(Secret::new("pw")));
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production")
            .with_backups(&backups);

        let err = controller.run(RELEASE, &mut AutoDecline).unwrap_err();
        assert!(matches!(err, Error::BackupAborted { .. }));
        assert!(!conduit.ran("migrate --force"));
    }

    #[test]
    fn test_confirmed_backup_failure_continues() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "Pending");
        conduit.on_fail("pg_dump", 1, "connection refused");
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let backup_config = BackupConfig::default();
        let db = pg();
        let backups = BackupManager::new(&conduit, &host, &backup_config, &db, "production", "/b", Some(Secret::new("pw")));
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production")
            .with_backups(&backups);

        let report = controller.run(RELEASE, &mut AutoConfirm).unwrap();
        assert!(report.migrated);
        assert!(report.backup.is_none());
        assert!(report
            .states
            .iter()
            .any(|s| matches!(s, MigrationState::BackupFailed(_))));
    }

    #[test]
    fn test_failure_after_backup_names_backup_and_restore_command() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "Pending");
        conduit.on("stat -c%s", "40960");
        conduit.on_fail("migrate --force", 1, "SQLSTATE[42P07]: Duplicate table");
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let backup_config = BackupConfig::default();
        let db = pg();
        let backups = BackupManager::new(&conduit, &host, &backup_config, &db, "production", "/b", Some(Secret::new("pw")));
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production")
            .with_backups(&backups);

        let err = controller.run(RELEASE, &mut AutoDecline).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/b/shop_production_"));
        assert!(message.contains("stagehand db:restore production"));
        assert!(!conduit.ran("gunzip"));
    }

    #[test]
    fn test_timeout_is_migration_failure() {
        let conduit = ScriptedConduit::new();
        conduit.on("migrate:status", "Pending");
        conduit.on_timeout("migrate --force");
        let host = HostRef::Local;
        let config = MigrateConfig {
            backup: false,
            ..Default::default()
        };
        let controller = MigrationController::new(&conduit, &host, &config, "stagehand db:restore production");
        match controller.run(RELEASE, &mut AutoDecline).unwrap_err() {
            Error::Migration { message, backup, .. } => {
                assert!(message.contains("timed out"));
                assert!(backup.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pretend_without_output_means_nothing_pending() {
        let conduit = ScriptedConduit::new();
        let host = HostRef::Local;
        let config = MigrateConfig::default();
        let controller = MigrationController::new(&conduit, &host, &config, "x");
        assert_eq!(controller.pretend(RELEASE).unwrap(), None);

        conduit.on("--pretend", "create table \"orders\" (...)");
        assert!(controller.pretend(RELEASE).unwrap().unwrap().contains("orders"));
    }

    #[test]
    fn test_ensure_sqlite() {
        let conduit = ScriptedConduit::new();
        conduit.on("touch", "created");
        let host = HostRef::Local;
        let db = DatabaseConfig {
            kind: DatabaseKind::Sqlite,
            ..Default::default()
        };
        assert!(ensure_sqlite(&conduit, &host, &db, "/srv/shop/shared").unwrap());
        assert!(conduit.ran("mkdir -p /srv/shop/shared/database"));
        assert!(conduit.ran("touch /srv/shop/shared/database/database.sqlite"));
        assert!(conduit.ran("chmod 664"));

        let other = ScriptedConduit::new();
        assert!(!ensure_sqlite(&other, &host, &pg(), "/srv/shop/shared").unwrap());
        assert!(other.calls().is_empty());
    }
}
