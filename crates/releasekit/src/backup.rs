//! Database backup and restore.
//!
//! Backups are named `{name}_{stage}_{timestamp}.{ext}` with a sortable
//! timestamp, so the name alone orders them. Every backup is checked for a
//! plausible size right after creation; a suspiciously small file is deleted
//! rather than left for a later restore to trust.

use crate::conduit::{Conduit, ExecOptions, HostRef, SECRET_VAR, Secret};
use crate::error::{Error, Result};
use crate::service::Maintenance;
use crate::shell::{quote, quote_path};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp format embedded in backup names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Supported datastores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// Single-file database, backed up by copying
    Sqlite,
    /// PostgreSQL, backed up with `pg_dump`
    #[serde(alias = "pgsql", alias = "postgresql")]
    Postgres,
    /// MySQL / MariaDB, backed up with `mysqldump`
    #[serde(alias = "mariadb")]
    Mysql,
}

impl DatabaseKind {
    /// File extension of backups for this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Sqlite => ".sqlite",
            Self::Postgres | Self::Mysql => ".sql.gz",
        }
    }

    /// systemd unit usually running this datastore.
    pub fn service_unit(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Sqlite => None,
            Self::Postgres => Some(("PostgreSQL", "postgresql")),
            Self::Mysql => Some(("MySQL", "mysql")),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::Postgres => f.write_str("postgres"),
            Self::Mysql => f.write_str("mysql"),
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Datastore kind
    pub kind: DatabaseKind,
    /// Database name (also the backup name prefix)
    pub name: String,
    /// Login user
    pub username: String,
    /// Server address
    pub host: String,
    /// Server port
    pub port: Option<u16>,
    /// SQLite file, relative to the shared directory or absolute
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Postgres,
            name: "database".to_string(),
            username: "deployer".to_string(),
            host: "127.0.0.1".to_string(),
            port: None,
            sqlite_path: "database/database.sqlite".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Backup name prefix. SQLite backups are always called `database`.
    pub fn backup_name(&self) -> &str {
        match self.kind {
            DatabaseKind::Sqlite => "database",
            _ => &self.name,
        }
    }

    /// Absolute SQLite path. Relative paths live under `shared_root`.
    pub fn sqlite_file(&self, shared_root: &str) -> String {
        if self.is_absolute_sqlite() {
            self.sqlite_path.clone()
        } else {
            format!("{shared_root}/{}", self.sqlite_path)
        }
    }

    /// Directory that must be linked from `shared/` into every release so
    /// the application opens the persistent SQLite file.
    pub fn shared_dir(&self) -> Option<&str> {
        if self.kind != DatabaseKind::Sqlite || self.is_absolute_sqlite() {
            return None;
        }
        self.sqlite_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .filter(|dir| !dir.is_empty())
    }

    fn is_absolute_sqlite(&self) -> bool {
        self.sqlite_path.starts_with('/') || self.sqlite_path.starts_with("~/")
    }

    /// Whether operations on this database need the password secret.
    pub fn needs_password(&self) -> bool {
        !matches!(self.kind, DatabaseKind::Sqlite)
    }

    /// Client invocation running `sql`, password read from the side channel.
    pub fn client_command(&self, sql: &str) -> Option<String> {
        let port = self.port.map(|p| p.to_string());
        match self.kind {
            DatabaseKind::Sqlite => None,
            DatabaseKind::Postgres => Some(format!(
                "PGPASSWORD=\"${SECRET_VAR}\" psql -h {}{} -U {} -d {} -tAc {}",
                quote(&self.host),
                port.map(|p| format!(" -p {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name),
                quote(sql)
            )),
            DatabaseKind::Mysql => Some(format!(
                "MYSQL_PWD=\"${SECRET_VAR}\" mysql -h {}{} -u {} {} -Nse {}",
                quote(&self.host),
                port.map(|p| format!(" -P {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name),
                quote(sql)
            )),
        }
    }

    fn dump_command(&self) -> Option<String> {
        let port = self.port.map(|p| p.to_string());
        match self.kind {
            DatabaseKind::Sqlite => None,
            DatabaseKind::Postgres => Some(format!(
                "PGPASSWORD=\"${SECRET_VAR}\" pg_dump -h {}{} -U {} {}",
                quote(&self.host),
                port.map(|p| format!(" -p {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name)
            )),
            DatabaseKind::Mysql => Some(format!(
                "MYSQL_PWD=\"${SECRET_VAR}\" mysqldump -h {}{} -u {} --single-transaction {}",
                quote(&self.host),
                port.map(|p| format!(" -P {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name)
            )),
        }
    }

    fn load_command(&self) -> Option<String> {
        let port = self.port.map(|p| p.to_string());
        match self.kind {
            DatabaseKind::Sqlite => None,
            DatabaseKind::Postgres => Some(format!(
                "PGPASSWORD=\"${SECRET_VAR}\" psql -q -v ON_ERROR_STOP=1 -h {}{} -U {} {}",
                quote(&self.host),
                port.map(|p| format!(" -p {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name)
            )),
            DatabaseKind::Mysql => Some(format!(
                "MYSQL_PWD=\"${SECRET_VAR}\" mysql -h {}{} -u {} {}",
                quote(&self.host),
                port.map(|p| format!(" -P {p}")).unwrap_or_default(),
                quote(&self.username),
                quote(&self.name)
            )),
        }
    }
}

/// Backup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Take a backup before migrating
    pub enabled: bool,
    /// Backups kept per (name, stage)
    pub keep: usize,
    /// Backup directory, defaults to `{deploy_path}/shared/backups`
    pub path: Option<String>,
    /// Smallest size in bytes a backup may have
    pub min_size: u64,
    /// Dump timeout in seconds
    pub timeout: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep: 5,
            path: None,
            min_size: 100,
            timeout: 600,
        }
    }
}

/// A backup file on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    /// Datastore kind
    pub kind: DatabaseKind,
    /// Backup name prefix
    pub name: String,
    /// Stage label
    pub stage: String,
    /// Creation time encoded in the name
    pub timestamp: NaiveDateTime,
    /// Full path on the host
    pub path: String,
    /// Size in bytes
    pub size: u64,
}

impl BackupHandle {
    /// File name without directory.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Build a backup file name.
pub fn backup_file_name(name: &str, stage: &str, timestamp: &NaiveDateTime, kind: DatabaseKind) -> String {
    format!(
        "{name}_{stage}_{}{}",
        timestamp.format(TIMESTAMP_FORMAT),
        kind.extension()
    )
}

/// Timestamp of a backup file belonging to `(name, stage)`.
pub fn parse_backup_name(file: &str, name: &str, stage: &str, kind: DatabaseKind) -> Option<NaiveDateTime> {
    let rest = file.strip_prefix(&format!("{name}_{stage}_"))?;
    let ts = rest.strip_suffix(kind.extension())?;
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()
}

/// Files to delete so that only the `keep` newest remain.
///
/// Never returns more than `files.len() - keep` entries.
pub fn select_for_pruning<'a>(
    files: &'a [String],
    name: &str,
    stage: &str,
    kind: DatabaseKind,
    keep: usize,
) -> Vec<&'a String> {
    let mut dated: Vec<(NaiveDateTime, &String)> = files
        .iter()
        .filter_map(|f| parse_backup_name(f, name, stage, kind).map(|ts| (ts, f)))
        .collect();
    dated.sort_by(|a, b| b.0.cmp(&a.0));
    dated.into_iter().skip(keep).map(|(_, f)| f).collect()
}

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Backup that was restored
    pub backup: String,
    /// Whether maintenance mode was entered
    pub maintenance: bool,
    /// Restore failure, if any
    pub error: Option<String>,
}

impl RestoreOutcome {
    /// Whether the data was replaced without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Creates, lists, prunes and restores backups for one stage.
pub struct BackupManager<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    config: &'a BackupConfig,
    database: &'a DatabaseConfig,
    stage: String,
    dir: String,
    shared_root: Option<String>,
    password: Option<Secret>,
}

impl<'a> BackupManager<'a> {
    /// Create a manager storing backups in `dir`.
    pub fn new(
        conduit: &'a dyn Conduit,
        host: &'a HostRef,
        config: &'a BackupConfig,
        database: &'a DatabaseConfig,
        stage: impl Into<String>,
        dir: impl Into<String>,
        password: Option<Secret>,
    ) -> Self {
        Self {
            conduit,
            host,
            config,
            database,
            stage: stage.into(),
            dir: dir.into(),
            shared_root: None,
            password,
        }
    }

    /// Resolve the SQLite file under `root` instead of the application root.
    #[must_use]
    pub fn with_shared_root(mut self, root: impl Into<String>) -> Self {
        self.shared_root = Some(root.into());
        self
    }

    fn sqlite_source(&self, app_root: &str) -> String {
        self.database
            .sqlite_file(self.shared_root.as_deref().unwrap_or(app_root))
    }

    fn opts(&self) -> ExecOptions {
        ExecOptions::with_timeout(Duration::from_secs(self.config.timeout)).secret(self.password.as_ref())
    }

    fn require_password(&self) -> Result<()> {
        if self.database.needs_password() && self.password.is_none() {
            return Err(Error::Backup {
                message: "database password not configured (set STAGEHAND_DB_PASSWORD)".to_string(),
            });
        }
        Ok(())
    }

    /// Backup directory on the host.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Take a backup now. `app_root` locates a relative SQLite file.
    pub fn backup(&self, app_root: &str) -> Result<BackupHandle> {
        self.backup_at(app_root, Local::now().naive_local())
    }

    /// Take a backup stamped with `timestamp`.
    pub fn backup_at(&self, app_root: &str, timestamp: NaiveDateTime) -> Result<BackupHandle> {
        self.require_password()?;
        let kind = self.database.kind;
        let name = self.database.backup_name().to_string();
        let path = format!(
            "{}/{}",
            self.dir,
            backup_file_name(&name, &self.stage, &timestamp, kind)
        );
        let target = quote_path(&path);

        let create = match self.database.dump_command() {
            Some(dump) => format!("{dump} | gzip > {target}"),
            None => format!(
                "cp {} {target}",
                quote_path(&self.sqlite_source(app_root))
            ),
        };
        log::info!("creating {kind} backup {path}");

        let script = format!("mkdir -p {} && {create}", quote_path(&self.dir));
        if let Err(e) = self.conduit.run(self.host, &script, &self.opts()) {
            self.discard(&target);
            return Err(Error::Backup {
                message: e.to_string(),
            });
        }

        let size = self.size_of(&target)?;
        if size < self.config.min_size {
            self.discard(&target);
            return Err(Error::Backup {
                message: format!(
                    "backup file is empty or too small ({size} bytes, expected at least {})",
                    self.config.min_size
                ),
            });
        }

        let handle = BackupHandle {
            kind,
            name,
            stage: self.stage.clone(),
            timestamp,
            path,
            size,
        };

        match self.prune(self.config.keep) {
            Ok(removed) if !removed.is_empty() => {
                log::info!("cleaned up {} old backup(s)", removed.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("could not prune old backups: {e}"),
        }

        Ok(handle)
    }

    fn discard(&self, target: &str) {
        if let Err(e) = self
            .conduit
            .run(self.host, &format!("rm -f {target}"), &ExecOptions::default())
        {
            log::warn!("could not remove partial backup {target}: {e}");
        }
    }

    fn size_of(&self, target: &str) -> Result<u64> {
        let out = self.conduit.run(
            self.host,
            &format!("stat -c%s {target} 2>/dev/null || stat -f%z {target} 2>/dev/null || echo 0"),
            &ExecOptions::default(),
        )?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    /// Backups of this (name, stage), newest first.
    pub fn list(&self) -> Result<Vec<BackupHandle>> {
        let kind = self.database.kind;
        let name = self.database.backup_name();
        let out = self.conduit.run(
            self.host,
            &format!(
                "cd {} 2>/dev/null && for f in {}_{}_*{}; do [ -f \"$f\" ] && printf '%s %s\\n' \"$(stat -c%s \"$f\" 2>/dev/null || echo 0)\" \"$f\"; done; true",
                quote_path(&self.dir),
                quote(name),
                quote(&self.stage),
                kind.extension()
            ),
            &ExecOptions::default(),
        )?;

        let mut handles: Vec<BackupHandle> = out
            .lines()
            .filter_map(|line| {
                let (size, file) = line.trim().split_once(' ')?;
                let timestamp = parse_backup_name(file, name, &self.stage, kind)?;
                Some(BackupHandle {
                    kind,
                    name: name.to_string(),
                    stage: self.stage.clone(),
                    timestamp,
                    path: format!("{}/{file}", self.dir),
                    size: size.parse().unwrap_or(0),
                })
            })
            .collect();
        handles.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(handles)
    }

    /// Delete all but the `keep` newest backups. Returns removed file names.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let files: Vec<String> = self
            .list()?
            .iter()
            .map(|h| h.file_name().to_string())
            .collect();
        let doomed: Vec<String> = select_for_pruning(
            &files,
            self.database.backup_name(),
            &self.stage,
            self.database.kind,
            keep,
        )
        .into_iter()
        .cloned()
        .collect();
        if doomed.is_empty() {
            return Ok(doomed);
        }
        let args: Vec<String> = doomed.iter().map(|f| quote(f)).collect();
        self.conduit.run(
            self.host,
            &format!("cd {} && rm -f -- {}", quote_path(&self.dir), args.join(" ")),
            &ExecOptions::default(),
        )?;
        Ok(doomed)
    }

    /// Replace the live data with `handle`.
    ///
    /// The application is put in maintenance mode from `app_dir` first and
    /// brought back up afterwards even when the restore fails. Failures are
    /// reported in the outcome, never returned as errors.
    pub fn restore(&self, handle: &BackupHandle, app_dir: &str, maintenance: &Maintenance<'_>) -> RestoreOutcome {
        let down = maintenance.down(app_dir).unwrap_or_else(|e| {
            log::warn!("could not enter maintenance mode: {e}");
            false
        });

        let error = self.replace(handle, app_dir).err().map(|e| e.to_string());
        match &error {
            Some(e) => log::warn!("restore from {} failed: {e}", handle.file_name()),
            None => log::info!("restored {}", handle.file_name()),
        }

        if down && let Err(e) = maintenance.up(app_dir) {
            log::warn!("could not leave maintenance mode: {e}");
        }

        RestoreOutcome {
            backup: handle.path.clone(),
            maintenance: down,
            error,
        }
    }

    fn replace(&self, handle: &BackupHandle, app_dir: &str) -> Result<()> {
        self.require_password()?;
        let source = quote_path(&handle.path);
        let script = match self.database.load_command() {
            Some(load) => format!("gunzip -c {source} | {load}"),
            None => format!(
                "cp {source} {}",
                quote_path(&self.sqlite_source(app_dir))
            ),
        };
        self.conduit.run(self.host, &script, &self.opts())?;
        Ok(())
    }
}
