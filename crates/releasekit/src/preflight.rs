//! Preflight checks.
//!
//! Remote checks are rendered into one script and run in a single round
//! trip. Each prints exactly one `NAME|STATUS|MESSAGE` line. Results are then
//! evaluated here in list order and the first failure aborts the run; a check
//! that printed nothing counts as failed.

use crate::conduit::{Conduit, ExecOptions, HostRef, Secret};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::retry::{LogCallback, RetryConfig, with_retry};
use crate::secrets::DB_PASSWORD;
use crate::shell::{quote, quote_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A service whose liveness is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    /// Check name in reports
    pub name: String,
    /// systemd unit
    pub unit: String,
}

/// Preflight settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Run preflight before deploying
    pub enabled: bool,
    /// Minimum free disk space under the deploy path, in MB
    pub min_disk_mb: u64,
    /// Minimum available memory, in MB
    pub min_memory_mb: u64,
    /// Services to check; derived from the other settings when unset
    pub services: Option<Vec<ServiceCheck>>,
    /// Ping Redis
    pub redis_ping: bool,
    /// Connect to the database with the configured credentials
    pub check_database: bool,
    /// Timeout for the batch, in seconds
    pub timeout: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_disk_mb: 1024,
            min_memory_mb: 512,
            services: None,
            redis_ping: true,
            check_database: true,
            timeout: 60,
        }
    }
}

/// Result status of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Check passed
    Pass,
    /// Check failed
    Fail,
}

impl Status {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
        }
    }
}

/// What a check probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    /// systemd unit is active
    Service {
        /// Unit name
        unit: String,
    },
    /// Free space on the filesystem holding `path`
    DiskSpace {
        /// Path whose filesystem is measured
        path: String,
        /// Threshold in MB
        min_mb: u64,
    },
    /// Available memory
    Memory {
        /// Threshold in MB
        min_mb: u64,
    },
    /// Path writable, or creatable in a writable parent
    Writable {
        /// Path to check
        path: String,
    },
    /// `redis-cli ping` answers PONG
    RedisPing,
    /// SQLite file readable and writable, or creatable on first deploy
    SqliteFile {
        /// Database file
        path: String,
    },
    /// Database client prints `1` for `SELECT 1`
    Database {
        /// Client invocation
        client: String,
        /// Database name for messages
        name: String,
    },
    /// Already evaluated on this machine
    Local {
        /// Outcome
        status: Status,
        /// Message
        message: String,
    },
}

/// A named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Name, also the result key
    pub name: String,
    /// What is probed
    pub kind: CheckKind,
    /// Remediation shown when the check fails
    pub hint: Option<String>,
}

impl Check {
    /// Create a check.
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            hint: None,
        }
    }

    /// Attach a remediation hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Service liveness check with a start hint.
    pub fn service(name: impl Into<String>, unit: &str) -> Self {
        Self::new(name, CheckKind::Service { unit: unit.to_string() })
            .with_hint(format!("Start with: sudo systemctl start {unit}"))
    }

    /// Secret placeholders left unresolved.
    pub fn secrets(unresolved: &[String]) -> Self {
        let (status, message) = if unresolved.is_empty() {
            (Status::Pass, "All secrets are resolved".to_string())
        } else {
            (
                Status::Fail,
                format!("Unresolved secret placeholders: {}", unresolved.join(", ")),
            )
        };
        Self::new("Secrets", CheckKind::Local { status, message })
            .with_hint("Export the missing STAGEHAND_* variables before deploying")
    }

    fn is_remote(&self) -> bool {
        !matches!(self.kind, CheckKind::Local { .. })
    }

    /// Bash fragment printing this check's result line.
    pub fn script(&self) -> String {
        let name = quote(&self.name);
        let pass = |msg: &str| format!("printf '%s|PASS|%s\\n' {name} \"{msg}\"");
        let fail = |msg: &str| format!("printf '%s|FAIL|%s\\n' {name} \"{msg}\"");

        match &self.kind {
            CheckKind::Service { unit } => {
                let u = quote(unit);
                format!(
                    "if [ \"$(systemctl is-active {u} 2>/dev/null)\" = active ]; then \
                     printf '%s|PASS|%s\\n' {name} {}; else printf '%s|FAIL|%s\\n' {name} {}; fi",
                    quote(&format!("{unit} is running")),
                    quote(&format!("{unit} is not running")),
                )
            }
            CheckKind::DiskSpace { path, min_mb } => {
                let p = quote_path(path);
                format!(
                    "disk=$(df -BM {p} 2>/dev/null | tail -1 | awk '{{print $4}}' | tr -d M); \
                     if [ \"${{disk:-0}}\" -ge {min_mb} ] 2>/dev/null; then {}; else {}; fi",
                    pass(&format!("Available: ${{disk}}MB (threshold: {min_mb}MB)")),
                    fail(&format!("Only ${{disk:-0}}MB available, need at least {min_mb}MB")),
                )
            }
            CheckKind::Memory { min_mb } => format!(
                "mem=$(free -m 2>/dev/null | awk '/^Mem:/ {{print $7}}'); \
                 if [ \"${{mem:-0}}\" -ge {min_mb} ] 2>/dev/null; then {}; else {}; fi",
                pass(&format!("Available: ${{mem}}MB (threshold: {min_mb}MB)")),
                fail(&format!("Only ${{mem:-0}}MB available, need at least {min_mb}MB")),
            ),
            CheckKind::Writable { path } => {
                let p = quote_path(path);
                format!(
                    "target={p}; parent=$(dirname \"$target\"); \
                     if [ -d \"$target\" ]; then \
                     if [ -w \"$target\" ]; then {}; else {}; fi; \
                     elif [ -w \"$parent\" ]; then {}; else {}; fi",
                    pass("$target is writable"),
                    fail("$target is not writable"),
                    pass("$target will be created in $parent"),
                    fail("cannot create $target, $parent is not writable"),
                )
            }
            CheckKind::RedisPing => format!(
                "if [ \"$(redis-cli ping 2>/dev/null)\" = PONG ]; then {}; else {}; fi",
                pass("Redis responding to ping"),
                fail("Redis not responding"),
            ),
            CheckKind::SqliteFile { path } => {
                let p = quote_path(path);
                format!(
                    "db={p}; if [ -e \"$db\" ]; then \
                     if [ -r \"$db\" ] && [ -w \"$db\" ]; then {}; else {}; fi; \
                     else dir=$(dirname \"$db\"); while [ ! -d \"$dir\" ]; do dir=$(dirname \"$dir\"); done; \
                     if [ -w \"$dir\" ]; then {}; else {}; fi; fi",
                    pass("$db is readable and writable"),
                    fail("$db is not readable and writable"),
                    pass("$db will be created under $dir"),
                    fail("cannot create $db, $dir is not writable"),
                )
            }
            CheckKind::Database { client, name } => format!(
                "if [ \"$({client} 2>/dev/null | tr -d '[:space:]')\" = 1 ]; then {}; else {}; fi",
                pass(&format!("Connected to database {name}")),
                fail(&format!("Cannot connect to database {name}")),
            ),
            CheckKind::Local { status, message } => {
                format!("printf '%s|{status}|%s\\n' {name} {}", quote(message))
            }
        }
    }
}

/// Render the remote checks into one script.
pub fn batch_script(checks: &[Check]) -> String {
    checks
        .iter()
        .filter(|c| c.is_remote())
        .map(|c| format!("{{ {}; }}", c.script()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parsed result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Outcome
    pub status: Status,
    /// Message printed by the check
    pub message: String,
}

/// Parse `NAME|STATUS|MESSAGE` lines. Other lines are ignored; the first
/// result for a name wins.
pub fn parse_results(output: &str) -> BTreeMap<String, CheckResult> {
    let mut results = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(3, '|');
        let (Some(name), Some(status), Some(message)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some(status) = Status::parse(status) else {
            continue;
        };
        results.entry(name.trim().to_string()).or_insert_with(|| CheckResult {
            name: name.trim().to_string(),
            status,
            message: message.trim().to_string(),
        });
    }
    results
}

/// Outcome of a successful preflight run.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// Results in evaluation order
    pub results: Vec<CheckResult>,
}

/// Evaluate results in the order of `checks`, failing on the first failure.
pub fn evaluate(checks: &[Check], results: &BTreeMap<String, CheckResult>) -> Result<PreflightReport> {
    let mut report = PreflightReport::default();
    for check in checks {
        let result = match &check.kind {
            CheckKind::Local { status, message } => CheckResult {
                name: check.name.clone(),
                status: *status,
                message: message.clone(),
            },
            _ => results.get(&check.name).cloned().ok_or_else(|| Error::Preflight {
                check: check.name.clone(),
                message: "Check did not return a result".to_string(),
                hint: check.hint.clone(),
            })?,
        };

        if result.status == Status::Fail {
            return Err(Error::Preflight {
                check: check.name.clone(),
                message: result.message,
                hint: check.hint.clone(),
            });
        }
        log::info!("[PASS] {}: {}", result.name, result.message);
        report.results.push(result);
    }
    Ok(report)
}

/// Runs a check list against one host.
pub struct Preflight<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    config: &'a PreflightConfig,
    secret: Option<Secret>,
}

impl<'a> Preflight<'a> {
    /// Create a runner. `secret` is the database password for connectivity checks.
    pub fn new(
        conduit: &'a dyn Conduit,
        host: &'a HostRef,
        config: &'a PreflightConfig,
        secret: Option<Secret>,
    ) -> Self {
        Self {
            conduit,
            host,
            config,
            secret,
        }
    }

    /// Run every remote check in one round trip, then evaluate all of them.
    pub fn run(&self, checks: &[Check]) -> Result<PreflightReport> {
        let script = batch_script(checks);
        let output = if script.is_empty() {
            String::new()
        } else {
            let opts = ExecOptions::with_timeout(Duration::from_secs(self.config.timeout))
                .secret(self.secret.as_ref());
            with_retry(&RetryConfig::default(), Some(&LogCallback), || {
                self.conduit.execute(self.host, &script, &opts)
            })?
            .stdout
        };
        evaluate(checks, &parse_results(&output))
    }

    /// `df -h` for the deploy path.
    pub fn disk_report(&self, path: &str) -> Result<String> {
        self.conduit.run(
            self.host,
            &format!("df -h {}", quote_path(path)),
            &ExecOptions::default(),
        )
    }

    /// `free -h`.
    pub fn memory_report(&self) -> Result<String> {
        self.conduit.run(self.host, "free -h", &ExecOptions::default())
    }
}

fn title(unit: &str) -> String {
    let mut chars = unit.chars();
    chars
        .next()
        .map(|c| c.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

/// Services checked when none are configured explicitly.
pub fn default_services(settings: &Settings) -> Vec<ServiceCheck> {
    let mut services = vec![ServiceCheck {
        name: "PHP-FPM".to_string(),
        unit: settings.services.php_fpm_unit(),
    }];
    if let Some(unit) = &settings.services.redis_unit {
        services.push(ServiceCheck {
            name: "Redis".to_string(),
            unit: unit.clone(),
        });
    }
    if let Some((name, unit)) = settings.database.kind.service_unit() {
        services.push(ServiceCheck {
            name: name.to_string(),
            unit: unit.to_string(),
        });
    }
    if settings.domain.is_some() {
        services.push(ServiceCheck {
            name: title(&settings.services.web_server_unit),
            unit: settings.services.web_server_unit.clone(),
        });
    }
    services
}

/// The standard check list for a stage, in evaluation order.
///
/// `unresolved` lists placeholders the environment could not resolve and
/// `db_password` says whether a database password is available.
pub fn standard_checks(settings: &Settings, unresolved: &[String], db_password: bool) -> Vec<Check> {
    let config = &settings.preflight;
    let services = config
        .services
        .clone()
        .unwrap_or_else(|| default_services(settings));

    let mut checks: Vec<Check> = services
        .iter()
        .map(|s| Check::service(s.name.clone(), &s.unit))
        .collect();

    checks.push(
        Check::new(
            "Disk Space",
            CheckKind::DiskSpace {
                path: settings.deploy_path.clone(),
                min_mb: config.min_disk_mb,
            },
        )
        .with_hint("Free up space or lower preflight.min_disk_mb"),
    );
    checks.push(
        Check::new("Memory", CheckKind::Memory { min_mb: config.min_memory_mb })
            .with_hint("Stop memory-hungry processes or lower preflight.min_memory_mb"),
    );
    checks.push(
        Check::new(
            "Deploy Path",
            CheckKind::Writable {
                path: settings.deploy_path.clone(),
            },
        )
        .with_hint("Fix ownership of the deploy path for the deploy user"),
    );
    if config.redis_ping && settings.services.redis_unit.is_some() {
        checks.push(
            Check::new("Redis Connection", CheckKind::RedisPing)
                .with_hint("Check that Redis listens on the default socket"),
        );
    }
    checks.push(Check::secrets(unresolved));

    if config.check_database {
        checks.push(database_check(settings, db_password));
    }
    checks
}

fn database_check(settings: &Settings, db_password: bool) -> Check {
    let database = &settings.database;
    match database.client_command("SELECT 1") {
        None => Check::new(
            "Database",
            CheckKind::SqliteFile {
                path: database.sqlite_file(&settings.layout().shared()),
            },
        )
        .with_hint("Fix ownership of the shared database directory for the deploy user"),
        Some(_) if !db_password => Check::new(
            "Database",
            CheckKind::Local {
                status: Status::Fail,
                message: format!("No password available for database {}", database.name),
            },
        )
        .with_hint(format!(
            "Export {} before deploying",
            settings.secrets.variable(&DB_PASSWORD.to_uppercase())
        )),
        Some(client) => Check::new(
            "Database",
            CheckKind::Database {
                client,
                name: database.name.clone(),
            },
        )
        .with_hint("Check credentials and that the database exists"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::DatabaseKind;
    use crate::conduit::mock::{Reply, ScriptedConduit};

    fn checks() -> Vec<Check> {
        vec![
            Check::service("PHP-FPM", "php8.4-fpm"),
            Check::service("PostgreSQL", "postgresql"),
            Check::new("Memory", CheckKind::Memory { min_mb: 512 }),
        ]
    }

    #[test]
    fn test_parse_results() {
        let out = "noise\nPHP-FPM|PASS|php8.4-fpm is running\nDisk Space|FAIL|Only 10MB | left\nBogus|MAYBE|x\n";
        let results = parse_results(out);
        assert_eq!(results.len(), 2);
        assert_eq!(results["PHP-FPM"].status, Status::Pass);
        assert_eq!(results["Disk Space"].message, "Only 10MB | left");
    }

    #[test]
    fn test_missing_result_line_fails() {
        let out = "PHP-FPM|PASS|running\nMemory|PASS|Available: 2048MB\n";
        let err = evaluate(&checks(), &parse_results(out)).unwrap_err();
        assert_eq!(err.to_string(), "PostgreSQL: Check did not return a result");
    }

    #[test]
    fn test_first_failure_in_list_order_wins() {
        let out = "Memory|FAIL|Only 100MB available\nPostgreSQL|FAIL|postgresql is not running\nPHP-FPM|PASS|ok\n";
        let err = evaluate(&checks(), &parse_results(out)).unwrap_err();
        match err {
            Error::Preflight { check, hint, .. } => {
                assert_eq!(check, "PostgreSQL");
                assert_eq!(hint.as_deref(), Some("Start with: sudo systemctl start postgresql"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_local_checks_need_no_output() {
        let list = vec![Check::secrets(&[])];
        assert_eq!(evaluate(&list, &BTreeMap::new()).unwrap().results.len(), 1);

        let list = vec![Check::secrets(&["{app_key}".to_string()])];
        let err = evaluate(&list, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("{app_key}"));
    }

    #[test]
    fn test_batch_is_one_round_trip() {
        let conduit = ScriptedConduit::new();
        conduit.on(
            "systemctl is-active",
            "PHP-FPM|PASS|php8.4-fpm is running\nPostgreSQL|PASS|postgresql is running\nMemory|PASS|Available: 900MB\n",
        );
        let host = HostRef::Local;
        let config = PreflightConfig::default();
        let preflight = Preflight::new(&conduit, &host, &config, None);
        let mut list = checks();
        list.push(Check::secrets(&[]));
        let report = preflight.run(&list).unwrap();
        assert_eq!(report.results.len(), 4);
        assert_eq!(conduit.calls().len(), 1);
    }

    #[test]
    fn test_transport_error_is_retried() {
        let conduit = ScriptedConduit::new();
        conduit.on_seq(
            "systemctl",
            vec![
                Reply::Timeout,
                Reply::ok("PHP-FPM|PASS|ok\nPostgreSQL|PASS|ok\nMemory|PASS|ok\n"),
            ],
        );
        let host = HostRef::Local;
        let config = PreflightConfig::default();
        let preflight = Preflight::new(&conduit, &host, &config, None);
        assert!(preflight.run(&checks()).is_ok());
        assert_eq!(conduit.calls().len(), 2);
    }

    #[test]
    fn test_database_check_reads_password_from_side_channel() {
        let conduit = ScriptedConduit::new();
        conduit.on("psql", "Database|PASS|Connected to database shop\n");
        let host = HostRef::Local;
        let config = PreflightConfig::default();
        let preflight = Preflight::new(&conduit, &host, &config, Some(Secret::new("pw")));
        let client = "PGPASSWORD=\"$STAGEHAND_SECRET\" psql -h 127.0.0.1 -U deployer -d shop -tAc 'SELECT 1'";
        let list = vec![Check::new(
            "Database",
            CheckKind::Database {
                client: client.to_string(),
                name: "shop".into(),
            },
        )];
        preflight.run(&list).unwrap();
        let call = &conduit.calls()[0];
        assert!(!call.script.contains("pw"));
        assert_eq!(call.secret.as_deref(), Some("pw"));
    }

    #[test]
    fn test_check_scripts_emit_one_line_each() {
        let script = Check::service("Caddy", "caddy").script();
        assert!(script.contains("printf '%s|PASS|%s\\n' Caddy 'caddy is running'"));
        assert!(script.contains("printf '%s|FAIL|%s\\n' Caddy 'caddy is not running'"));

        let script = Check::new("Deploy Path", CheckKind::Writable { path: "/srv/my app".into() }).script();
        assert!(script.starts_with("target='/srv/my app';"));
        assert!(script.contains("'Deploy Path'"));
    }

    #[test]
    fn test_disk_script_threshold_is_configurable() {
        let script = Check::new(
            "Disk Space",
            CheckKind::DiskSpace {
                path: "/srv/shop".into(),
                min_mb: 4096,
            },
        )
        .script();
        assert!(script.contains("-ge 4096"));
        assert!(script.contains("df -BM /srv/shop"));
    }

    #[test]
    fn test_service_messages_are_single_quoted() {
        let script = Check::service("Queue", "q\"; echo 'Secrets|PASS|x").script();
        assert!(!script.contains("\"q\";"));
        assert!(script.contains("'q\"; echo '\\''Secrets|PASS|x is running'"));
    }

    fn stage(kind: DatabaseKind) -> Settings {
        let mut settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        settings.database.kind = kind;
        settings.database.name = "shop".into();
        settings
    }

    fn database_of(checks: &[Check]) -> &Check {
        checks
            .iter()
            .find(|c| c.name == "Database")
            .expect("database check present")
    }

    #[test]
    fn test_sqlite_database_is_checked_on_the_shared_file() {
        let checks = standard_checks(&stage(DatabaseKind::Sqlite), &[], false);
        let check = database_of(&checks);
        assert_eq!(
            check.kind,
            CheckKind::SqliteFile {
                path: "/srv/shop/shared/database/database.sqlite".into()
            }
        );
        let script = check.script();
        assert!(script.contains("[ -r \"$db\" ] && [ -w \"$db\" ]"));
    }

    #[test]
    fn test_server_database_without_password_fails_instead_of_vanishing() {
        let checks = standard_checks(&stage(DatabaseKind::Postgres), &[], false);
        let check = database_of(&checks);
        assert!(matches!(check.kind, CheckKind::Local { status: Status::Fail, .. }));
        assert!(check.hint.as_deref().unwrap().contains("STAGEHAND_DB_PASSWORD"));

        let err = evaluate(std::slice::from_ref(check), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::Preflight { check, .. } if check == "Database"));
    }

    #[test]
    fn test_database_check_skipped_only_when_disabled() {
        let mut settings = stage(DatabaseKind::Postgres);
        let checks = standard_checks(&settings, &[], true);
        assert!(matches!(database_of(&checks).kind, CheckKind::Database { .. }));

        settings.preflight.check_database = false;
        let checks = standard_checks(&settings, &[], true);
        assert!(!checks.iter().any(|c| c.name == "Database"));
    }

    #[test]
    fn test_title() {
        assert_eq!(title("caddy"), "Caddy");
        assert_eq!(title(""), "");
    }
}
