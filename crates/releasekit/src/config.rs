//! Run configuration.
//!
//! [`Settings`] is built once per stage and handed to every component; there
//! is no global registry. Free-form values (the environment file layers)
//! live in a [`ConfigStore`] where a stage override shadows a shared value,
//! which shadows a global one.

use crate::backup::{BackupConfig, DatabaseConfig, DatabaseKind};
use crate::cache::CacheConfig;
use crate::conduit::{Conduit, ExecOptions, HostRef, LocalConduit};
use crate::envfile::{self, EnvMap, ResolvedEnv};
use crate::error::{Error, Result};
use crate::health::{VerifyConfig, check_url};
use crate::migrate::MigrateConfig;
use crate::preflight::PreflightConfig;
use crate::release::{DeployLayout, ReleaseConfig};
use crate::secrets::{SecretMap, SecretSpec};
use crate::service::{MaintenanceConfig, ServiceConfig};
use crate::shell;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Layer a value was set in. Later variants shadow earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Defaults for every stage
    Global,
    /// Shared overrides
    Shared,
    /// Overrides for one stage
    Stage,
}

impl Scope {
    const PRECEDENCE: [Self; 3] = [Self::Stage, Self::Shared, Self::Global];
}

/// Where a lazy value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazySource {
    /// Environment variable on this machine
    Env(String),
    /// Output of a command run on this machine
    Command(String),
}

/// A value computed on first read and then kept for the life of the store.
#[derive(Debug, Clone)]
pub struct LazyValue {
    source: LazySource,
    cell: OnceLock<std::result::Result<String, String>>,
}

impl LazyValue {
    /// Create an unresolved value.
    pub fn new(source: LazySource) -> Self {
        Self {
            source,
            cell: OnceLock::new(),
        }
    }

    /// Source of the value.
    pub fn source(&self) -> &LazySource {
        &self.source
    }

    /// Whether the value was already computed.
    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Compute once, then return the stored result.
    pub fn resolve(&self) -> Result<String> {
        self.cell
            .get_or_init(|| match &self.source {
                LazySource::Env(name) => {
                    std::env::var(name).map_err(|_| format!("environment variable {name} is not set"))
                }
                LazySource::Command(command) => LocalConduit::new()
                    .run(
                        &HostRef::Local,
                        command,
                        &ExecOptions::with_timeout(Duration::from_secs(30)),
                    )
                    .map_err(|e| format!("`{command}` failed: {e}")),
            })
            .clone()
            .map_err(Error::config)
    }
}

impl PartialEq for LazyValue {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Plain string
    Scalar(String),
    /// List of strings
    List(Vec<String>),
    /// Resolved on first read
    Lazy(LazyValue),
}

impl ConfigValue {
    /// Lazy value read from a local environment variable.
    pub fn env(name: impl Into<String>) -> Self {
        Self::Lazy(LazyValue::new(LazySource::Env(name.into())))
    }

    /// Lazy value produced by a local command.
    pub fn command(command: impl Into<String>) -> Self {
        Self::Lazy(LazyValue::new(LazySource::Command(command.into())))
    }

    /// Value as a single string; lists are joined with commas.
    pub fn resolve(&self) -> Result<String> {
        match self {
            Self::Scalar(value) => Ok(value.clone()),
            Self::List(items) => Ok(items.join(",")),
            Self::Lazy(lazy) => lazy.resolve(),
        }
    }

    /// Value as a list; scalars become one element.
    pub fn resolve_list(&self) -> Result<Vec<String>> {
        match self {
            Self::List(items) => Ok(items.clone()),
            other => other.resolve().map(|v| vec![v]),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
    List(Vec<String>),
    Env { env: String },
    Command { command: String },
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match RawValue::deserialize(deserializer)? {
            RawValue::Text(s) => Self::Scalar(s),
            RawValue::Integer(i) => Self::Scalar(i.to_string()),
            RawValue::Float(f) => Self::Scalar(f.to_string()),
            RawValue::Flag(b) => Self::Scalar(b.to_string()),
            RawValue::List(items) => Self::List(items),
            RawValue::Env { env } => Self::env(env),
            RawValue::Command { command } => Self::command(command),
        })
    }
}

/// Layered key/value store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    layers: BTreeMap<Scope, BTreeMap<String, ConfigValue>>,
}

impl ConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value in a layer.
    pub fn set(&mut self, scope: Scope, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.layers
            .entry(scope)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Set every entry of a map in a layer.
    pub fn extend<I, K>(&mut self, scope: Scope, values: I)
    where
        I: IntoIterator<Item = (K, ConfigValue)>,
        K: Into<String>,
    {
        let layer = self.layers.entry(scope).or_default();
        for (key, value) in values {
            layer.insert(key.into(), value);
        }
    }

    /// The winning value for `key` and the layer it came from.
    pub fn lookup(&self, key: &str) -> Option<(Scope, &ConfigValue)> {
        Scope::PRECEDENCE.iter().find_map(|scope| {
            self.layers
                .get(scope)
                .and_then(|layer| layer.get(key))
                .map(|value| (*scope, value))
        })
    }

    /// Resolved string for `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.lookup(key).map(|(_, v)| v.resolve()).transpose()
    }

    /// Resolved list for `key`.
    pub fn get_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.lookup(key).map(|(_, v)| v.resolve_list()).transpose()
    }

    /// Keys of one layer.
    pub fn keys(&self, scope: Scope) -> impl Iterator<Item = &str> {
        self.layers
            .get(&scope)
            .into_iter()
            .flat_map(|layer| layer.keys().map(String::as_str))
    }

    /// One layer with every value resolved.
    pub fn resolve_layer(&self, scope: Scope) -> Result<EnvMap> {
        let Some(layer) = self.layers.get(&scope) else {
            return Ok(EnvMap::new());
        };
        layer
            .iter()
            .map(|(k, v)| v.resolve().map(|value| (k.clone(), value)))
            .collect()
    }
}

/// Environment file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSettings {
    /// Fail on unresolved placeholders and empty required keys
    pub strict: bool,
    /// Keys that must end up non-empty
    pub required_keys: Vec<String>,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            strict: true,
            required_keys: vec!["APP_KEY".to_string()],
        }
    }
}

/// Commands run inside a new release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Before dependencies and assets
    pub commands: Vec<String>,
    /// After migrations, before activation
    pub optimize: Vec<String>,
    /// Timeout per command in seconds
    pub timeout: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            commands: vec![
                "composer install --no-dev --prefer-dist --no-interaction --optimize-autoloader".to_string(),
            ],
            optimize: vec![
                "php artisan storage:link --force".to_string(),
                "php artisan config:cache".to_string(),
                "php artisan route:cache".to_string(),
                "php artisan view:cache".to_string(),
            ],
            timeout: 900,
        }
    }
}

/// Everything one stage's pipeline needs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Application name
    pub application: String,
    /// Stage label
    pub stage: String,
    /// Target host
    pub host: HostRef,
    /// Deploy path on the host
    pub deploy_path: String,
    /// Public domain
    pub domain: Option<String>,
    /// Application URL, defaults to `https://{domain}`
    pub url: Option<String>,
    /// Database
    pub database: DatabaseConfig,
    /// Secrets to resolve
    pub secrets: SecretSpec,
    /// Environment file rules
    pub env: EnvSettings,
    /// Environment file layers
    pub store: ConfigStore,
    /// Preflight
    pub preflight: PreflightConfig,
    /// Build cache
    pub cache: CacheConfig,
    /// Backups
    pub backup: BackupConfig,
    /// Migrations
    pub migrate: MigrateConfig,
    /// Verification
    pub verify: VerifyConfig,
    /// Releases
    pub release: ReleaseConfig,
    /// Services
    pub services: ServiceConfig,
    /// Maintenance mode
    pub maintenance: MaintenanceConfig,
    /// Build commands
    pub build: BuildConfig,
}

impl Settings {
    /// Settings with every component at its defaults.
    pub fn new(
        application: impl Into<String>,
        stage: impl Into<String>,
        host: HostRef,
        deploy_path: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            stage: stage.into(),
            host,
            deploy_path: deploy_path.into(),
            domain: None,
            url: None,
            database: DatabaseConfig::default(),
            secrets: SecretSpec::default(),
            env: EnvSettings::default(),
            store: ConfigStore::new(),
            preflight: PreflightConfig::default(),
            cache: CacheConfig::default(),
            backup: BackupConfig::default(),
            migrate: MigrateConfig::default(),
            verify: VerifyConfig::default(),
            release: ReleaseConfig::default(),
            services: ServiceConfig::default(),
            maintenance: MaintenanceConfig::default(),
            build: BuildConfig::default(),
        }
    }

    /// Paths under the deploy path.
    pub fn layout(&self) -> DeployLayout {
        DeployLayout::new(self.deploy_path.clone())
    }

    /// Base URL of the application.
    pub fn app_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| self.domain.as_ref().map(|d| format!("https://{d}")))
    }

    /// Full URL probed by verification.
    pub fn verify_url(&self) -> Option<String> {
        self.app_url()
            .map(|base| check_url(&base, &self.verify.health_path))
    }

    /// Directories linked from `shared/` into each release, including the
    /// directory of a relative SQLite database.
    pub fn shared_dirs(&self) -> Vec<String> {
        let mut dirs = self.release.shared_dirs.clone();
        if let Some(dir) = self.database.shared_dir()
            && !dirs.iter().any(|d| d == dir)
        {
            dirs.push(dir.to_string());
        }
        dirs
    }

    /// Directory holding backups.
    pub fn backup_dir(&self) -> String {
        self.backup
            .path
            .clone()
            .unwrap_or_else(|| self.layout().backups())
    }

    /// Application log on the host.
    pub fn log_file(&self) -> String {
        format!("{}/{}", self.layout().root(), self.verify.log_file)
    }

    /// Command an operator runs to restore a backup of this stage.
    pub fn restore_command(&self) -> String {
        format!("stagehand db:restore {}", self.stage)
    }

    /// Supervisor program for queue workers, if managed.
    pub fn worker_program(&self) -> Option<String> {
        self.services.worker_program(&self.application, &self.stage)
    }

    /// Base, shared and stage environment layers, lazy values resolved.
    pub fn environment_layers(&self) -> Result<(EnvMap, EnvMap, EnvMap)> {
        Ok((
            self.store.resolve_layer(Scope::Global)?,
            self.store.resolve_layer(Scope::Shared)?,
            self.store.resolve_layer(Scope::Stage)?,
        ))
    }

    /// Merge the environment layers and substitute secrets.
    ///
    /// With `strict` unset, unresolved placeholders are reported in the
    /// result instead of failing.
    pub fn environment(&self, secrets: &SecretMap, strict: bool) -> Result<ResolvedEnv> {
        let (base, shared, stage) = self.environment_layers()?;
        envfile::build_environment(&base, &shared, &stage, secrets, strict, &self.env.required_keys)
    }

    /// Check every value that ends up in a remote command.
    pub fn validate(&self) -> Result<()> {
        shell::validate_identifier(&self.stage, "stage")?;
        shell::validate_deploy_path(&self.deploy_path)?;
        if let Some(domain) = &self.domain {
            shell::validate_domain(domain)?;
        }
        if self.database.kind != DatabaseKind::Sqlite {
            shell::validate_db_name(&self.database.name)?;
            shell::validate_username(&self.database.username)?;
        }
        if let Some(dir) = &self.backup.path {
            shell::validate_deploy_path(dir)?;
        }
        let units = self
            .preflight
            .services
            .iter()
            .flatten()
            .map(|s| s.unit.clone())
            .chain([self.services.php_fpm_unit(), self.services.web_server_unit.clone()])
            .chain(self.services.redis_unit.clone());
        for unit in units {
            shell::validate_identifier(&unit, "service unit")?;
        }
        if let Some(program) = &self.services.worker_program {
            shell::validate_identifier(program, "worker program")?;
        }
        for path in self
            .shared_dirs()
            .iter()
            .chain(&self.release.shared_files)
            .chain([&self.cache.lockfile, &self.cache.dependency_dir, &self.cache.build_output])
        {
            shell::validate_relative_path(path)?;
        }
        if self.release.keep == 0 {
            return Err(Error::config("release.keep must be at least 1"));
        }
        if self.verify.retries == 0 {
            return Err(Error::config("verify.retries must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) on {}", self.application, self.stage, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::ServiceCheck;

    #[test]
    fn test_stage_shadows_shared_shadows_global() {
        let mut store = ConfigStore::new();
        store.set(Scope::Global, "APP_DEBUG", "true");
        store.set(Scope::Shared, "APP_DEBUG", "false");
        store.set(Scope::Global, "APP_NAME", "Shop");
        assert_eq!(store.get("APP_DEBUG").unwrap().as_deref(), Some("false"));

        store.set(Scope::Stage, "APP_DEBUG", "maybe");
        assert_eq!(store.lookup("APP_DEBUG").unwrap().0, Scope::Stage);
        assert_eq!(store.get("APP_DEBUG").unwrap().as_deref(), Some("maybe"));
        assert_eq!(store.get("APP_NAME").unwrap().as_deref(), Some("Shop"));
        assert_eq!(store.get("MISSING").unwrap(), None);
    }

    #[test]
    fn test_lists() {
        let mut store = ConfigStore::new();
        store.set(Scope::Global, "HOSTS", vec!["a".to_string(), "b".to_string()]);
        store.set(Scope::Global, "ONE", "x");
        assert_eq!(store.get("HOSTS").unwrap().as_deref(), Some("a,b"));
        assert_eq!(store.get_list("ONE").unwrap(), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_lazy_value_resolves_once() {
        let value = ConfigValue::command("date +%s%N");
        let ConfigValue::Lazy(lazy) = &value else {
            unreachable!()
        };
        assert!(!lazy.is_resolved());
        let first = value.resolve().unwrap();
        assert!(lazy.is_resolved());
        assert_eq!(value.resolve().unwrap(), first);
    }

    #[test]
    fn test_lazy_values_are_not_shared_between_stores() {
        let mut store = ConfigStore::new();
        store.set(Scope::Global, "BUILT_AT", ConfigValue::command("date +%s%N"));
        let first = store.get("BUILT_AT").unwrap().unwrap();
        let fresh = ConfigStore {
            layers: BTreeMap::from([(
                Scope::Global,
                BTreeMap::from([("BUILT_AT".to_string(), ConfigValue::command("date +%s%N"))]),
            )]),
        };
        assert_ne!(fresh.get("BUILT_AT").unwrap().unwrap(), first);
    }

    #[test]
    fn test_missing_env_lazy_is_config_error() {
        let value = ConfigValue::env("STAGEHAND_TEST_DEFINITELY_UNSET_VAR");
        assert!(matches!(value.resolve(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_resolve_layer() {
        let mut store = ConfigStore::new();
        store.set(Scope::Stage, "APP_ENV", "production");
        store.set(Scope::Stage, "GIT_SHA", ConfigValue::command("echo abc123"));
        let layer = store.resolve_layer(Scope::Stage).unwrap();
        assert_eq!(layer["GIT_SHA"], "abc123");
        assert!(store.resolve_layer(Scope::Shared).unwrap().is_empty());
    }

    #[test]
    fn test_urls() {
        let mut settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        assert_eq!(settings.verify_url(), None);
        settings.domain = Some("shop.example.com".into());
        assert_eq!(settings.verify_url().as_deref(), Some("https://shop.example.com/"));
        settings.url = Some("http://10.0.0.5:8080/".into());
        settings.verify.health_path = "/up".into();
        assert_eq!(settings.verify_url().as_deref(), Some("http://10.0.0.5:8080/up"));
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        settings.database.name = "shop".into();
        assert!(settings.validate().is_ok());

        settings.stage = "prod;reboot".into();
        assert!(settings.validate().is_err());

        settings.stage = "production".into();
        settings.release.shared_dirs.push("../../etc".into());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hostile_unit_names() {
        let mut settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        settings.database.name = "shop".into();
        settings.services.redis_unit = Some("redis\"; touch /tmp/owned; echo \"".into());
        assert!(settings.validate().is_err());

        settings.services.redis_unit = Some("redis-server".into());
        settings.services.web_server_unit = "caddy$(id)".into();
        assert!(settings.validate().is_err());

        settings.services.web_server_unit = "caddy".into();
        settings.preflight.services = Some(vec![ServiceCheck {
            name: "Queue".into(),
            unit: "`reboot`".into(),
        }]);
        assert!(settings.validate().is_err());

        settings.preflight.services = Some(vec![ServiceCheck {
            name: "Queue".into(),
            unit: "shop-queue.service".into(),
        }]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sqlite_directory_is_shared() {
        let mut settings = Settings::new("Shop", "local", HostRef::Local, "/srv/shop");
        assert_eq!(settings.shared_dirs(), vec!["storage".to_string()]);

        settings.database.kind = DatabaseKind::Sqlite;
        assert_eq!(settings.shared_dirs(), vec!["storage".to_string(), "database".to_string()]);
        assert_eq!(
            settings.database.sqlite_file(&settings.layout().shared()),
            "/srv/shop/shared/database/database.sqlite"
        );

        settings.release.shared_dirs.push("database".into());
        assert_eq!(settings.shared_dirs().len(), 2);
    }

    #[test]
    fn test_environment_precedence_and_secrets() {
        let mut settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        settings.store.set(Scope::Global, "APP_ENV", "local");
        settings.store.set(Scope::Global, "APP_KEY", "{app_key}");
        settings.store.set(Scope::Shared, "APP_ENV", "staging");
        settings.store.set(Scope::Stage, "APP_ENV", "production");
        settings.store.set(Scope::Stage, "MAIL_PASSWORD", "{mail_password}");

        let mut secrets = SecretMap::new();
        secrets.insert("app_key", "base64:abc");

        let env = settings.environment(&secrets, false).unwrap();
        assert_eq!(env.values["APP_ENV"], "production");
        assert_eq!(env.values["APP_KEY"], "base64:abc");
        assert_eq!(env.unresolved, vec!["mail_password".to_string()]);

        assert!(matches!(
            settings.environment(&secrets, true),
            Err(Error::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn test_derived_paths() {
        let settings = Settings::new("Shop", "production", HostRef::Local, "/srv/shop");
        assert_eq!(settings.backup_dir(), "/srv/shop/shared/backups");
        assert_eq!(settings.log_file(), "/srv/shop/shared/storage/logs/laravel.log");
        assert_eq!(settings.restore_command(), "stagehand db:restore production");
    }
}
