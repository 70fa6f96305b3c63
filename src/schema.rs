//! Deploy config file format
//!
//! One TOML file describes the application and every stage it is deployed
//! to. Component sections at the top level (`[verify]`, `[cache]`, ...)
//! apply to every stage; the same sections under `[environments.<stage>]`
//! override them key by key.

use anyhow::{Context, Result, bail};
use releasekit::conduit::{HostRef, RemoteHost};
use releasekit::config::{ConfigValue, EnvSettings, Scope, Settings};
use releasekit::secrets::SecretSpec;
use releasekit::shell;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::state::config_fingerprint;

// ============================================================================
// Main Config Schema
// ============================================================================

/// The stagehand configuration file
#[derive(Debug, Deserialize)]
pub struct StagehandConfig {
    /// Application identity
    pub application: ApplicationSection,

    /// Secrets resolved from the operator's environment
    #[serde(default)]
    pub secrets: SecretSpec,

    /// Environment file values shared by every stage
    #[serde(default)]
    pub env: EnvSection,

    /// Environment file rules
    #[serde(default)]
    pub env_file: EnvSettings,

    /// Stages, keyed by name
    #[serde(default)]
    pub environments: BTreeMap<String, StageSection>,

    /// Component defaults
    #[serde(flatten)]
    pub components: Components,
}

/// `[application]`
#[derive(Debug, Deserialize)]
pub struct ApplicationSection {
    /// Application name, used for backups and worker programs
    pub name: String,
}

/// `[env]` holds the base layer; `[env.shared]` the shared layer.
#[derive(Debug, Default, Deserialize)]
pub struct EnvSection {
    /// Values shared across stages
    #[serde(default)]
    pub shared: BTreeMap<String, ConfigValue>,

    /// Base values
    #[serde(flatten)]
    pub base: BTreeMap<String, ConfigValue>,
}

/// `[environments.<stage>]`
#[derive(Debug, Deserialize)]
pub struct StageSection {
    /// Host name or address; `local` deploys on this machine
    pub host: String,

    /// SSH login user
    pub user: Option<String>,

    /// SSH port
    pub port: Option<u16>,

    /// Deploy path on the host
    pub deploy_path: String,

    /// Public domain
    pub domain: Option<String>,

    /// Application URL when it is not `https://{domain}`
    pub url: Option<String>,

    /// Shorthand for `database.name`
    pub db_name: Option<String>,

    /// Stage layer of the environment file
    #[serde(default)]
    pub env: BTreeMap<String, ConfigValue>,

    /// Component overrides
    #[serde(flatten)]
    pub components: Components,
}

/// Raw component sections, merged before they are typed.
#[derive(Debug, Default, Deserialize)]
pub struct Components {
    #[serde(default)]
    pub database: toml::Table,
    #[serde(default)]
    pub preflight: toml::Table,
    #[serde(default)]
    pub cache: toml::Table,
    #[serde(default)]
    pub backup: toml::Table,
    #[serde(default)]
    pub migrate: toml::Table,
    #[serde(default)]
    pub verify: toml::Table,
    #[serde(default)]
    pub release: toml::Table,
    #[serde(default)]
    pub services: toml::Table,
    #[serde(default)]
    pub maintenance: toml::Table,
    #[serde(default)]
    pub build: toml::Table,
}

/// A parsed config file and where it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: StagehandConfig,
    pub path: PathBuf,
    /// Fingerprint of the file contents
    pub fingerprint: String,
}

impl StagehandConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<LoadedConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(LoadedConfig {
            config,
            path: path.to_path_buf(),
            fingerprint: config_fingerprint(&content),
        })
    }

    /// Parse config file contents.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid TOML format")?;
        if config.environments.is_empty() {
            bail!("No stages defined; add an [environments.<stage>] section");
        }
        Ok(config)
    }

    /// Stage names, sorted.
    pub fn stage_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    /// Fully resolved and validated settings for one stage.
    pub fn settings(&self, stage: &str) -> Result<Settings> {
        let Some(section) = self.environments.get(stage) else {
            bail!(
                "Unknown stage '{stage}'. Available: {}",
                self.stage_names().join(", ")
            );
        };
        shell::validate_identifier(stage, "stage")?;

        let host = host_ref(stage, section)?;
        let mut settings = Settings::new(&self.application.name, stage, host, &section.deploy_path);
        settings.domain = section.domain.clone();
        settings.url = section.url.clone();
        settings.secrets = self.secrets.clone();
        settings.env = self.env_file.clone();

        let global = &self.components;
        let local = &section.components;
        settings.database = component("database", &global.database, &local.database)?;
        settings.preflight = component("preflight", &global.preflight, &local.preflight)?;
        settings.cache = component("cache", &global.cache, &local.cache)?;
        settings.backup = component("backup", &global.backup, &local.backup)?;
        settings.migrate = component("migrate", &global.migrate, &local.migrate)?;
        settings.verify = component("verify", &global.verify, &local.verify)?;
        settings.release = component("release", &global.release, &local.release)?;
        settings.services = component("services", &global.services, &local.services)?;
        settings.maintenance = component("maintenance", &global.maintenance, &local.maintenance)?;
        settings.build = component("build", &global.build, &local.build)?;

        if let Some(name) = &section.db_name {
            settings.database.name = name.clone();
        }

        settings.store.extend(Scope::Global, self.env.base.clone());
        settings.store.extend(Scope::Shared, self.env.shared.clone());
        settings.store.extend(Scope::Stage, section.env.clone());

        settings.validate()?;
        log::debug!("Resolved settings for {settings}");
        Ok(settings)
    }
}

fn host_ref(stage: &str, section: &StageSection) -> Result<HostRef> {
    if matches!(section.host.as_str(), "local" | "localhost") {
        return Ok(HostRef::Local);
    }
    if section.host.parse::<std::net::IpAddr>().is_err() {
        shell::validate_domain(&section.host)?;
    }
    if let Some(user) = &section.user {
        shell::validate_username(user)?;
    }
    Ok(HostRef::Remote(RemoteHost {
        name: stage.to_string(),
        hostname: section.host.clone(),
        user: section.user.clone(),
        port: section.port,
    }))
}

/// Deserialize a component from the global section with stage overrides.
fn component<T: DeserializeOwned>(name: &str, global: &toml::Table, stage: &toml::Table) -> Result<T> {
    toml::Value::Table(merge_tables(global, stage))
        .try_into()
        .with_context(|| format!("Invalid [{name}] section"))
}

/// Overlay `overlay` onto `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &toml::Table, overlay: &toml::Table) -> toml::Table {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match (merged.get(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(over)) => {
                toml::Value::Table(merge_tables(existing, over))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

// ============================================================================
// Tests
// ============================================================================
