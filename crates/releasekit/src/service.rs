//! Dependent services: the PHP-FPM pool, supervisor queue workers and the
//! application's maintenance mode.
//!
//! Privileged commands always go through [`conduit::sudo`] with the sudo
//! password on the side channel. Hosts with passwordless sudo simply ignore
//! the empty line.

use crate::conduit::{self, Conduit, ExecOptions, HostRef, Secret};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, poll_until};
use crate::shell::{in_dir, quote, quote_path};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// PHP version used to derive the FPM unit name
    pub php_version: String,
    /// Explicit FPM unit, overrides the derived `php{version}-fpm`
    pub php_fpm_unit: Option<String>,
    /// Restart FPM on activation
    pub restart_php_fpm: bool,
    /// Redis unit, `None` when the app does not use Redis
    pub redis_unit: Option<String>,
    /// Web server unit checked when a domain is configured
    pub web_server_unit: String,
    /// Manage supervisor queue workers
    pub workers: bool,
    /// Explicit supervisor program, overrides `{app}-{stage}-worker`
    pub worker_program: Option<String>,
    /// Status polls after a restart
    pub ready_checks: u32,
    /// Milliseconds between status polls
    pub ready_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            php_version: "8.4".to_string(),
            php_fpm_unit: None,
            restart_php_fpm: true,
            redis_unit: Some("redis-server".to_string()),
            web_server_unit: "caddy".to_string(),
            workers: false,
            worker_program: None,
            ready_checks: 10,
            ready_interval_ms: 500,
        }
    }
}

impl ServiceConfig {
    /// FPM unit name.
    pub fn php_fpm_unit(&self) -> String {
        self.php_fpm_unit
            .clone()
            .unwrap_or_else(|| format!("php{}-fpm", self.php_version))
    }

    /// Supervisor program for this application and stage, if workers are managed.
    pub fn worker_program(&self, application: &str, stage: &str) -> Option<String> {
        if !self.workers {
            return None;
        }
        Some(
            self.worker_program
                .clone()
                .unwrap_or_else(|| worker_program_name(application, stage)),
        )
    }
}

/// Worker program name derived from the environment identity.
pub fn worker_program_name(application: &str, stage: &str) -> String {
    let slug: String = format!("{application}-{stage}-worker")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug
}

/// State of the supervisor program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Workers are not managed for this stage
    Disabled,
    /// supervisorctl is not installed
    NotInstalled,
    /// The program is not in the supervisor config yet
    NotConfigured,
    /// `supervisorctl status` output
    Status(String),
}

/// Restarts and queries dependent services on one host.
pub struct ServiceControl<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    config: &'a ServiceConfig,
    worker: Option<String>,
    sudo: Option<Secret>,
}

impl<'a> ServiceControl<'a> {
    /// Create a controller.
    pub fn new(
        conduit: &'a dyn Conduit,
        host: &'a HostRef,
        config: &'a ServiceConfig,
        worker: Option<String>,
        sudo: Option<Secret>,
    ) -> Self {
        Self {
            conduit,
            host,
            config,
            worker,
            sudo,
        }
    }

    fn privileged(&self, command: &str) -> Result<String> {
        self.conduit.run(
            self.host,
            &conduit::sudo(command),
            &ExecOptions::with_timeout(Duration::from_secs(120)).secret(self.sudo.as_ref()),
        )
    }

    /// Whether a systemd unit is active.
    pub fn is_active(&self, unit: &str) -> Result<bool> {
        let out = self.conduit.run(
            self.host,
            &format!("systemctl is-active {} 2>/dev/null || true", quote(unit)),
            &ExecOptions::default(),
        )?;
        Ok(out.trim() == "active")
    }

    /// Restart a unit and wait until systemd reports it active.
    pub fn restart_unit(&self, unit: &str) -> Result<()> {
        self.privileged(&format!("systemctl restart {}", quote(unit)))?;
        let schedule = RetryConfig::fixed(
            self.config.ready_checks,
            Duration::from_millis(self.config.ready_interval_ms),
        );
        if poll_until(&schedule, || self.is_active(unit))? {
            log::info!("restarted {unit}");
            Ok(())
        } else {
            Err(Error::CommandFailed {
                host: self.host.label().to_string(),
                command: format!("systemctl is-active {unit}"),
                code: 3,
                stderr: format!("{unit} failed to become active after restart"),
            })
        }
    }

    /// Restart the FPM pool if configured to.
    pub fn restart_php_fpm(&self) -> Result<()> {
        if !self.config.restart_php_fpm {
            return Ok(());
        }
        self.restart_unit(&self.config.php_fpm_unit())
    }

    /// Current state of the worker program.
    pub fn worker_state(&self) -> Result<WorkerState> {
        let Some(program) = &self.worker else {
            return Ok(WorkerState::Disabled);
        };
        if !self.conduit.test(self.host, "[ -x /usr/bin/supervisorctl ]")? {
            return Ok(WorkerState::NotInstalled);
        }
        let out = self.conduit.execute(
            self.host,
            &conduit::sudo(&format!("supervisorctl status {}", quote(&format!("{program}:*")))),
            &ExecOptions::default().secret(self.sudo.as_ref()),
        )?;
        let text = format!("{}{}", out.stdout, out.stderr);
        if text.contains("no such") || text.contains("ERROR") {
            Ok(WorkerState::NotConfigured)
        } else {
            Ok(WorkerState::Status(text.trim().to_string()))
        }
    }

    fn supervisor(&self, action: &str) -> Result<bool> {
        let program = match self.worker_state()? {
            WorkerState::Disabled => return Ok(false),
            WorkerState::NotInstalled => {
                log::warn!("supervisor is not installed, skipping worker {action}");
                return Ok(false);
            }
            WorkerState::NotConfigured => {
                log::info!("worker program not configured yet, reloading supervisor");
                self.reload_workers()?;
                return Ok(false);
            }
            WorkerState::Status(_) => self.worker.clone().unwrap_or_default(),
        };
        self.privileged(&format!("supervisorctl {action} {}", quote(&format!("{program}:*"))))?;
        Ok(true)
    }

    /// Stop workers before the active release changes.
    pub fn pause_workers(&self) -> Result<bool> {
        self.supervisor("stop")
    }

    /// Restart workers against the new release.
    pub fn restart_workers(&self) -> Result<bool> {
        let restarted = self.supervisor("restart")?;
        if restarted
            && let WorkerState::Status(status) = self.worker_state()?
            && !status.contains("RUNNING")
        {
            log::warn!("queue workers may not be running correctly: {status}");
        }
        Ok(restarted)
    }

    /// Re-read supervisor configuration.
    pub fn reload_workers(&self) -> Result<()> {
        self.privileged("supervisorctl reread")?;
        self.privileged("supervisorctl update")?;
        Ok(())
    }

    /// Unit name and `systemctl is-active` state for every known service.
    /// Best effort: query failures show as `unknown`.
    pub fn report(&self, units: &[String]) -> Vec<(String, String)> {
        units
            .iter()
            .map(|unit| {
                let state = self
                    .conduit
                    .run(
                        self.host,
                        &format!("systemctl is-active {} 2>/dev/null || true", quote(unit)),
                        &ExecOptions::default(),
                    )
                    .map(|s| if s.is_empty() { "unknown".to_string() } else { s })
                    .unwrap_or_else(|_| "unknown".to_string());
                (unit.clone(), state)
            })
            .collect()
    }
}

/// Maintenance mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Toggle maintenance mode around activation and restores
    pub enabled: bool,
    /// Command run inside the release to enter maintenance mode
    pub down_command: String,
    /// Command run inside the release to leave maintenance mode
    pub up_command: String,
    /// File that must exist in a release before `down_command` can run
    pub entry_point: String,
    /// File whose presence confirms maintenance mode
    pub marker: Option<String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            down_command: "php artisan down --retry=60".to_string(),
            up_command: "php artisan up".to_string(),
            entry_point: "artisan".to_string(),
            marker: Some("storage/framework/down".to_string()),
        }
    }
}

/// Puts the application in and out of maintenance mode.
pub struct Maintenance<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    config: &'a MaintenanceConfig,
}

impl<'a> Maintenance<'a> {
    /// Create a maintenance controller.
    pub fn new(conduit: &'a dyn Conduit, host: &'a HostRef, config: &'a MaintenanceConfig) -> Self {
        Self {
            conduit,
            host,
            config,
        }
    }

    /// Enter maintenance mode from `release_dir`.
    ///
    /// Returns false when disabled or when the directory holds no application.
    pub fn down(&self, release_dir: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let entry = quote_path(&format!("{release_dir}/{}", self.config.entry_point));
        if !self.conduit.test(self.host, &format!("[ -f {entry} ]"))? {
            log::debug!("no application in {release_dir}, skipping maintenance mode");
            return Ok(false);
        }
        self.conduit.run(
            self.host,
            &in_dir(release_dir, &self.config.down_command),
            &ExecOptions::with_timeout(Duration::from_secs(120)),
        )?;

        if let Some(marker) = &self.config.marker {
            let marker = quote_path(&format!("{release_dir}/{marker}"));
            if !self.conduit.test(self.host, &format!("[ -e {marker} ]"))? {
                log::warn!("maintenance marker not found, maintenance mode may not be active");
            }
        }
        log::info!("maintenance mode enabled");
        Ok(true)
    }

    /// Leave maintenance mode from `release_dir`.
    pub fn up(&self, release_dir: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.conduit.run(
            self.host,
            &in_dir(release_dir, &self.config.up_command),
            &ExecOptions::with_timeout(Duration::from_secs(120)),
        )?;
        log::info!("application is live");
        Ok(())
    }
}
