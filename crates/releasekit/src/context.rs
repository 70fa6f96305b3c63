//! Deploy context and callback traits
//!
//! The callbacks let the engine ask questions and report progress without
//! depending on a terminal. [`DeployContext`] carries everything one stage's
//! pipeline reads and the facts its phases record for later phases and hooks.

use crate::backup::BackupManager;
use crate::cache::CacheOutcome;
use crate::conduit::{Conduit, HostRef, Secret};
use crate::config::Settings;
use crate::envfile::ResolvedEnv;
use crate::error::{Error, Result};
use crate::health::{HttpProbe, VerifyResult};
use crate::migrate::MigrationReport;
use crate::preflight::PreflightReport;
use crate::release::{DeployLayout, ReleaseId, ReleaseManager, RollbackOutcome};
use crate::secrets::{DB_PASSWORD, SUDO_PASS, SecretMap};
use crate::service::{Maintenance, ServiceControl};
use std::time::Duration;

/// Confirmation callback for operator decisions
///
/// Implement this trait to handle confirmations such as continuing a
/// migration without a backup.
pub trait ConfirmCallback: Send {
    /// Ask the operator to confirm an action
    ///
    /// # Returns
    /// `true` if the operator confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Progress callback for pipeline runs
pub trait ProgressCallback: Send {
    /// Called before a phase starts
    fn on_phase_start(&mut self, index: usize, total: usize, name: &str);

    /// Called when a phase finished successfully
    fn on_phase_complete(&mut self, name: &str, elapsed: Duration);

    /// Called when a phase failed
    fn on_phase_failed(&mut self, name: &str, error: &Error);

    /// Called before a cleanup hook runs
    fn on_hook(&mut self, name: &str);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase_start(&mut self, _index: usize, _total: usize, _name: &str) {}
    fn on_phase_complete(&mut self, _name: &str, _elapsed: Duration) {}
    fn on_phase_failed(&mut self, _name: &str, _error: &Error) {}
    fn on_hook(&mut self, _name: &str) {}
}

/// State of one stage's deploy run.
pub struct DeployContext<'a> {
    /// Resolved settings
    pub settings: &'a Settings,
    /// Command conduit to the stage's host
    pub conduit: &'a dyn Conduit,
    /// Resolved secrets
    pub secrets: &'a SecretMap,
    /// HTTP client used by verification
    pub probe: &'a dyn HttpProbe,
    /// Operator confirmations
    pub confirm: Box<dyn ConfirmCallback>,
    /// Release being deployed
    pub release: Option<ReleaseId>,
    /// Release that was active when the run started
    pub previous: Option<ReleaseId>,
    /// The new release became active
    pub activated: bool,
    /// Verification failed for the active release
    pub unhealthy: bool,
    /// This run holds the deploy lock
    pub locked: bool,
    /// Environment written to the host
    pub environment: Option<ResolvedEnv>,
    /// Preflight results
    pub preflight: Option<PreflightReport>,
    /// Cache outcomes per domain
    pub cache: Vec<(String, CacheOutcome)>,
    /// Migration controller report
    pub migration: Option<MigrationReport>,
    /// Verification result
    pub verification: Option<VerifyResult>,
    /// Application log captured after a failed verification
    pub log_tail: Option<String>,
    /// Rollback performed by a failure hook
    pub rollback: Option<RollbackOutcome>,
    /// Releases deleted after a successful deploy
    pub pruned: Vec<ReleaseId>,
}

impl<'a> DeployContext<'a> {
    /// Fresh context for one run.
    pub fn new(
        settings: &'a Settings,
        conduit: &'a dyn Conduit,
        secrets: &'a SecretMap,
        probe: &'a dyn HttpProbe,
        confirm: Box<dyn ConfirmCallback>,
    ) -> Self {
        Self {
            settings,
            conduit,
            secrets,
            probe,
            confirm,
            release: None,
            previous: None,
            activated: false,
            unhealthy: false,
            locked: false,
            environment: None,
            preflight: None,
            cache: Vec::new(),
            migration: None,
            verification: None,
            log_tail: None,
            rollback: None,
            pruned: Vec::new(),
        }
    }

    /// Target host.
    pub fn host(&self) -> &'a HostRef {
        &self.settings.host
    }

    /// Paths under the deploy path.
    pub fn layout(&self) -> DeployLayout {
        self.settings.layout()
    }

    /// Sudo password for privileged commands.
    pub fn sudo(&self) -> Option<Secret> {
        self.secrets.secret(SUDO_PASS)
    }

    /// Database password for dumps and client commands.
    pub fn db_password(&self) -> Option<Secret> {
        self.secrets.secret(DB_PASSWORD)
    }

    /// Directory of the release being deployed.
    pub fn release_dir(&self) -> Result<String> {
        self.release
            .as_ref()
            .map(|id| self.layout().release(id))
            .ok_or_else(|| Error::config("no release has been created in this run"))
    }

    /// Service controller for the stage.
    pub fn services(&self) -> ServiceControl<'a> {
        ServiceControl::new(
            self.conduit,
            self.host(),
            &self.settings.services,
            self.settings.worker_program(),
            self.sudo(),
        )
    }

    /// Maintenance mode controller for the stage.
    pub fn maintenance(&self) -> Maintenance<'a> {
        Maintenance::new(self.conduit, self.host(), &self.settings.maintenance)
    }

    /// Release manager without service control.
    pub fn releases(&self) -> ReleaseManager<'a> {
        ReleaseManager::new(self.conduit, self.host(), self.layout())
    }

    /// Backup manager for the stage.
    pub fn backups(&self) -> BackupManager<'a> {
        BackupManager::new(
            self.conduit,
            self.host(),
            &self.settings.backup,
            &self.settings.database,
            self.settings.stage.clone(),
            self.settings.backup_dir(),
            self.db_password(),
        )
        .with_shared_root(self.layout().shared())
    }
}
