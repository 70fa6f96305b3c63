//! Deploy phases.
//!
//! Each phase reads what it needs from the [`DeployContext`], performs its
//! remote work and records its result on the context for later phases and
//! failure hooks. Phases run in the order [`standard_phases`] returns them.

use crate::backup::DatabaseKind;
use crate::cache::remote::RemoteCache;
use crate::conduit::{Conduit, ExecOptions, HostRef, Secret};
use crate::context::DeployContext;
use crate::envfile::{self, EnvMap, ResolvedEnv};
use crate::error::{Error, Result};
use crate::health::{HealthVerifier, tail_log};
use crate::migrate::{MigrationController, ensure_sqlite};
use crate::preflight::{Preflight, standard_checks};
use crate::release::{DeployLayout, ReleaseId};
use crate::shell::{in_dir, quote, quote_path};
use std::time::Duration;

/// One step of the deploy pipeline.
pub trait Phase: Send + Sync {
    /// Name shown in progress output and errors.
    fn name(&self) -> &'static str;

    /// Run the phase. An error aborts the remaining pipeline.
    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()>;
}

/// The deploy lock under the deploy path.
///
/// `mkdir` is atomic, so two runs racing for the lock cannot both win.
pub struct DeployLock<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    layout: DeployLayout,
}

impl<'a> DeployLock<'a> {
    /// Lock for the given layout.
    pub fn new(conduit: &'a dyn Conduit, host: &'a HostRef, layout: DeployLayout) -> Self {
        Self {
            conduit,
            host,
            layout,
        }
    }

    fn owner_file(&self) -> String {
        format!("{}/owner", self.layout.lock())
    }

    /// Take the lock, recording `owner` inside it.
    pub fn acquire(&self, owner: &str) -> Result<()> {
        let lock = self.layout.lock();
        let out = self.conduit.execute(
            self.host,
            &format!(
                "mkdir -p {} && mkdir {} 2>/dev/null && printf '%s\\n' {} > {}",
                quote_path(&self.layout.internal()),
                quote_path(&lock),
                quote(owner),
                quote_path(&self.owner_file()),
            ),
            &ExecOptions::default(),
        )?;
        if out.success() {
            log::debug!("acquired deploy lock {lock}");
            return Ok(());
        }
        if let Ok(Some(holder)) = self.holder() {
            log::warn!("deploy lock held by {holder}");
        }
        Err(Error::Lock { path: lock })
    }

    /// Who holds the lock, if anyone.
    pub fn holder(&self) -> Result<Option<String>> {
        let lock = self.layout.lock();
        if !self.conduit.test(self.host, &format!("[ -d {} ]", quote_path(&lock)))? {
            return Ok(None);
        }
        let owner = self.conduit.run(
            self.host,
            &format!("cat {} 2>/dev/null || true", quote_path(&self.owner_file())),
            &ExecOptions::default(),
        )?;
        Ok(Some(if owner.is_empty() { "unknown".to_string() } else { owner }))
    }

    /// Remove the lock whoever holds it.
    pub fn release(&self) -> Result<()> {
        self.conduit.run(
            self.host,
            &format!("rm -rf {}", quote_path(&self.layout.lock())),
            &ExecOptions::default(),
        )?;
        log::debug!("released deploy lock");
        Ok(())
    }
}

fn lock_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("{user} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
}

/// Write an environment file atomically with mode 640.
///
/// The content travels on the conduit side channel so secret values never
/// appear in a command line.
pub fn write_environment(conduit: &dyn Conduit, host: &HostRef, path: &str, env: &ResolvedEnv) -> Result<()> {
    let tmp = format!("{path}.tmp");
    conduit.run(
        host,
        &format!(
            "mkdir -p \"$(dirname {target})\" && (umask 027 && printf '%s\\n' \"$STAGEHAND_SECRET\" > {tmp}) && chmod 640 {tmp} && mv -f {tmp} {target}",
            target = quote_path(path),
            tmp = quote_path(&tmp),
        ),
        &ExecOptions::default().secret(Some(&Secret::new(env.render()))),
    )?;
    log::info!("wrote {} key(s) to {path}", env.values.len());
    Ok(())
}

/// Environment file currently on the host, empty when absent.
pub fn read_environment(conduit: &dyn Conduit, host: &HostRef, path: &str) -> Result<EnvMap> {
    let out = conduit.run(
        host,
        &format!("cat {} 2>/dev/null || true", quote_path(path)),
        &ExecOptions::default(),
    )?;
    Ok(envfile::parse(&out))
}

fn run_commands(ctx: &DeployContext<'_>, commands: &[String]) -> Result<()> {
    let dir = ctx.release_dir()?;
    let opts = ExecOptions::with_timeout(Duration::from_secs(ctx.settings.build.timeout));
    for command in commands {
        log::info!("running `{command}`");
        ctx.conduit.run(ctx.host(), &in_dir(&dir, command), &opts)?;
    }
    Ok(())
}

/// Take the deploy lock.
pub struct LockPhase;

impl Phase for LockPhase {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        DeployLock::new(ctx.conduit, ctx.host(), ctx.layout()).acquire(&lock_owner())?;
        ctx.locked = true;
        Ok(())
    }
}

/// Check the host before anything is changed.
pub struct PreflightPhase;

impl Phase for PreflightPhase {
    fn name(&self) -> &'static str {
        "preflight"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let settings = ctx.settings;
        if !settings.preflight.enabled {
            log::info!("preflight checks disabled");
            return Ok(());
        }
        let unresolved: Vec<String> = settings
            .environment(ctx.secrets, false)?
            .unresolved
            .iter()
            .map(|name| format!("{{{name}}}"))
            .collect();
        let password = ctx.db_password();
        let checks = standard_checks(settings, &unresolved, password.is_some());
        let report = Preflight::new(ctx.conduit, ctx.host(), &settings.preflight, password).run(&checks)?;
        ctx.preflight = Some(report);
        Ok(())
    }
}

/// Materialize the environment file in the shared directory.
pub struct EnvironmentPhase;

impl Phase for EnvironmentPhase {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let settings = ctx.settings;
        let env = settings.environment(ctx.secrets, settings.env.strict)?;
        write_environment(ctx.conduit, ctx.host(), &ctx.layout().env_file(), &env)?;
        ctx.environment = Some(env);
        Ok(())
    }
}

/// Create the release directory, fetch the code and link shared paths.
pub struct UpdateCodePhase;

impl Phase for UpdateCodePhase {
    fn name(&self) -> &'static str {
        "update code"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let settings = ctx.settings;
        let config = &settings.release;
        let releases = ctx.releases();
        let set = releases.list()?;
        let id = ReleaseId::now(set.latest());
        ctx.previous = set.active().cloned();

        releases.create(&id)?;
        ctx.release = Some(id.clone());
        match &config.repository {
            Some(repository) => releases.checkout(&id, repository, &config.branch)?,
            None => log::warn!("no repository configured, build commands must populate {id}"),
        }
        releases.link_shared(&id, &settings.shared_dirs(), &config.shared_files)
    }
}

/// Which command list a [`CommandsPhase`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSet {
    /// `build.commands`
    Build,
    /// `build.optimize`
    Optimize,
}

/// Run a configured command list inside the release.
pub struct CommandsPhase(pub CommandSet);

impl Phase for CommandsPhase {
    fn name(&self) -> &'static str {
        match self.0 {
            CommandSet::Build => "build",
            CommandSet::Optimize => "optimize",
        }
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let build = &ctx.settings.build;
        match self.0 {
            CommandSet::Build => run_commands(ctx, &build.commands),
            CommandSet::Optimize => run_commands(ctx, &build.optimize),
        }
    }
}

/// Install front-end dependencies through the lockfile cache.
pub struct DependenciesPhase;

impl Phase for DependenciesPhase {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let dir = ctx.release_dir()?;
        let outcome = RemoteCache::new(ctx.conduit, ctx.host(), dir, ctx.layout().cache(), &ctx.settings.cache)
            .install_dependencies()?;
        log::info!("dependencies {outcome}");
        ctx.cache.push(("dependencies".to_string(), outcome));
        Ok(())
    }
}

/// Build assets through the source fingerprint cache.
pub struct AssetsPhase;

impl Phase for AssetsPhase {
    fn name(&self) -> &'static str {
        "assets"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let dir = ctx.release_dir()?;
        let outcome = RemoteCache::new(ctx.conduit, ctx.host(), dir, ctx.layout().cache(), &ctx.settings.cache)
            .build_assets()?;
        log::info!("assets {outcome}");
        ctx.cache.push(("assets".to_string(), outcome));
        Ok(())
    }
}

/// Back up the database and apply pending migrations.
pub struct MigrationPhase;

impl Phase for MigrationPhase {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let settings = ctx.settings;
        if !settings.migrate.enabled {
            log::info!("migrations disabled");
            return Ok(());
        }
        let dir = ctx.release_dir()?;
        if settings.database.kind == DatabaseKind::Sqlite
            && ensure_sqlite(ctx.conduit, ctx.host(), &settings.database, &ctx.layout().shared())?
        {
            log::info!("created SQLite database");
        }

        let backups = ctx.backups();
        let mut controller =
            MigrationController::new(ctx.conduit, ctx.host(), &settings.migrate, settings.restore_command());
        if settings.backup.enabled {
            controller = controller.with_backups(&backups);
        }
        let report = controller.run(&dir, ctx.confirm.as_mut())?;
        ctx.migration = Some(report);
        Ok(())
    }
}

/// Swap the active pointer to the new release.
pub struct ActivatePhase;

impl Phase for ActivatePhase {
    fn name(&self) -> &'static str {
        "activate"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let Some(id) = ctx.release.clone() else {
            return Err(Error::config("no release has been created in this run"));
        };
        let services = ctx.services();
        let releases = ctx.releases().with_services(&services);
        let result = releases.activate(&id);
        ctx.activated = match &result {
            Ok(()) => true,
            // services may fail after the pointer already moved
            Err(_) => releases
                .list()
                .is_ok_and(|set| set.active() == Some(&id)),
        };
        result
    }
}

/// Verify the live release and mark it unhealthy on failure.
pub struct VerifyPhase;

impl Phase for VerifyPhase {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        let settings = ctx.settings;
        if !settings.verify.enabled {
            log::info!("verification disabled");
            return Ok(());
        }
        let Some(base) = settings.app_url() else {
            log::warn!("no url or domain configured, skipping verification");
            return Ok(());
        };

        let verifier = HealthVerifier::new(ctx.probe, &settings.verify).with_remote(ctx.conduit, ctx.host());
        let result = verifier.run(&base, &ctx.layout().current());
        let error = match result {
            Ok(result) if result.passed => {
                ctx.verification = Some(result);
                return Ok(());
            }
            Ok(result) => {
                let error = result.to_error();
                ctx.verification = Some(result);
                error
            }
            Err(e) => e,
        };

        ctx.unhealthy = true;
        ctx.log_tail = tail_log(ctx.conduit, ctx.host(), &settings.log_file(), settings.verify.log_lines);
        Err(error)
    }
}

/// Delete releases beyond the retention count.
pub struct PrunePhase;

impl Phase for PrunePhase {
    fn name(&self) -> &'static str {
        "prune"
    }

    fn run(&self, ctx: &mut DeployContext<'_>) -> Result<()> {
        match ctx.releases().prune(ctx.settings.release.keep) {
            Ok(pruned) => ctx.pruned = pruned,
            Err(e) => log::warn!("could not prune old releases: {e}"),
        }
        Ok(())
    }
}

/// Every deploy phase in pipeline order.
pub fn standard_phases() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(LockPhase),
        Box::new(PreflightPhase),
        Box::new(EnvironmentPhase),
        Box::new(UpdateCodePhase),
        Box::new(CommandsPhase(CommandSet::Build)),
        Box::new(DependenciesPhase),
        Box::new(AssetsPhase),
        Box::new(MigrationPhase),
        Box::new(CommandsPhase(CommandSet::Optimize)),
        Box::new(ActivatePhase),
        Box::new(VerifyPhase),
        Box::new(PrunePhase),
    ]
}
