//! Ordered deploy pipeline with deferred cleanup.
//!
//! Phases run strictly in order and the first error stops the run. Cleanup
//! hooks are registered up front and run afterwards in reverse registration
//! order, so they still run when a phase fails.

use crate::context::{DeployContext, ProgressCallback};
use crate::error::{Error, Result};
use crate::health::{HealthVerifier, check_url};
use crate::phases::{DeployLock, Phase, standard_phases};
use crate::release::RollbackPolicy;
use std::time::{Duration, Instant};

/// When a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookWhen {
    /// Only after a failed phase
    OnFailure,
    /// After every run
    Always,
}

/// Cleanup registered before the pipeline starts.
pub trait Hook: Send + Sync {
    /// Name for progress output and logs.
    fn name(&self) -> &'static str;

    /// When the hook runs.
    fn when(&self) -> HookWhen;

    /// Run the hook. `failure` is the error that stopped the pipeline.
    fn run(&self, ctx: &mut DeployContext<'_>, failure: Option<&Error>) -> Result<()>;
}

/// Removes the deploy lock if this run took it.
pub struct UnlockHook;

impl Hook for UnlockHook {
    fn name(&self) -> &'static str {
        "unlock"
    }

    fn when(&self) -> HookWhen {
        HookWhen::Always
    }

    fn run(&self, ctx: &mut DeployContext<'_>, _failure: Option<&Error>) -> Result<()> {
        if !ctx.locked {
            return Ok(());
        }
        DeployLock::new(ctx.conduit, ctx.host(), ctx.layout()).release()?;
        ctx.locked = false;
        Ok(())
    }
}

/// Moves the active pointer back when a failed run had already activated
/// the new release.
///
/// An unhealthy release is always rolled back; any other failure only when
/// `verify.auto_rollback` is set.
pub struct RollbackOnFailureHook;

impl Hook for RollbackOnFailureHook {
    fn name(&self) -> &'static str {
        "rollback"
    }

    fn when(&self) -> HookWhen {
        HookWhen::OnFailure
    }

    fn run(&self, ctx: &mut DeployContext<'_>, _failure: Option<&Error>) -> Result<()> {
        if !ctx.activated {
            log::debug!("new release was never activated, nothing to roll back");
            return Ok(());
        }
        let settings = ctx.settings;
        let probe = ctx.probe;
        let policy = RollbackPolicy {
            unhealthy: ctx.unhealthy,
            auto_rollback: settings.verify.auto_rollback,
            forced: false,
        };

        let quick = settings.verify.quick();
        let verify = || {
            if !settings.verify.enabled {
                return None;
            }
            let url = check_url(&settings.app_url()?, &quick.health_path);
            Some(HealthVerifier::new(probe, &quick).verify(&url).passed)
        };

        let services = ctx.services();
        let maintenance = ctx.maintenance();
        let releases = ctx
            .releases()
            .with_services(&services)
            .with_maintenance(&maintenance);
        let outcome = releases.rollback(policy, verify)?;
        ctx.rollback = Some(outcome);
        Ok(())
    }
}

/// Timing of a completed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    /// Phase name
    pub name: &'static str,
    /// Wall time
    pub elapsed: Duration,
}

/// A hook that failed.
#[derive(Debug)]
pub struct HookFailure {
    /// Hook name
    pub hook: &'static str,
    /// What went wrong
    pub error: Error,
}

/// Result of a pipeline run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Phases that finished, in order
    pub completed: Vec<PhaseRecord>,
    /// Phase that stopped the run
    pub failed_phase: Option<&'static str>,
    /// Error raised by that phase
    pub error: Option<Error>,
    /// Hooks that ran, in order
    pub hooks_run: Vec<&'static str>,
    /// Hooks that failed
    pub hook_failures: Vec<HookFailure>,
}

impl RunReport {
    /// Every phase and hook succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.hook_failures.is_empty()
    }

    /// Total time spent in completed phases.
    pub fn elapsed(&self) -> Duration {
        self.completed.iter().map(|p| p.elapsed).sum()
    }

    /// The error to report: a failed rollback outranks the phase error.
    pub fn primary_error(&self) -> Option<&Error> {
        self.hook_failures
            .iter()
            .map(|f| &f.error)
            .find(|e| matches!(e, Error::Rollback { .. }))
            .or(self.error.as_ref())
            .or_else(|| self.hook_failures.first().map(|f| &f.error))
    }
}

/// Phases plus deferred cleanup.
#[derive(Default)]
pub struct Pipeline {
    phases: Vec<Box<dyn Phase>>,
    hooks: Vec<Box<dyn Hook>>,
}

impl Pipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full deploy: every standard phase, rollback and unlock hooks.
    pub fn deploy() -> Self {
        let mut pipeline = Self::new()
            .defer(UnlockHook)
            .defer(RollbackOnFailureHook);
        pipeline.phases = standard_phases();
        pipeline
    }

    /// Append a phase.
    #[must_use]
    pub fn phase(mut self, phase: impl Phase + 'static) -> Self {
        self.phases.push(Box::new(phase));
        self
    }

    /// Register a cleanup hook. Hooks run last-registered first.
    #[must_use]
    pub fn defer(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Phase names in run order.
    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase, then the applicable hooks.
    pub fn run(&self, ctx: &mut DeployContext<'_>, progress: &mut dyn ProgressCallback) -> RunReport {
        let mut report = RunReport::default();
        let total = self.phases.len();

        for (index, phase) in self.phases.iter().enumerate() {
            progress.on_phase_start(index + 1, total, phase.name());
            log::info!("[{}] phase {}/{total}: {}", ctx.settings.stage, index + 1, phase.name());
            let started = Instant::now();
            match phase.run(ctx) {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    progress.on_phase_complete(phase.name(), elapsed);
                    report.completed.push(PhaseRecord {
                        name: phase.name(),
                        elapsed,
                    });
                }
                Err(e) => {
                    log::error!("[{}] {} failed: {e}", ctx.settings.stage, phase.name());
                    progress.on_phase_failed(phase.name(), &e);
                    report.failed_phase = Some(phase.name());
                    report.error = Some(e);
                    break;
                }
            }
        }

        for hook in self.hooks.iter().rev() {
            if hook.when() == HookWhen::OnFailure && report.error.is_none() {
                continue;
            }
            progress.on_hook(hook.name());
            report.hooks_run.push(hook.name());
            if let Err(e) = hook.run(ctx, report.error.as_ref()) {
                log::error!("[{}] {} hook failed: {e}", ctx.settings.stage, hook.name());
                report.hook_failures.push(HookFailure {
                    hook: hook.name(),
                    error: e,
                });
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::mock::{Reply, ScriptedConduit};
    use crate::config::Settings;
    use crate::context::{AutoConfirm, NoProgress};
    use crate::health::{HttpProbe, HttpResponse};
    use crate::phases::tests::{StaticProbe, secrets, settings};
    use crate::release::RollbackOutcome;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const BEFORE: &str = "20260101000000\n--current--\n/srv/shop/releases/20260101000000";
    const AFTER: &str =
        "20260101000000\n20990101000000\n--current--\n/srv/shop/releases/20990101000000";

    /// Replays statuses in order; the last one repeats.
    struct SeqProbe(Mutex<VecDeque<u16>>);

    impl SeqProbe {
        fn new(statuses: &[u16]) -> Self {
            Self(Mutex::new(statuses.iter().copied().collect()))
        }
    }

    impl HttpProbe for SeqProbe {
        fn fetch(&self, _url: &str) -> Result<HttpResponse> {
            let mut queue = self.0.lock().unwrap();
            let status = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap()
            };
            Ok(HttpResponse {
                status,
                body: "ok".to_string(),
            })
        }
    }

    fn quiet_settings() -> Settings {
        let mut settings = settings();
        settings.preflight.enabled = false;
        settings.cache.enabled = false;
        settings
    }

    fn host_conduit() -> ScriptedConduit {
        let conduit = ScriptedConduit::new();
        conduit.on("systemctl is-active", "active");
        conduit.on("[ -f /srv/shop/current/artisan ]", "+true");
        conduit.on_seq("ls -1", vec![Reply::ok(BEFORE), Reply::ok(AFTER)]);
        conduit
    }

    /// Records phase callbacks.
    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl ProgressCallback for Recorder {
        fn on_phase_start(&mut self, _index: usize, _total: usize, name: &str) {
            self.0.push(format!("start {name}"));
        }
        fn on_phase_complete(&mut self, _name: &str, _elapsed: Duration) {}
        fn on_phase_failed(&mut self, name: &str, _error: &Error) {
            self.0.push(format!("failed {name}"));
        }
        fn on_hook(&mut self, name: &str) {
            self.0.push(format!("hook {name}"));
        }
    }

    #[test]
    fn test_successful_deploy_runs_every_phase_in_order() {
        let conduit = host_conduit();
        let settings = quiet_settings();
        let secrets = secrets();
        let probe = StaticProbe(200, "<html>ok</html>");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);

        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(report.completed.len(), 12);
        assert_eq!(report.hooks_run, ["unlock"]);
        assert!(ctx.activated && !ctx.unhealthy && !ctx.locked);

        let lock = conduit.position("mkdir /srv/shop/.stagehand/deploy.lock").unwrap();
        let env = conduit.position("/srv/shop/shared/.env.tmp").unwrap();
        let clone = conduit.position("git clone").unwrap();
        let migrate = conduit.position("migrate:status").unwrap();
        let switch = conduit.position("mv -Tf").unwrap();
        let unlock = conduit.position("rm -rf /srv/shop/.stagehand/deploy.lock").unwrap();
        assert!(lock < env && env < clone && clone < migrate && migrate < switch && switch < unlock);
    }

    #[test]
    fn test_unhealthy_release_is_rolled_back_then_unlocked() {
        let conduit = host_conduit();
        let settings = quiet_settings();
        let secrets = secrets();
        // two failed attempts, then the rollback check passes
        let probe = SeqProbe::new(&[500, 500, 200]);
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));
        let mut progress = Recorder::default();

        let report = Pipeline::deploy().run(&mut ctx, &mut progress);

        assert_eq!(report.failed_phase, Some("verify"));
        assert!(matches!(report.error, Some(Error::Verification { .. })));
        assert!(report.hook_failures.is_empty());
        assert_eq!(report.hooks_run, ["rollback", "unlock"]);
        assert!(ctx.unhealthy);
        assert!(matches!(
            ctx.rollback,
            Some(RollbackOutcome::RolledBack { verified: Some(true), .. })
        ));

        let back = conduit
            .position("[ -d /srv/shop/releases/20260101000000 ] && ln -sfn")
            .unwrap();
        let unlock = conduit.position("rm -rf /srv/shop/.stagehand/deploy.lock").unwrap();
        assert!(back < unlock);
        assert_eq!(
            progress.0.last().map(String::as_str),
            Some("hook unlock")
        );
    }

    #[test]
    fn test_failed_rollback_verification_is_reported() {
        let conduit = host_conduit();
        let settings = quiet_settings();
        let secrets = secrets();
        let probe = StaticProbe(502, "Bad Gateway");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);

        assert_eq!(report.hook_failures.len(), 1);
        assert!(matches!(report.primary_error(), Some(Error::Rollback { .. })));
        // still unlocked after the double failure
        assert!(!ctx.locked);
    }

    #[test]
    fn test_failure_before_activation_does_not_roll_back() {
        let conduit = host_conduit();
        conduit.on_fail("git clone", 128, "repository not found");
        let settings = quiet_settings();
        let secrets = secrets();
        let probe = StaticProbe(200, "ok");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);

        assert_eq!(report.failed_phase, Some("update code"));
        assert_eq!(report.hooks_run, ["rollback", "unlock"]);
        assert!(ctx.rollback.is_none());
        assert!(!conduit.ran("mv -Tf"));
        assert!(conduit.ran("rm -rf /srv/shop/.stagehand/deploy.lock"));
    }

    #[test]
    fn test_preflight_failure_stops_before_any_change() {
        let conduit = ScriptedConduit::new();
        conduit.on("|PASS|", "PHP-FPM|FAIL|php8.3-fpm is not running");
        let mut settings = quiet_settings();
        settings.preflight.enabled = true;
        let secrets = secrets();
        let probe = StaticProbe(200, "ok");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);

        assert_eq!(report.failed_phase, Some("preflight"));
        match report.error {
            Some(Error::Preflight { check, message, hint }) => {
                assert_eq!(check, "PHP-FPM");
                assert_eq!(message, "php8.3-fpm is not running");
                assert!(hint.unwrap().contains("systemctl start"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!conduit.ran("/srv/shop/shared/.env"));
        assert!(!conduit.ran("git clone"));
    }

    #[test]
    fn test_held_lock_is_left_alone() {
        let conduit = host_conduit();
        conduit.on_fail("mkdir -p /srv/shop/.stagehand", 1, "");
        let settings = quiet_settings();
        let secrets = secrets();
        let probe = StaticProbe(200, "ok");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);

        assert!(matches!(report.error, Some(Error::Lock { .. })));
        assert!(!conduit.ran("rm -rf /srv/shop/.stagehand/deploy.lock"));
    }

    #[test]
    fn test_hooks_run_in_reverse_registration_order() {
        struct Named(&'static str);
        impl Hook for Named {
            fn name(&self) -> &'static str {
                self.0
            }
            fn when(&self) -> HookWhen {
                HookWhen::Always
            }
            fn run(&self, _ctx: &mut DeployContext<'_>, _failure: Option<&Error>) -> Result<()> {
                Ok(())
            }
        }

        let conduit = ScriptedConduit::new();
        let settings = quiet_settings();
        let secrets = secrets();
        let probe = StaticProbe(200, "ok");
        let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoConfirm));

        let report = Pipeline::new()
            .defer(Named("first"))
            .defer(Named("second"))
            .run(&mut ctx, &mut NoProgress);
        assert_eq!(report.hooks_run, ["second", "first"]);
        assert!(report.is_success());
    }
}
