//! deploy, deploy:verify and deploy:unlock

use anyhow::{Result, bail};
use colored::Colorize;
use releasekit::health::{HealthVerifier, VerifyResult, tail_log};
use releasekit::phases::DeployLock;

use super::{open_target, record_state};
use crate::Context;
use crate::cli::{DeployArgs, VerifyArgs};
use crate::engine::{self, DeployOptions, SecretMode, Target};
use crate::prompt;
use crate::state::{DeployRecord, StagehandState};
use crate::ui;

/// Deploy one or more stages.
pub fn run(ctx: &Context, args: &DeployArgs) -> Result<()> {
    let loaded = ctx.load_config()?;
    log::info!("Using config {}", loaded.path.display());

    let state = StagehandState::load().unwrap_or_else(|e| {
        log::warn!("ignoring unreadable state: {e:#}");
        StagehandState::default()
    });
    for stage in &args.stages {
        let last = state.stage(stage).and_then(|s| s.config_hash.as_deref());
        if last.is_some_and(|hash| hash != loaded.fingerprint) {
            ui::info(&format!("{stage}: config changed since the last successful deploy"));
        }
        if state.stage(stage).is_some_and(|s| s.unhealthy) {
            ui::warn(&format!("{stage}: the live release was left unhealthy by the last deploy"));
        }
    }

    if !ctx.quiet {
        ui::header(&format!("Deploying {}", loaded.config.application.name));
    }

    let opts = DeployOptions {
        jobs: args.jobs.max(1),
        yes: ctx.yes,
        quiet: ctx.quiet,
    };
    let outcomes = engine::deploy_stages(&loaded.config, &args.stages, &opts)?;

    record_state(|state| {
        for outcome in &outcomes {
            // Setup failures never touched the host.
            if outcome.release.is_none() && outcome.failed_phase.is_none() {
                continue;
            }
            let record = DeployRecord {
                release: outcome.release.clone(),
                success: outcome.success,
                unhealthy: outcome.unhealthy,
                error: outcome.error.clone(),
                rolled_back_to: outcome.rolled_back_to.clone(),
                backup: outcome.backup.clone(),
            };
            state.record_deploy(&outcome.stage, record, Some(loaded.fingerprint.clone()));
        }
    });

    engine::print_summary(&outcomes);

    let failed = outcomes.iter().filter(|o| !o.success).count();
    if failed > 0 {
        bail!("{failed} of {} stage(s) failed", outcomes.len());
    }
    Ok(())
}

/// Verify the live release of a stage.
pub fn verify(ctx: &Context, args: &VerifyArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::BestEffort)?;
    let settings = &target.settings;
    let Some(base) = settings.app_url() else {
        bail!(
            "Stage '{}' has no url or domain; nothing to verify",
            target.stage()
        );
    };

    let config = if args.quick {
        settings.verify.quick()
    } else {
        let mut config = settings.verify.clone();
        config.deep |= args.deep;
        config
    };

    ui::header(&format!("Verifying {}", target.stage()));
    let layout = settings.layout();
    let result = HealthVerifier::new(target.probe(), &config)
        .with_remote(target.conduit(), target.host())
        .run(&base, &layout.current());

    let healthy = matches!(&result, Ok(r) if r.passed);
    let stage = target.stage().to_string();
    record_state(|state| state.stage_mut(&stage).unhealthy = !healthy);

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            print_log_tail(&target);
            return Err(e.into());
        }
    };
    print_verify(&result);

    if !result.passed {
        print_log_tail(&target);
        return Err(result.to_error().into());
    }
    ui::success(&format!("{} is healthy", target.stage()));
    Ok(())
}

fn print_verify(result: &VerifyResult) {
    ui::kv("URL", &result.url);
    for attempt in &result.attempts {
        let status = attempt
            .status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        match &attempt.reason {
            None => println!("  {} attempt {} HTTP {status}", "✓".green(), attempt.attempt),
            Some(reason) => println!(
                "  {} attempt {} HTTP {status}: {reason}",
                "✗".red(),
                attempt.attempt
            ),
        }
    }
    if !result.probes.is_empty() {
        ui::section("Deep checks");
        for probe in &result.probes {
            let mark = if probe.passed {
                "✓".green()
            } else {
                "⚠".yellow()
            };
            println!("  {mark} {}", probe.name);
        }
    }
}

fn print_log_tail(target: &Target) {
    let settings = &target.settings;
    if let Some(tail) = tail_log(
        target.conduit(),
        target.host(),
        &settings.log_file(),
        settings.verify.log_lines,
    ) {
        ui::section("Application log");
        ui::block(&tail);
    }
}

/// Remove a deploy lock left behind by an interrupted run.
pub fn unlock(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let lock = DeployLock::new(target.conduit(), target.host(), target.settings.layout());

    let Some(holder) = lock.holder()? else {
        ui::info(&format!("{stage} is not locked"));
        return Ok(());
    };
    ui::kv("Held by", &holder);

    if !ctx.yes && !prompt::confirm("Remove the lock? Only do this if no deploy is running")? {
        ui::info("Lock kept");
        return Ok(());
    }
    lock.release()?;
    ui::success(&format!("Unlocked {stage}"));
    Ok(())
}
