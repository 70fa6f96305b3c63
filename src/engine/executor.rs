//! Deploy executor: runs the pipeline for one or more stages

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use indicatif::MultiProgress;
use rayon::prelude::*;
use releasekit::context::{AutoDecline, ConfirmCallback, DeployContext, ProgressCallback};
use releasekit::pipeline::{Pipeline, RunReport};
use releasekit::release::RollbackOutcome;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::target::{SecretMode, Target};
use crate::progress::PhaseProgress;
use crate::prompt::PromptConfirm;
use crate::schema::StagehandConfig;
use crate::ui;

/// Options for a deploy run
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Stages deployed at the same time
    pub jobs: usize,
    /// Answer confirmations with yes
    pub yes: bool,
    /// Suppress phase output
    pub quiet: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            yes: false,
            quiet: false,
        }
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub stage: String,
    pub release: Option<String>,
    pub previous: Option<String>,
    pub success: bool,
    pub unhealthy: bool,
    pub failed_phase: Option<String>,
    pub error: Option<String>,
    pub guidance: Option<String>,
    pub rollback: Option<String>,
    pub rolled_back_to: Option<String>,
    pub backup: Option<String>,
    pub cache: Vec<(String, String)>,
    pub hook_failures: Vec<String>,
    pub log_tail: Option<String>,
    pub elapsed: Duration,
}

impl StageOutcome {
    fn setup_failed(stage: &str, error: &anyhow::Error) -> Self {
        Self {
            stage: stage.to_string(),
            error: Some(format!("{error:#}")),
            guidance: crate::library_error(error).map(releasekit::Error::guidance),
            ..Self::default()
        }
    }

    fn from_run(ctx: &DeployContext<'_>, report: &RunReport) -> Self {
        let (rollback, rolled_back_to) = match &ctx.rollback {
            Some(RollbackOutcome::RolledBack { to, verified, .. }) => {
                let check = match verified {
                    Some(true) => "verified",
                    Some(false) => "verification failed",
                    None => "not verified",
                };
                (
                    Some(format!("rolled back to {to} ({check})")),
                    Some(to.to_string()),
                )
            }
            Some(RollbackOutcome::NoPreviousRelease) => {
                (Some("no previous release to roll back to".to_string()), None)
            }
            Some(RollbackOutcome::NotPermitted) => {
                (Some("rollback not permitted".to_string()), None)
            }
            None => (None, None),
        };

        let primary = report.primary_error();
        Self {
            stage: ctx.settings.stage.clone(),
            release: ctx.release.as_ref().map(ToString::to_string),
            previous: ctx.previous.as_ref().map(ToString::to_string),
            success: report.is_success(),
            unhealthy: ctx.unhealthy,
            failed_phase: report.failed_phase.map(str::to_string),
            error: primary.map(ToString::to_string),
            guidance: primary.map(releasekit::Error::guidance),
            rollback,
            rolled_back_to,
            backup: ctx
                .migration
                .as_ref()
                .and_then(|m| m.backup.as_ref())
                .map(|b| b.file_name().to_string()),
            cache: ctx
                .cache
                .iter()
                .map(|(domain, outcome)| (domain.clone(), outcome.to_string()))
                .collect(),
            hook_failures: report
                .hook_failures
                .iter()
                .map(|f| format!("{}: {}", f.hook, f.error))
                .collect(),
            log_tail: ctx.log_tail.clone(),
            elapsed: report.elapsed(),
        }
    }
}

/// Deploy every stage, at most `jobs` at a time.
///
/// Stages never share state; a failure in one does not stop the others.
pub fn deploy_stages(
    config: &StagehandConfig,
    stages: &[String],
    opts: &DeployOptions,
) -> Result<Vec<StageOutcome>> {
    if stages.len() <= 1 || opts.jobs <= 1 {
        return Ok(stages
            .iter()
            .map(|stage| {
                let confirm = Box::new(PromptConfirm::new(opts.yes));
                let mut progress = PhaseProgress::new(stage.as_str(), opts.quiet);
                deploy_stage(config, stage, confirm, &mut progress)
            })
            .collect());
    }

    let multi = MultiProgress::new();
    let results: Arc<Mutex<Vec<StageOutcome>>> = Arc::new(Mutex::new(Vec::new()));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs)
        .build()
        .context("Failed to create deploy thread pool")?;

    pool.install(|| {
        stages.par_iter().for_each(|stage| {
            // Prompts cannot be answered while several stages draw at once.
            let confirm: Box<dyn ConfirmCallback> = if opts.yes {
                Box::new(PromptConfirm::new(true))
            } else {
                Box::new(AutoDecline)
            };
            let mut progress = PhaseProgress::shared(stage.as_str(), multi.clone(), opts.quiet);
            let outcome = deploy_stage(config, stage, confirm, &mut progress);
            push_outcome(&results, outcome);
        });
    });

    let mut outcomes = into_outcomes(results)?;
    outcomes.sort_by_key(|o| stages.iter().position(|s| *s == o.stage));
    Ok(outcomes)
}

/// Run the deploy pipeline for one stage.
pub fn deploy_stage(
    config: &StagehandConfig,
    stage: &str,
    confirm: Box<dyn ConfirmCallback>,
    progress: &mut dyn ProgressCallback,
) -> StageOutcome {
    let target = match Target::open(config, stage, SecretMode::Required) {
        Ok(target) => target,
        Err(e) => return StageOutcome::setup_failed(stage, &e),
    };

    log::info!("Deploying {}", target.settings);
    let mut ctx = target.context(confirm);
    let report = Pipeline::deploy().run(&mut ctx, progress);
    StageOutcome::from_run(&ctx, &report)
}

fn push_outcome(results: &Arc<Mutex<Vec<StageOutcome>>>, outcome: StageOutcome) {
    match results.lock() {
        Ok(mut locked) => locked.push(outcome),
        Err(poisoned) => poisoned.into_inner().push(outcome),
    }
}

fn into_outcomes(results: Arc<Mutex<Vec<StageOutcome>>>) -> Result<Vec<StageOutcome>> {
    let mutex = Arc::try_unwrap(results)
        .map_err(|_| anyhow::anyhow!("Failed to collect deploy results: shared result state"))?;

    match mutex.into_inner() {
        Ok(collected) => Ok(collected),
        Err(poisoned) => Ok(poisoned.into_inner()),
    }
}

/// Print the final summary
pub fn print_summary(outcomes: &[StageOutcome]) {
    println!();
    for outcome in outcomes {
        if outcome.success {
            println!(
                "  {} {} deployed {} {}",
                "✓".green().bold(),
                outcome.stage.bold(),
                outcome.release.as_deref().unwrap_or("-"),
                ui::format_duration(outcome.elapsed).dimmed()
            );
            if let Some(previous) = &outcome.previous {
                println!("    • replaced {previous}");
            }
            for (domain, result) in &outcome.cache {
                println!("    • {domain} cache {result}");
            }
            if let Some(backup) = &outcome.backup {
                println!("    • backup {backup}");
            }
            continue;
        }

        let phase = outcome.failed_phase.as_deref().unwrap_or("setup");
        println!(
            "  {} {} failed in {}",
            "✗".red().bold(),
            outcome.stage.bold(),
            phase.yellow()
        );
        if let Some(error) = &outcome.error {
            println!("    • {error}");
        }
        if let Some(rollback) = &outcome.rollback {
            println!("    • {rollback}");
        }
        if outcome.unhealthy && outcome.rolled_back_to.is_none() {
            println!("    • {}", "the new release is live and unhealthy".red());
        }
        for failure in &outcome.hook_failures {
            println!("    • cleanup {failure}");
        }
        if let Some(tail) = &outcome.log_tail {
            println!("    • application log:");
            ui::block(tail);
        }
        if let Some(guidance) = &outcome.guidance {
            println!("    {} {}", "→".cyan(), guidance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stage: &str) -> StageOutcome {
        StageOutcome {
            stage: stage.to_string(),
            ..StageOutcome::default()
        }
    }

    #[test]
    fn push_outcome_handles_poisoned_mutex() {
        let results: Arc<Mutex<Vec<StageOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let poisoned = Arc::clone(&results);

        let _ = std::thread::spawn(move || {
            let _guard = poisoned
                .lock()
                .expect("lock should succeed before poisoning");
            panic!("intentional poison");
        })
        .join();

        push_outcome(&results, outcome("production"));

        let len = match results.lock() {
            Ok(locked) => locked.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        assert_eq!(len, 1);
    }

    #[test]
    fn into_outcomes_recovers_from_poisoned_mutex() {
        let results: Arc<Mutex<Vec<StageOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let poisoned = Arc::clone(&results);

        let _ = std::thread::spawn(move || {
            let mut guard = poisoned
                .lock()
                .expect("lock should succeed before poisoning");
            guard.push(outcome("staging"));
            panic!("intentional poison");
        })
        .join();

        let collected = into_outcomes(results).expect("poisoned mutex should be recovered");
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].stage, "staging");
    }

    #[test]
    fn unknown_stage_is_a_setup_failure() {
        let config = StagehandConfig::parse(
            "[application]\nname = \"shop\"\n[environments.production]\nhost = \"local\"\ndeploy_path = \"/srv/shop\"\n",
        )
        .unwrap();

        let outcomes = deploy_stages(&config, &["qa".to_string()], &DeployOptions::default()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].failed_phase.is_none());
        assert!(outcomes[0].error.as_deref().unwrap().contains("Unknown stage"));
    }

    #[test]
    fn missing_secret_stops_before_any_phase() {
        let config = StagehandConfig::parse(
            "[application]\nname = \"shop\"\n[secrets]\nprefix = \"STAGEHAND_EXECUTOR_TEST_\"\nrequired = [\"never_set\"]\n[environments.production]\nhost = \"local\"\ndeploy_path = \"/srv/shop\"\n",
        )
        .unwrap();

        let outcomes =
            deploy_stages(&config, &["production".to_string()], &DeployOptions::default()).unwrap();
        assert!(!outcomes[0].success);
        assert!(outcomes[0].release.is_none());
        assert!(outcomes[0].guidance.is_some());
    }
}
