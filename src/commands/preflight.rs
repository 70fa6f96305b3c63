//! preflight, preflight:disk and preflight:services

use anyhow::Result;
use colored::Colorize;
use releasekit::preflight::{self, Preflight, Status};
use releasekit::secrets::DB_PASSWORD;
use releasekit::service::WorkerState;

use super::open_target;
use crate::Context;
use crate::engine::SecretMode;
use crate::prompt::PromptConfirm;
use crate::ui;

/// Run the standard checks against a stage's host.
pub fn run(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let settings = &target.settings;

    let unresolved: Vec<String> = settings
        .environment(&target.secrets, false)?
        .unresolved
        .iter()
        .map(|name| format!("{{{name}}}"))
        .collect();
    let password = target.secrets.secret(DB_PASSWORD);
    let checks = preflight::standard_checks(settings, &unresolved, password.is_some());

    ui::header(&format!("Preflight {stage}"));
    let report = Preflight::new(target.conduit(), target.host(), &settings.preflight, password)
        .run(&checks)?;

    for result in &report.results {
        let mark = match result.status {
            Status::Pass => "✓".green(),
            Status::Fail => "✗".red(),
        };
        println!("  {mark} {:<18} {}", result.name, result.message.dimmed());
    }
    ui::success(&format!("{} check(s) passed", report.results.len()));
    Ok(())
}

/// Disk and memory usage on the host.
pub fn disk(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let settings = &target.settings;
    let preflight = Preflight::new(target.conduit(), target.host(), &settings.preflight, None);

    ui::header(&format!("Resources on {stage}"));
    ui::section("Disk");
    ui::block(&preflight.disk_report(&settings.deploy_path)?);
    ui::section("Memory");
    ui::block(&preflight.memory_report()?);
    ui::kv(
        "Thresholds",
        &format!(
            "{} MB disk, {} MB memory",
            settings.preflight.min_disk_mb, settings.preflight.min_memory_mb
        ),
    );
    Ok(())
}

/// State of the services the stage depends on.
pub fn services(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let settings = &target.settings;
    let deploy = target.context(Box::new(PromptConfirm::new(ctx.yes)));
    let control = deploy.services();

    let units: Vec<String> = settings
        .preflight
        .services
        .clone()
        .unwrap_or_else(|| preflight::default_services(settings))
        .into_iter()
        .map(|s| s.unit)
        .collect();

    ui::header(&format!("Services on {stage}"));
    for (unit, state) in control.report(&units) {
        let state = if state == "active" {
            state.green()
        } else {
            state.yellow()
        };
        println!("  {unit:<24} {state}");
    }

    let workers = match control.worker_state() {
        Ok(WorkerState::Disabled) => "disabled".dimmed().to_string(),
        Ok(WorkerState::NotInstalled) => "supervisor not installed".yellow().to_string(),
        Ok(WorkerState::NotConfigured) => "not configured".yellow().to_string(),
        Ok(WorkerState::Status(status)) => status,
        Err(e) => format!("unknown ({e})"),
    };
    ui::kv("Queue workers", &workers);
    Ok(())
}
