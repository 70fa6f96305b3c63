use anyhow::Result;
use colored::Colorize;

use crate::Context;
use crate::cli::StatusArgs;
use crate::state::{StageState, StagehandState};
use crate::ui;

/// What this machine remembers about each configured stage.
pub fn run(ctx: &Context, args: &StatusArgs) -> Result<()> {
    let state = StagehandState::load()?;
    let loaded = ctx.load_config();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    ui::header("Stagehand Status");
    let mut stages: Vec<String> = state.stages.keys().cloned().collect();
    match &loaded {
        Ok(loaded) => {
            ui::kv("Config", &loaded.path.display().to_string());
            ui::kv("Application", &loaded.config.application.name);
            for name in loaded.config.stage_names() {
                if !stages.iter().any(|s| s == name) {
                    stages.push(name.to_string());
                }
            }
        }
        Err(e) => {
            ui::kv("Config", &"not found".yellow().to_string());
            log::debug!("{e:#}");
        }
    }
    stages.sort();

    if stages.is_empty() {
        ui::dim("No stages configured or deployed");
        return Ok(());
    }

    for stage in &stages {
        ui::section(stage);
        match state.stage(stage) {
            Some(s) => show_stage(s, loaded.as_ref().ok().map(|l| l.fingerprint.as_str())),
            None => ui::dim("never deployed from this machine"),
        }
    }
    println!();
    Ok(())
}

fn show_stage(stage: &StageState, fingerprint: Option<&str>) {
    let health = if stage.unhealthy {
        "unhealthy".red().bold().to_string()
    } else if stage.last_success {
        "ok".green().to_string()
    } else {
        "last deploy failed".yellow().to_string()
    };
    ui::kv("Health", &health);
    if let Some(release) = &stage.last_release {
        ui::kv("Last release", release);
    }
    if let Some(when) = &stage.last_deploy {
        ui::kv("Last deploy", &when.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }
    if let Some(to) = &stage.rolled_back_to {
        ui::kv("Rolled back to", to);
    }
    if let Some(error) = &stage.last_error {
        ui::kv("Last error", error);
    }
    if let Some(backup) = &stage.last_backup {
        ui::kv("Last backup", backup);
    }
    if let (Some(deployed), Some(current)) = (&stage.config_hash, fingerprint)
        && deployed != current
    {
        ui::dim("config changed since the last successful deploy");
    }
}
