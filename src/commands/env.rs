//! env:show and env:diff

use anyhow::Result;
use releasekit::envfile::{self, EnvMap};
use releasekit::phases::read_environment;

use super::open_target;
use crate::Context;
use crate::cli::EnvDiffArgs;
use crate::engine::SecretMode;
use crate::engine::differ::{compute_env_changes, display_env_diff, mask_pair, unified_diff};
use crate::ui;

/// Print the environment file a deploy would write, secrets masked.
pub fn show(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let env = target.settings.environment(&target.secrets, false)?;
    let (_, shown) = mask_pair(&EnvMap::new(), &env);

    if !ctx.quiet {
        ui::header(&format!("Environment of {stage}"));
        ui::kv("Target", &target.settings.layout().env_file());
        println!();
    }
    print!("{}", envfile::render(&shown));

    if !env.unresolved.is_empty() {
        println!();
        for name in &env.unresolved {
            ui::warn(&format!(
                "{{{name}}} is unresolved; set {}",
                target.settings.secrets.variable(&name.to_uppercase())
            ));
        }
    }
    Ok(())
}

/// Compare the live environment file with the desired one.
pub fn diff(ctx: &Context, args: &EnvDiffArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::BestEffort)?;
    let settings = &target.settings;

    let current = read_environment(target.conduit(), target.host(), &settings.layout().env_file())?;
    let desired = settings.environment(&target.secrets, false)?;

    if current.is_empty() {
        ui::info(&format!("{} has no environment file yet", target.stage()));
    }
    let changes = compute_env_changes(&current, &desired);
    display_env_diff(target.stage(), &changes);

    if (args.unified || ctx.verbose > 0) && !changes.is_empty() {
        ui::section("Unified diff");
        print!("{}", unified_diff(&current, &desired));
    }
    if !desired.unresolved.is_empty() {
        ui::warn(&format!(
            "{} placeholder(s) unresolved: {}",
            desired.unresolved.len(),
            desired.unresolved.join(", ")
        ));
    }
    Ok(())
}
