//! migrate:status and migrate:pretend

use anyhow::Result;
use releasekit::migrate::MigrationController;

use super::open_target;
use crate::Context;
use crate::engine::{SecretMode, Target};
use crate::ui;

fn controller(target: &Target) -> MigrationController<'_> {
    let settings = &target.settings;
    MigrationController::new(
        target.conduit(),
        target.host(),
        &settings.migrate,
        settings.restore_command(),
    )
}

/// Migration listing of the live release.
pub fn status(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let current = target.settings.layout().current();

    ui::header(&format!("Migrations on {stage}"));
    let listing = controller(&target).status(&current)?;
    if listing.is_empty() {
        ui::dim("No output from the status command");
    } else {
        ui::block(&listing);
    }
    Ok(())
}

/// SQL that pending migrations of the live release would run.
pub fn pretend(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let current = target.settings.layout().current();

    match controller(&target).pretend(&current)? {
        Some(sql) => {
            ui::header(&format!("Pending migrations on {stage}"));
            ui::block(&sql);
        }
        None => ui::success("Nothing to migrate"),
    }
    Ok(())
}
