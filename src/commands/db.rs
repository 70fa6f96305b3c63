//! Database backup, restore and SQLite commands

use anyhow::{Result, bail};
use colored::Colorize;
use releasekit::backup::BackupHandle;
use releasekit::migrate;
use serde_json::json;

use super::{open_target, record_state};
use crate::Context;
use crate::cli::{ListArgs, RestoreArgs};
use crate::engine::SecretMode;
use crate::progress;
use crate::prompt::{self, PromptConfirm};
use crate::ui;

/// Take a backup now and apply retention.
pub fn backup(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::Required)?;
    let deploy = target.context(Box::new(PromptConfirm::new(ctx.yes)));
    let backups = deploy.backups();
    let settings = &target.settings;

    let spinner = progress::spinner(format!("Backing up {} database", settings.database.kind));
    let result = backups.backup(&settings.layout().current());
    spinner.finish_and_clear();
    let handle = result?;

    ui::success(&format!(
        "Backup {} ({})",
        handle.file_name(),
        ui::format_size(handle.size)
    ));

    match backups.prune(settings.backup.keep) {
        Ok(removed) if !removed.is_empty() => {
            ui::dim(&format!("Pruned {} old backup(s)", removed.len()));
        }
        Ok(_) => {}
        Err(e) => ui::warn(&format!("Backup kept but pruning failed: {e}")),
    }

    let file = handle.file_name().to_string();
    record_state(|state| state.record_backup(stage, &file));
    Ok(())
}

/// List backups, newest first.
pub fn list(ctx: &Context, args: &ListArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::BestEffort)?;
    let deploy = target.context(Box::new(PromptConfirm::new(ctx.yes)));
    let backups = deploy.backups().list()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&backups_json(&backups))?);
        return Ok(());
    }

    ui::header(&format!("Backups of {}", target.stage()));
    ui::kv("Directory", deploy.backups().dir());
    if backups.is_empty() {
        ui::dim("No backups yet");
        return Ok(());
    }
    for (index, handle) in backups.iter().enumerate() {
        println!("  {}", describe(index, handle));
    }
    Ok(())
}

fn describe(index: usize, handle: &BackupHandle) -> String {
    format!(
        "{:>2}. {}  {}  {}",
        index + 1,
        handle.file_name().bold(),
        handle.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        ui::format_size(handle.size)
    )
}

fn backups_json(backups: &[BackupHandle]) -> serde_json::Value {
    serde_json::Value::Array(
        backups
            .iter()
            .map(|b| {
                json!({
                    "file": b.file_name(),
                    "path": b.path,
                    "kind": b.kind.to_string(),
                    "created": b.timestamp.to_string(),
                    "size": b.size,
                })
            })
            .collect(),
    )
}

/// Restore a backup in maintenance mode.
pub fn restore(ctx: &Context, args: &RestoreArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::Required)?;
    let deploy = target.context(Box::new(PromptConfirm::new(ctx.yes)));
    let manager = deploy.backups();
    let backups = manager.list()?;
    if backups.is_empty() {
        bail!("No backups found in {}", manager.dir());
    }

    let handle = if let Some(file) = &args.file {
        let Some(handle) = backups.iter().find(|b| b.file_name() == file.as_str()) else {
            bail!("Backup '{file}' not found in {}", manager.dir());
        };
        handle
    } else if args.latest {
        &backups[0]
    } else if ctx.yes {
        bail!("Pass --latest or --file to restore without prompting");
    } else {
        let items: Vec<String> = backups
            .iter()
            .enumerate()
            .map(|(i, b)| describe(i, b))
            .collect();
        &backups[prompt::select("Backup to restore", &items)?]
    };

    ui::warn(&format!(
        "This replaces the {} database of {} with {}",
        target.settings.database.kind,
        target.stage(),
        handle.file_name()
    ));
    if !ctx.yes && !prompt::confirm("Restore now?")? {
        ui::info("Restore cancelled");
        return Ok(());
    }

    let maintenance = deploy.maintenance();
    let spinner = progress::spinner(format!("Restoring {}", handle.file_name()));
    let outcome = manager.restore(handle, &target.settings.layout().current(), &maintenance);
    spinner.finish_and_clear();

    if let Some(error) = outcome.error {
        bail!("Restore of {} failed: {error}", handle.file_name());
    }
    if outcome.maintenance {
        ui::dim("Maintenance mode was used during the restore");
    }
    ui::success(&format!("Restored {}", handle.file_name()));
    Ok(())
}

/// Create the shared SQLite database file if missing.
pub fn ensure_sqlite(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    let settings = &target.settings;
    let shared = settings.layout().shared();

    if migrate::ensure_sqlite(target.conduit(), target.host(), &settings.database, &shared)? {
        ui::success(&format!(
            "Created {}",
            settings.database.sqlite_file(&shared)
        ));
    } else {
        ui::info(&format!(
            "Nothing to do ({} database)",
            settings.database.kind
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use releasekit::backup::DatabaseKind;

    fn handle(file: &str, size: u64) -> BackupHandle {
        BackupHandle {
            kind: DatabaseKind::Mysql,
            name: "shop".to_string(),
            stage: "production".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2026, 3, 4)
                .unwrap()
                .and_hms_opt(5, 6, 7)
                .unwrap(),
            path: format!("/srv/shop/shared/backups/{file}"),
            size,
        }
    }

    #[test]
    fn json_carries_file_and_size() {
        let value = backups_json(&[handle("shop_production_2026-03-04-050607.sql.gz", 2048)]);
        assert_eq!(value[0]["file"], "shop_production_2026-03-04-050607.sql.gz");
        assert_eq!(value[0]["size"], 2048);
        assert_eq!(value[0]["created"], "2026-03-04 05:06:07");
    }

    #[test]
    fn describe_numbers_from_one() {
        colored::control::set_override(false);
        let line = describe(0, &handle("a.sql.gz", 512));
        assert!(line.starts_with(" 1. a.sql.gz"));
        assert!(line.contains("512 B"));
    }
}
