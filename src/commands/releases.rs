//! releases and rollback

use anyhow::{Result, bail};
use colored::Colorize;
use releasekit::release::{ReleaseId, ReleaseSet, RollbackOutcome, RollbackPolicy};
use serde_json::json;

use super::{open_target, quick_check, record_state};
use crate::Context;
use crate::cli::{ListArgs, RollbackArgs};
use crate::engine::SecretMode;
use crate::prompt::{self, PromptConfirm};
use crate::state::StagehandState;
use crate::ui;

/// List the releases on a stage, newest first.
pub fn list(ctx: &Context, args: &ListArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::BestEffort)?;
    let confirm = Box::new(PromptConfirm::new(ctx.yes));
    let deploy = target.context(confirm);
    let set = deploy.releases().list()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&releases_json(&set))?);
        return Ok(());
    }

    ui::header(&format!("Releases on {}", target.stage()));
    if set.is_empty() {
        ui::dim("No releases yet");
        return Ok(());
    }
    let previous = set.previous();
    for id in set.releases() {
        let when = id
            .timestamp()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let marker = if set.active() == Some(id) {
            "current".green().bold().to_string()
        } else if previous == Some(id) {
            "rollback target".cyan().to_string()
        } else {
            String::new()
        };
        println!("  {}  {}  {marker}", id.as_str().bold(), when.dimmed());
    }
    if set.active().is_none() {
        ui::warn("No active release (current symlink missing)");
    }
    Ok(())
}

fn releases_json(set: &ReleaseSet) -> serde_json::Value {
    let releases: Vec<_> = set
        .releases()
        .iter()
        .map(|id| {
            json!({
                "id": id.as_str(),
                "created": id.timestamp().map(|t| t.to_string()),
                "active": set.active() == Some(id),
            })
        })
        .collect();
    json!({
        "active": set.active().map(ReleaseId::as_str),
        "previous": set.previous().map(ReleaseId::as_str),
        "releases": releases,
    })
}

/// Roll a stage back to the previous release, or to `--to`.
pub fn rollback(ctx: &Context, args: &RollbackArgs) -> Result<()> {
    let target = open_target(ctx, &args.stage, SecretMode::Required)?;
    let stage = target.stage().to_string();
    let deploy = target.context(Box::new(PromptConfirm::new(ctx.yes)));
    let services = deploy.services();
    let maintenance = deploy.maintenance();
    let manager = deploy
        .releases()
        .with_services(&services)
        .with_maintenance(&maintenance);

    let outcome = if let Some(to) = &args.to {
        let Some(id) = ReleaseId::parse(to) else {
            bail!("'{to}' is not a release id (expected YYYYMMDDHHMMSS)");
        };
        if !ctx.yes && !prompt::confirm(&format!("Roll {stage} back to {id}?"))? {
            ui::info("Rollback cancelled");
            return Ok(());
        }
        manager.rollback_to(&id, || quick_check(&target))?
    } else {
        let unhealthy = StagehandState::load()
            .ok()
            .and_then(|state| state.stage(&stage).map(|s| s.unhealthy))
            .unwrap_or(false);
        let forced = args.force
            || (!unhealthy
                && (ctx.yes
                    || prompt::confirm(&format!(
                        "{stage} is not marked unhealthy. Roll back anyway?"
                    ))?));
        let policy = RollbackPolicy {
            unhealthy,
            auto_rollback: false,
            forced,
        };
        manager.rollback(policy, || quick_check(&target))?
    };

    match outcome {
        RollbackOutcome::RolledBack { from, to, verified } => {
            match verified {
                Some(true) => ui::success(&format!("Rolled {stage} back to {to} (verified)")),
                _ => ui::success(&format!("Rolled {stage} back to {to}")),
            }
            let to_name = to.to_string();
            record_state(|state| state.record_rollback(&stage, &to_name));

            if args.cleanup
                && let Some(from) = from
            {
                manager.remove(&from)?;
                ui::info(&format!("Removed release {from}"));
            }
        }
        RollbackOutcome::NoPreviousRelease => {
            bail!("{stage} has no previous release to roll back to");
        }
        RollbackOutcome::NotPermitted => {
            ui::info("Rollback cancelled");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ReleaseId {
        ReleaseId::parse(value).unwrap()
    }

    #[test]
    fn json_lists_newest_first_with_markers() {
        let set = ReleaseSet::new(
            vec![id("20260101000000"), id("20260103000000"), id("20260102000000")],
            Some(id("20260103000000")),
        );

        let value = releases_json(&set);
        assert_eq!(value["active"], "20260103000000");
        assert_eq!(value["previous"], "20260102000000");
        assert_eq!(value["releases"][0]["id"], "20260103000000");
        assert_eq!(value["releases"][0]["active"], true);
        assert_eq!(value["releases"][2]["id"], "20260101000000");
        assert_eq!(value["releases"][2]["active"], false);
    }

    #[test]
    fn json_without_active_release() {
        let set = ReleaseSet::new(vec![id("20260101000000")], None);

        let value = releases_json(&set);
        assert!(value["active"].is_null());
        assert_eq!(value["releases"].as_array().unwrap().len(), 1);
    }
}
