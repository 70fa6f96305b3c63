//! cache:status and cache:clear

use anyhow::Result;
use colored::Colorize;
use releasekit::cache::{DomainStatus, Fingerprint, RemoteCache};

use super::open_target;
use crate::Context;
use crate::engine::{SecretMode, Target};
use crate::prompt;
use crate::ui;

fn remote(target: &Target) -> RemoteCache<'_> {
    let layout = target.settings.layout();
    RemoteCache::new(
        target.conduit(),
        target.host(),
        layout.current(),
        layout.cache(),
        &target.settings.cache,
    )
}

/// Fingerprints of the live release against the stored ones.
pub fn status(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    if !target.settings.cache.enabled {
        ui::info(&format!("Build cache is disabled for {stage}"));
        return Ok(());
    }

    let status = remote(&target).status()?;
    ui::header(&format!("Build cache on {stage}"));
    ui::kv("Root", &target.settings.layout().cache());
    print_domain(&status.dependencies);
    print_domain(&status.assets);
    Ok(())
}

fn print_domain(domain: &DomainStatus) {
    ui::section(&domain.domain);
    let short = |fp: Option<&Fingerprint>| {
        fp.map_or_else(|| "none".to_string(), |f| f.short().to_string())
    };
    ui::kv("Live release", &short(domain.current.as_ref()));
    ui::kv("Last build", &short(domain.stored.as_ref()));
    let verdict = if domain.is_match() {
        "next deploy reuses the cache".green()
    } else {
        "next deploy rebuilds".yellow()
    };
    ui::kv("Status", &verdict.to_string());
    if domain.artifacts.is_empty() {
        ui::dim("no artifacts");
    }
    for artifact in &domain.artifacts {
        println!("    • {artifact}");
    }
}

/// Delete every artifact and fingerprint.
pub fn clear(ctx: &Context, stage: &str) -> Result<()> {
    let target = open_target(ctx, stage, SecretMode::BestEffort)?;
    if !ctx.yes
        && !prompt::confirm(&format!(
            "Delete the build cache of {stage}? The next deploy rebuilds everything"
        ))?
    {
        ui::info("Cache kept");
        return Ok(());
    }
    remote(&target).clear()?;
    ui::success(&format!("Cleared the build cache of {stage}"));
    Ok(())
}
