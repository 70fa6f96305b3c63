//! CLI command implementations, one module per command family

use anyhow::Result;
use releasekit::health::{HealthVerifier, check_url};

use crate::Context;
use crate::engine::{SecretMode, Target};
use crate::state::StagehandState;
use crate::ui;

pub mod cache;
pub mod db;
pub mod deploy;
pub mod env;
pub mod migrate;
pub mod preflight;
pub mod releases;
pub mod status;

/// Load the config and resolve one stage.
pub(crate) fn open_target(ctx: &Context, stage: &str, mode: SecretMode) -> Result<Target> {
    let loaded = ctx.load_config()?;
    Target::open(&loaded.config, stage, mode)
}

/// One quick health check against the live release; `None` when
/// verification is disabled or no URL is known.
pub(crate) fn quick_check(target: &Target) -> Option<bool> {
    let settings = &target.settings;
    if !settings.verify.enabled {
        return None;
    }
    let quick = settings.verify.quick();
    let url = check_url(&settings.app_url()?, &quick.health_path);
    Some(HealthVerifier::new(target.probe(), &quick).verify(&url).passed)
}

/// Update the local state file. Failures only warn: the host is the
/// source of truth.
pub(crate) fn record_state(update: impl FnOnce(&mut StagehandState)) {
    let result = StagehandState::load().and_then(|mut state| {
        update(&mut state);
        state.touch()
    });
    if let Err(e) = result {
        ui::warn(&format!("Could not update local state: {e:#}"));
    }
}
