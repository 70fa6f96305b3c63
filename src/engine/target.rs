//! A stage resolved into everything a command needs to reach it

use anyhow::Result;
use releasekit::conduit::{Conduit, HostRef, SshConduit};
use releasekit::config::Settings;
use releasekit::context::{ConfirmCallback, DeployContext};
use releasekit::health::{HttpProbe, UreqProbe};
use releasekit::secrets::{self, ProcessEnv, SecretMap};

use crate::schema::StagehandConfig;

/// How missing secrets are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretMode {
    /// Fail before anything runs
    Required,
    /// Continue without secrets; for read-only commands
    BestEffort,
}

/// One stage: settings, secrets and a conduit to its host.
pub struct Target {
    pub settings: Settings,
    pub secrets: SecretMap,
    conduit: SshConduit,
    probe: UreqProbe,
}

impl Target {
    /// Resolve a stage from the config file.
    pub fn open(config: &StagehandConfig, stage: &str, mode: SecretMode) -> Result<Self> {
        let settings = config.settings(stage)?;

        let secrets = match secrets::resolve(&settings.secrets, &ProcessEnv) {
            Ok(secrets) => secrets,
            Err(e) if mode == SecretMode::BestEffort => {
                log::warn!("[{stage}] continuing without secrets: {e}");
                SecretMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let probe = UreqProbe::from_config(&settings.verify);
        Ok(Self {
            settings,
            secrets,
            conduit: SshConduit::new(),
            probe,
        })
    }

    pub fn stage(&self) -> &str {
        &self.settings.stage
    }

    pub fn host(&self) -> &HostRef {
        &self.settings.host
    }

    pub fn conduit(&self) -> &dyn Conduit {
        &self.conduit
    }

    pub fn probe(&self) -> &dyn HttpProbe {
        &self.probe
    }

    /// Fresh deploy context borrowing this target.
    pub fn context(&self, confirm: Box<dyn ConfirmCallback>) -> DeployContext<'_> {
        DeployContext::new(&self.settings, &self.conduit, &self.secrets, &self.probe, confirm)
    }
}
