//! Runs scripts on remote hosts through the system `ssh` client.

use super::{CommandOutput, Conduit, ExecOptions, HostRef, LocalConduit, prelude, process, redact};
use crate::error::Result;
use crate::shell::quote;
use std::path::PathBuf;
use std::process::Command;

/// Conduit over OpenSSH with connection multiplexing.
///
/// `BatchMode` is always on so a missing key fails fast instead of prompting.
/// The local pseudo-host is delegated to [`LocalConduit`].
#[derive(Debug, Clone)]
pub struct SshConduit {
    control_dir: Option<PathBuf>,
    connect_timeout: u32,
    extra_options: Vec<String>,
    local: LocalConduit,
}

impl Default for SshConduit {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConduit {
    /// Create an SSH conduit with default options.
    pub fn new() -> Self {
        Self {
            control_dir: None,
            connect_timeout: 10,
            extra_options: Vec::new(),
            local: LocalConduit::new(),
        }
    }

    /// Directory for ControlMaster sockets (defaults to `~/.ssh`).
    #[must_use]
    pub fn with_control_dir(mut self, dir: PathBuf) -> Self {
        self.control_dir = Some(dir);
        self
    }

    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.extra_options = options;
        self
    }

    /// Arguments passed to `ssh` before the destination.
    pub fn ssh_args(&self, port: Option<u16>) -> Vec<String> {
        let control_path = self.control_dir.as_ref().map_or_else(
            || "~/.ssh/stagehand-%C".to_string(),
            |d| d.join("stagehand-%C").display().to_string(),
        );
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={control_path}"),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
        ];
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(port) = port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }
}

impl Conduit for SshConduit {
    fn execute(&self, host: &HostRef, script: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        let remote = match host {
            HostRef::Local => return self.local.execute_here("local", script, opts),
            HostRef::Remote(remote) => remote,
        };

        let full = format!("{}{script}", prelude(opts.secret.is_some()));
        log::debug!("[{}] $ {script}", remote.name);

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(remote.port))
            .arg(remote.destination())
            .arg("--")
            .arg(format!("bash -c {}", quote(&full)));

        let stdin = opts.secret.as_ref().map(|s| s.expose());
        let mut output = process::run(cmd, stdin, opts.timeout, &remote.name, script)?;
        output.stdout = redact(&output.stdout, opts.secret.as_ref());
        output.stderr = redact(&output.stderr, opts.secret.as_ref());

        if output.status == 255 {
            log::warn!("[{}] ssh connection failed: {}", remote.name, output.diagnostic());
        } else if !output.success() {
            log::debug!("[{}] exit {}: {}", remote.name, output.status, output.diagnostic());
        }
        Ok(output)
    }
}
