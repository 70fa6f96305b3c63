//! Runs scripts on the orchestrating machine.

use super::{CommandOutput, Conduit, ExecOptions, HostRef, prelude, process, redact};
use crate::error::{Error, Result};
use std::process::Command;

/// Conduit that executes everything locally through `bash -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalConduit;

impl LocalConduit {
    /// Create a local conduit.
    pub fn new() -> Self {
        Self
    }

    /// Execute a script on this machine regardless of the host reference.
    pub fn execute_here(&self, label: &str, script: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        let full = format!("{}{script}", prelude(opts.secret.is_some()));
        log::debug!("[{label}] $ {script}");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&full);

        let stdin = opts.secret.as_ref().map(|s| s.expose());
        let mut output = process::run(cmd, stdin, opts.timeout, label, script)?;
        output.stdout = redact(&output.stdout, opts.secret.as_ref());
        output.stderr = redact(&output.stderr, opts.secret.as_ref());

        if !output.success() {
            log::debug!("[{label}] exit {}: {}", output.status, output.diagnostic());
        }
        Ok(output)
    }
}

impl Conduit for LocalConduit {
    fn execute(&self, host: &HostRef, script: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        match host {
            HostRef::Local => self.execute_here("local", script, opts),
            HostRef::Remote(remote) => Err(Error::config(format!(
                "local conduit cannot reach remote host '{}'",
                remote.name
            ))),
        }
    }
}
