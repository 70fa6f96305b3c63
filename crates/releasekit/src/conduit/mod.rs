//! Command conduit: run shell scripts on a target host or on this machine.
//!
//! The [`Conduit`] trait is the only seam between the engine and the outside
//! world. Every remote side effect goes through it, which is what makes the
//! pipeline testable with a scripted mock.

pub mod local;
pub mod process;
pub mod ssh;

#[cfg(test)]
pub mod mock;

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

pub use local::LocalConduit;
pub use ssh::SshConduit;

/// Name of the variable the prelude fills from stdin.
pub const SECRET_VAR: &str = "STAGEHAND_SECRET";

/// A remote host reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    /// Label used in logs and errors (usually the stage)
    pub name: String,
    /// Hostname or IP address
    pub hostname: String,
    /// Login user
    pub user: Option<String>,
    /// SSH port
    pub port: Option<u16>,
}

impl RemoteHost {
    /// `user@hostname` as passed to ssh.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }
}

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRef {
    /// The orchestrating machine
    Local,
    /// A target host
    Remote(RemoteHost),
}

impl HostRef {
    /// Label for logs and errors.
    pub fn label(&self) -> &str {
        match self {
            HostRef::Local => "local",
            HostRef::Remote(host) => &host.name,
        }
    }

    /// Whether this is the local pseudo-host.
    pub fn is_local(&self) -> bool {
        matches!(self, HostRef::Local)
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A secret value. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Kill the command after this long
    pub timeout: Option<Duration>,
    /// Value delivered on stdin and exported as `$STAGEHAND_SECRET`
    pub secret: Option<Secret>,
}

impl ExecOptions {
    /// Options with a timeout and no secret.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            secret: None,
        }
    }

    /// Attach a secret.
    #[must_use]
    pub fn secret(mut self, secret: Option<&Secret>) -> Self {
        self.secret = secret.cloned();
        self
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code, -1 when killed by a signal
    pub status: i32,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: 0,
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stdout.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }

    /// Stderr, or stdout when stderr is empty.
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() { self.stdout.trim() } else { err }
    }
}

/// Executes shell scripts on a host.
///
/// Implementations must:
/// - run `script` through bash with [`prelude`] prepended
/// - deliver `opts.secret` on stdin, never on the command line
/// - enforce `opts.timeout` and report expiry as [`Error::Timeout`]
pub trait Conduit: Send + Sync {
    /// Run a script and capture its output regardless of exit status.
    fn execute(&self, host: &HostRef, script: &str, opts: &ExecOptions) -> Result<CommandOutput>;

    /// Run a script and fail on non-zero exit. Returns trimmed stdout.
    fn run(&self, host: &HostRef, script: &str, opts: &ExecOptions) -> Result<String> {
        let output = self.execute(host, script, opts)?;
        if output.success() {
            Ok(output.text().to_string())
        } else {
            Err(Error::CommandFailed {
                host: host.label().to_string(),
                command: script.to_string(),
                code: output.status,
                stderr: redact(output.diagnostic(), opts.secret.as_ref()),
            })
        }
    }

    /// Evaluate a shell condition, e.g. `[ -d /srv/app ]`.
    fn test(&self, host: &HostRef, condition: &str) -> Result<bool> {
        let script = format!("if {condition}; then echo +true; fi");
        let output = self.execute(host, &script, &ExecOptions::default())?;
        Ok(output.text() == "+true")
    }
}

/// Script prepended to every command.
pub fn prelude(with_secret: bool) -> String {
    if with_secret {
        format!("set -o pipefail\n{SECRET_VAR}=\"$(cat)\"; export {SECRET_VAR}\n")
    } else {
        "set -o pipefail\n".to_string()
    }
}

/// Wrap a command so it runs through sudo, password read from the side channel.
pub fn sudo(command: &str) -> String {
    format!("printf '%s\\n' \"${SECRET_VAR}\" | sudo -S -p '' {command}")
}

/// Replace every occurrence of the secret with `***`.
pub fn redact(text: &str, secret: Option<&Secret>) -> String {
    match secret {
        Some(secret) if !secret.expose().is_empty() => {
            let mut redacted = text.to_string();
            for line in secret.expose().lines().filter(|l| l.len() >= 3) {
                redacted = redacted.replace(line, "***");
            }
            redacted.replace(secret.expose(), "***")
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_masked() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        let opts = ExecOptions::default().secret(Some(&secret));
        assert!(!format!("{opts:?}").contains("hunter2"));
    }

    #[test]
    fn test_redact() {
        let secret = Secret::new("hunter2");
        assert_eq!(
            redact("password hunter2 rejected", Some(&secret)),
            "password *** rejected"
        );
        assert_eq!(redact("plain", None), "plain");
        assert_eq!(redact("plain", Some(&Secret::new(""))), "plain");
    }

    #[test]
    fn test_sudo_reads_side_channel() {
        let cmd = sudo("systemctl restart php8.3-fpm");
        assert!(cmd.contains("$STAGEHAND_SECRET"));
        assert!(cmd.ends_with("sudo -S -p '' systemctl restart php8.3-fpm"));
    }

    #[test]
    fn test_prelude() {
        assert!(prelude(true).contains("STAGEHAND_SECRET=\"$(cat)\""));
        assert!(!prelude(false).contains("cat"));
    }

    #[test]
    fn test_destination() {
        let host = RemoteHost {
            name: "production".into(),
            hostname: "10.0.0.5".into(),
            user: Some("deploy".into()),
            port: Some(2222),
        };
        assert_eq!(host.destination(), "deploy@10.0.0.5");
        assert_eq!(HostRef::Remote(host).label(), "production");
        assert_eq!(HostRef::Local.to_string(), "local");
    }

    #[test]
    fn test_run_reports_failure_with_redacted_stderr() {
        let conduit = mock::ScriptedConduit::new();
        conduit.on_fail("psql", 2, "FATAL: password hunter2 rejected");
        let secret = Secret::new("hunter2");
        let err = conduit
            .run(
                &HostRef::Local,
                "psql -c 'SELECT 1'",
                &ExecOptions::default().secret(Some(&secret)),
            )
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("exit 2"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_test_condition() {
        let conduit = mock::ScriptedConduit::new();
        conduit.on("[ -L /srv/app/current ]", "+true");
        assert!(conduit.test(&HostRef::Local, "[ -L /srv/app/current ]").unwrap());
        assert!(!conduit.test(&HostRef::Local, "[ -d /missing ]").unwrap());
    }
}
