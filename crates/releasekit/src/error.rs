//! Error types for release orchestration.
//!
//! Errors are categorized so the orchestrator can decide whether a failure
//! aborts the run, falls back to a slower path, or hands over to rollback.
//! Each category carries a remediation string that the CLI prints instead
//! of a stack trace.

use std::time::Duration;
use thiserror::Error;

/// Categories of deployment errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or invalid settings
    Configuration,
    /// Missing or unresolved secret
    Secret,
    /// A preflight check failed
    Preflight,
    /// A cached artifact could not be trusted
    CacheIntegrity,
    /// Backup could not be created
    Backup,
    /// Schema migration failed
    Migration,
    /// Health verification of the live release failed
    Verification,
    /// Rollback could not restore a healthy release
    Rollback,
    /// Another deployment holds the host
    Lock,
    /// Connection, timeout or HTTP transport problem
    Transport,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Whether an error of this category stops the pipeline.
    ///
    /// Cache integrity problems are downgraded to a cache miss.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CacheIntegrity)
    }

    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Configuration => "Configuration error",
            Self::Secret => "Secret error",
            Self::Preflight => "Preflight check failed",
            Self::CacheIntegrity => "Cache integrity problem",
            Self::Backup => "Backup failed",
            Self::Migration => "Migration failed",
            Self::Verification => "Verification failed",
            Self::Rollback => "Rollback failed",
            Self::Lock => "Deployment locked",
            Self::Transport => "Connection problem",
            Self::Other => "Unexpected error",
        }
    }

    /// Remediation shown to the operator for this category.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Configuration => {
                "Check stagehand.toml and the environment definition for this stage"
            }
            Self::Secret => {
                "Export the missing STAGEHAND_* variables (or load your secrets file) and run again; nothing on the host was changed"
            }
            Self::Preflight => "Fix the failing check on the host and run again; no release was touched",
            Self::CacheIntegrity => {
                "The cache was ignored and a full rebuild ran; run `stagehand cache:clear <stage>` if this keeps happening"
            }
            Self::Backup => {
                "Fix the backup target (disk space, credentials) or rerun with --yes to migrate without a backup"
            }
            Self::Migration => {
                "The new release was not activated. Inspect the migration output and restore with `stagehand db:restore <stage>` if data was changed"
            }
            Self::Verification => {
                "The new release failed its health checks; inspect the application log. Rollback runs automatically when a previous release exists"
            }
            Self::Rollback => {
                "Automatic remediation stopped. Inspect the host and activate a known-good release with `stagehand rollback <stage> --to <release>`"
            }
            Self::Lock => {
                "Another deployment may be running. If not, remove the stale lock with `stagehand deploy:unlock <stage>`"
            }
            Self::Transport => "Check SSH connectivity to the host and try again",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors raised by the release engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid setting
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong and where
        message: String,
    },

    /// Required secrets absent from the environment
    #[error("missing required secrets: {}", .keys.join(", "))]
    MissingSecret {
        /// Every absent variable name, not just the first
        keys: Vec<String>,
    },

    /// Placeholders left after secret substitution in strict mode
    #[error("unresolved secret placeholders: {}", braced(.keys))]
    UnresolvedPlaceholder {
        /// Secret names referenced by the unresolved placeholders
        keys: Vec<String>,
    },

    /// Required environment keys that ended up empty or unresolved
    #[error("missing required values: {}", .keys.join(", "))]
    MissingRequiredValue {
        /// Environment keys that failed the requirement
        keys: Vec<String>,
    },

    /// A preflight check failed or did not report
    #[error("{check}: {message}")]
    Preflight {
        /// Name of the check
        check: String,
        /// Message reported by the check
        message: String,
        /// Remediation hint for this particular check
        hint: Option<String>,
    },

    /// A cached artifact could not be used
    #[error("cache integrity error in {domain}: {message}")]
    CacheIntegrity {
        /// Cache domain (dependencies, assets)
        domain: String,
        /// What went wrong
        message: String,
    },

    /// Backup creation or verification failed
    #[error("backup failed: {message}")]
    Backup {
        /// What went wrong
        message: String,
    },

    /// Backup failed and the operator did not confirm continuing without one
    #[error("migration aborted: backup failed ({message}) and continuing without a backup was not confirmed")]
    BackupAborted {
        /// Underlying backup failure
        message: String,
    },

    /// Migration command failed or timed out
    #[error("migration failed: {message}{}", restore_hint(.backup, .restore_command))]
    Migration {
        /// Failure detail
        message: String,
        /// Backup taken before the migration started, if any
        backup: Option<String>,
        /// Command that restores the backup
        restore_command: String,
    },

    /// Basic health verification exhausted its attempts
    #[error("verification of {url} failed after {attempts} attempt(s): HTTP {}", status_label(*.status))]
    Verification {
        /// URL that was probed
        url: String,
        /// Attempts made
        attempts: u32,
        /// Status code of the last attempt (None when no response arrived)
        status: Option<u16>,
        /// Body snippet of the last attempt
        body: String,
    },

    /// A deep health probe failed
    #[error("deep health check '{probe}' failed: {message}")]
    DeepCheck {
        /// Probe name
        probe: String,
        /// What went wrong
        message: String,
    },

    /// Rollback could not be completed or verified
    #[error("rollback failed: {message}")]
    Rollback {
        /// What went wrong
        message: String,
    },

    /// Deploy lock is held
    #[error("deploy lock is held at {path}")]
    Lock {
        /// Lock location on the host
        path: String,
    },

    /// A value failed shell-safety validation
    #[error("invalid {context}: {message}")]
    InvalidInput {
        /// What kind of value was validated
        context: String,
        /// Why it was rejected
        message: String,
    },

    /// Remote or local command exited non-zero
    #[error("command failed on {host} (exit {code}): {stderr}")]
    CommandFailed {
        /// Host label
        host: String,
        /// Command text (never contains secrets)
        command: String,
        /// Exit code, -1 when killed by a signal
        code: i32,
        /// Captured stderr (or stdout when stderr was empty)
        stderr: String,
    },

    /// Command exceeded its timeout
    #[error("command timed out on {host} after {}s", .timeout.as_secs())]
    Timeout {
        /// Host label
        host: String,
        /// Command text
        command: String,
        /// Timeout that expired
        timeout: Duration,
    },

    /// HTTP transport error
    #[error("HTTP error: {message}")]
    Http {
        /// Transport error detail
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for an input validation error.
    pub fn invalid(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration { .. } | Error::InvalidInput { .. } => {
                ErrorCategory::Configuration
            }
            Error::MissingSecret { .. }
            | Error::UnresolvedPlaceholder { .. }
            | Error::MissingRequiredValue { .. } => ErrorCategory::Secret,
            Error::Preflight { .. } => ErrorCategory::Preflight,
            Error::CacheIntegrity { .. } => ErrorCategory::CacheIntegrity,
            Error::Backup { .. } | Error::BackupAborted { .. } => ErrorCategory::Backup,
            Error::Migration { .. } => ErrorCategory::Migration,
            Error::Verification { .. } | Error::DeepCheck { .. } => ErrorCategory::Verification,
            Error::Rollback { .. } => ErrorCategory::Rollback,
            Error::Lock { .. } => ErrorCategory::Lock,
            Error::Timeout { .. } | Error::Http { .. } => ErrorCategory::Transport,
            Error::CommandFailed { .. } | Error::Io(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Remediation text for this error.
    ///
    /// Preflight failures carry a check-specific hint which wins over the
    /// category text.
    pub fn guidance(&self) -> String {
        match self {
            Error::Preflight {
                hint: Some(hint), ..
            } => hint.clone(),
            other => other.category().guidance().to_string(),
        }
    }
}

fn braced(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("{{{k}}}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn restore_hint(backup: &Option<String>, restore_command: &str) -> String {
    match backup {
        Some(path) => format!(
            ". A backup was created before the migration at {path}; run `{restore_command}` to restore it if needed"
        ),
        None => format!(". No backup was taken; `{restore_command}` can only restore an older backup"),
    }
}

fn status_label(status: Option<u16>) -> String {
    status.map_or_else(|| "000".to_string(), |s| s.to_string())
}

/// Result type for release operations.
pub type Result<T> = std::result::Result<T, Error>;
