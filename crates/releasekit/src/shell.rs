//! Shell-safe command construction.
//!
//! Every value that ends up inside a remote command either passes one of the
//! validators below or is single-quoted with [`quote`]. Secrets never go
//! through here; they travel on the conduit's stdin side channel.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("valid regex"));

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
        .expect("valid regex")
});

static DB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,62}$").expect("valid regex"));

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

static DEPLOY_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[~/][a-zA-Z0-9._/-]+$").expect("valid regex"));

static RELATIVE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._][a-zA-Z0-9._/-]*$").expect("valid regex"));

/// Validate a generic identifier (stage names, unit names, release ids).
pub fn validate_identifier<'a>(value: &'a str, context: &str) -> Result<&'a str> {
    if IDENTIFIER.is_match(value) {
        Ok(value)
    } else {
        Err(Error::invalid(
            context,
            format!("'{value}' may only contain letters, digits, dot, dash and underscore"),
        ))
    }
}

/// Validate a DNS domain name.
pub fn validate_domain(value: &str) -> Result<&str> {
    if value.len() > 253 || !DOMAIN.is_match(value) {
        return Err(Error::invalid("domain", format!("'{value}' is not a valid domain name")));
    }
    Ok(value)
}

/// Validate a database name.
pub fn validate_db_name(value: &str) -> Result<&str> {
    if DB_NAME.is_match(value) {
        Ok(value)
    } else {
        Err(Error::invalid(
            "database name",
            format!("'{value}' must start with a letter or underscore and contain only letters, digits and underscores (max 63)"),
        ))
    }
}

/// Validate a system username.
pub fn validate_username(value: &str) -> Result<&str> {
    if USERNAME.is_match(value) {
        Ok(value)
    } else {
        Err(Error::invalid(
            "username",
            format!("'{value}' must be lowercase, start with a letter or underscore, max 32 characters"),
        ))
    }
}

/// Validate an absolute (or home-relative) deploy path.
pub fn validate_deploy_path(value: &str) -> Result<&str> {
    if value.contains("..") {
        return Err(Error::invalid("deploy path", "path traversal is not allowed"));
    }
    if !DEPLOY_PATH.is_match(value) {
        return Err(Error::invalid(
            "deploy path",
            format!("'{value}' must be absolute (or start with ~) and contain only safe characters"),
        ));
    }
    Ok(value)
}

/// Validate a path relative to a release directory (shared files, build output).
pub fn validate_relative_path(value: &str) -> Result<&str> {
    if value.contains("..") || !RELATIVE_PATH.is_match(value) {
        return Err(Error::invalid(
            "relative path",
            format!("'{value}' must be a plain relative path inside the release"),
        ));
    }
    Ok(value)
}

/// Single-quote a value for POSIX shells.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '=' | '@' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a path while keeping a leading `~/` expandable by the remote shell.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", quote(rest)),
        _ if path == "~" => "~".to_string(),
        _ => quote(path),
    }
}

/// Run an already-built command inside a directory.
pub fn in_dir(dir: &str, command: &str) -> String {
    format!("cd {} && {command}", quote_path(dir))
}

/// Incrementally built shell command.
///
/// Arguments are quoted on the way in; [`ShellCommand::raw`] is reserved for
/// operators and fragments that are already trusted (`|`, `&&`, `2>&1`).
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    parts: Vec<String>,
    dir: Option<String>,
}

impl ShellCommand {
    /// Start a command with a program name.
    pub fn new(program: &str) -> Self {
        Self {
            parts: vec![quote(program)],
            dir: None,
        }
    }

    /// Append a quoted argument.
    #[must_use]
    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(quote(value.as_ref()));
        self
    }

    /// Append several quoted arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parts
            .extend(values.into_iter().map(|v| quote(v.as_ref())));
        self
    }

    /// Append a path argument, keeping `~/` expandable.
    #[must_use]
    pub fn path(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(quote_path(value.as_ref()));
        self
    }

    /// Append a trusted fragment verbatim.
    #[must_use]
    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        self.parts.push(fragment.into());
        self
    }

    /// Run the command inside a directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.dir = Some(quote_path(dir.as_ref()));
        self
    }

    /// Render to a script line.
    pub fn build(&self) -> String {
        let cmd = self.parts.join(" ");
        match &self.dir {
            Some(dir) => format!("cd {dir} && {cmd}"),
            None => cmd,
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_values_untouched() {
        assert_eq!(quote("storage/logs"), "storage/logs");
        assert_eq!(quote("--force"), "--force");
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b; rm -rf /"), "'a b; rm -rf /'");
    }

    #[test]
    fn test_quote_path_keeps_home_expandable() {
        assert_eq!(quote_path("~/apps/my app"), "~/'apps/my app'");
        assert_eq!(quote_path("/srv/app"), "/srv/app");
        assert_eq!(quote_path("~"), "~");
    }

    #[test]
    fn test_validate_deploy_path() {
        assert!(validate_deploy_path("/var/www/app").is_ok());
        assert!(validate_deploy_path("~/app").is_ok());
        assert!(validate_deploy_path("/var/www/../etc").is_err());
        assert!(validate_deploy_path("relative/path").is_err());
        assert!(validate_deploy_path("/srv/app;reboot").is_err());
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("api.staging.example.com").is_ok());
        assert!(validate_domain("-bad.com").is_err());
        assert!(validate_domain("exa mple.com").is_err());
        assert!(validate_domain(&"a.".repeat(130)).is_err());
    }

    #[test]
    fn test_validate_db_name_and_username() {
        assert!(validate_db_name("app_production").is_ok());
        assert!(validate_db_name("1app").is_err());
        assert!(validate_db_name("app-db").is_err());
        assert!(validate_username("deployer").is_ok());
        assert!(validate_username("Deployer").is_err());
    }

    #[test]
    fn test_validate_relative_path() {
        assert!(validate_relative_path("storage").is_ok());
        assert!(validate_relative_path("public/build").is_ok());
        assert!(validate_relative_path("/etc").is_err());
        assert!(validate_relative_path("../secrets").is_err());
    }

    #[test]
    fn test_shell_command_build() {
        let cmd = ShellCommand::new("php")
            .arg("artisan")
            .arg("migrate")
            .arg("--force")
            .in_dir("~/app/releases/20260101000000");
        assert_eq!(
            cmd.build(),
            "cd ~/app/releases/20260101000000 && php artisan migrate --force"
        );
    }

    #[test]
    fn test_in_dir() {
        assert_eq!(in_dir("~/app/current", "php artisan up"), "cd ~/app/current && php artisan up");
        assert_eq!(in_dir("/srv/my app", "ls"), "cd '/srv/my app' && ls");
    }

    #[test]
    fn test_shell_command_quotes_hostile_args() {
        let cmd = ShellCommand::new("echo").arg("$(whoami)").raw("2>&1");
        assert_eq!(cmd.to_string(), "echo '$(whoami)' 2>&1");
    }
}
