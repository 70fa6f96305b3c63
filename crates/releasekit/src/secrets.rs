//! Secret resolution.
//!
//! Secrets are read once per run from the process environment (or any other
//! [`SecretSource`]) into a [`SecretMap`]. Variable names carry a prefix,
//! map keys do not: `STAGEHAND_APP_KEY` resolves to `app_key`.

use crate::conduit::Secret;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{(\w+)\}$").expect("valid regex"));

/// Default prefix for secret environment variables.
pub const DEFAULT_PREFIX: &str = "STAGEHAND_";

/// Key of the sudo password in the secret map.
pub const SUDO_PASS: &str = "sudo_pass";

/// Key of the database password in the secret map.
pub const DB_PASSWORD: &str = "db_password";

/// Where secret values come from.
pub trait SecretSource {
    /// Look up a variable by its full name.
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretSource for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Which secrets a run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretSpec {
    /// Prefix prepended to names when reading variables
    pub prefix: String,
    /// Names that must resolve to non-empty values
    pub required: Vec<String>,
    /// Names with a default used when unset
    pub optional: BTreeMap<String, String>,
}

impl Default for SecretSpec {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            required: Vec::new(),
            optional: BTreeMap::new(),
        }
    }
}

impl SecretSpec {
    /// Full variable name for a configured name.
    pub fn variable(&self, name: &str) -> String {
        if name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}{name}", self.prefix)
        }
    }

    /// Map key for a configured name: prefix stripped, lower-cased.
    pub fn key(&self, name: &str) -> String {
        name.strip_prefix(self.prefix.as_str())
            .unwrap_or(name)
            .to_lowercase()
    }
}

/// Resolved secrets, keyed by lower-case name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretMap {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "***")))
            .finish()
    }
}

impl SecretMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a value (may be empty).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a value that must be present and non-empty.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::MissingSecret {
                keys: vec![key.to_string()],
            }),
        }
    }

    /// Wrap a non-empty value for the conduit side channel.
    pub fn secret(&self, key: &str) -> Option<Secret> {
        self.get(key).filter(|v| !v.is_empty()).map(Secret::new)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// All non-empty values, for masking output.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values
            .values()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Build the secret map, failing with every absent required name at once.
pub fn resolve(spec: &SecretSpec, source: &dyn SecretSource) -> Result<SecretMap> {
    let mut map = SecretMap::new();
    let mut missing = Vec::new();

    for name in &spec.required {
        let var = spec.variable(name);
        match source.lookup(&var) {
            Some(value) if !value.is_empty() => map.insert(spec.key(&var), value),
            _ => missing.push(var),
        }
    }

    if !missing.is_empty() {
        return Err(Error::MissingSecret { keys: missing });
    }

    for (name, default) in &spec.optional {
        let var = spec.variable(name);
        let value = source
            .lookup(&var)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.clone());
        map.insert(spec.key(&var), value);
    }

    log::debug!("resolved {} secret(s)", map.len());
    Ok(map)
}

/// Secret key referenced by a whole-value placeholder such as `{db_password}`.
pub fn placeholder_key(value: &str) -> Option<&str> {
    PLACEHOLDER
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Whether a value is placeholder-shaped.
pub fn is_placeholder(value: &str) -> bool {
    PLACEHOLDER.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn spec(required: &[&str], optional: &[(&str, &str)]) -> SecretSpec {
        SecretSpec {
            required: required.iter().map(|s| (*s).to_string()).collect(),
            optional: optional
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_required_and_optional_defaults() {
        let env = source(&[
            ("STAGEHAND_SUDO_PASS", "pw"),
            ("STAGEHAND_APP_KEY", "base64:abc"),
        ]);
        let map = resolve(&spec(&["SUDO_PASS", "APP_KEY"], &[("DB_PASSWORD", "")]), &env).unwrap();
        assert_eq!(map.get("sudo_pass"), Some("pw"));
        assert_eq!(map.get("app_key"), Some("base64:abc"));
        assert_eq!(map.get("db_password"), Some(""));
    }

    #[test]
    fn test_missing_lists_every_key() {
        let env = source(&[("STAGEHAND_APP_KEY", "x")]);
        let err = resolve(
            &spec(&["SUDO_PASS", "APP_KEY", "DB_PASSWORD", "REDIS_PASSWORD"], &[]),
            &env,
        )
        .unwrap_err();
        match err {
            Error::MissingSecret { keys } => assert_eq!(
                keys,
                vec![
                    "STAGEHAND_SUDO_PASS",
                    "STAGEHAND_DB_PASSWORD",
                    "STAGEHAND_REDIS_PASSWORD"
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_required_value_counts_as_missing() {
        let env = source(&[("STAGEHAND_SUDO_PASS", "")]);
        assert!(resolve(&spec(&["SUDO_PASS"], &[]), &env).is_err());
    }

    #[test]
    fn test_prefixed_names_are_accepted() {
        let env = source(&[("STAGEHAND_APP_KEY", "k")]);
        let map = resolve(&spec(&["STAGEHAND_APP_KEY"], &[]), &env).unwrap();
        assert_eq!(map.get("app_key"), Some("k"));
    }

    #[test]
    fn test_optional_value_overrides_default() {
        let env = source(&[("STAGEHAND_DB_PASSWORD", "dbpw")]);
        let map = resolve(&spec(&[], &[("DB_PASSWORD", "fallback")]), &env).unwrap();
        assert_eq!(map.get("db_password"), Some("dbpw"));
    }

    #[test]
    fn test_debug_masks_values() {
        let mut map = SecretMap::new();
        map.insert("app_key", "super-secret");
        let debug = format!("{map:?}");
        assert!(debug.contains("app_key"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_require_and_secret() {
        let mut map = SecretMap::new();
        map.insert("sudo_pass", "pw");
        map.insert("db_password", "");
        assert_eq!(map.require("sudo_pass").unwrap(), "pw");
        assert!(map.require("db_password").is_err());
        assert!(map.secret("db_password").is_none());
        assert_eq!(map.secret("sudo_pass").unwrap().expose(), "pw");
    }

    #[test]
    fn test_placeholder_whole_value_only() {
        assert_eq!(placeholder_key("{db_password}"), Some("db_password"));
        assert_eq!(placeholder_key("prefix-{db_password}"), None);
        assert_eq!(placeholder_key("{not valid}"), None);
        assert!(is_placeholder("{app_key}"));
        assert!(!is_placeholder("{}"));
    }
}
