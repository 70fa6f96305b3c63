//! Environment file materialization.
//!
//! Layers are merged base < shared < per-environment, placeholders are then
//! substituted from the secret map. The result is rendered as `KEY=VALUE`
//! lines suitable for a dotenv loader.

use crate::error::{Error, Result};
use crate::secrets::{SecretMap, is_placeholder, placeholder_key};
use std::collections::{BTreeMap, BTreeSet};

/// Ordered environment map.
pub type EnvMap = BTreeMap<String, String>;

/// Mask shown in place of secret values.
pub const MASK: &str = "********";

/// Outcome of [`build_environment`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    /// Final values
    pub values: EnvMap,
    /// Secret names whose placeholders were left as literals
    pub unresolved: Vec<String>,
    /// Environment keys whose value came from a secret
    pub substituted: BTreeSet<String>,
}

impl ResolvedEnv {
    /// Render to file contents.
    pub fn render(&self) -> String {
        render(&self.values)
    }

    /// Values with secret-derived entries masked.
    pub fn masked(&self) -> EnvMap {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if self.substituted.contains(k) {
                    MASK.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }
}

/// Merge layers, substitute secrets and (in strict mode) validate.
///
/// Strict mode reports unresolved placeholders first; only when every
/// placeholder resolved are `required_keys` checked for empty values.
pub fn build_environment(
    base: &EnvMap,
    shared: &EnvMap,
    per_env: &EnvMap,
    secrets: &SecretMap,
    strict: bool,
    required_keys: &[String],
) -> Result<ResolvedEnv> {
    let mut merged = base.clone();
    for layer in [shared, per_env] {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }

    let mut resolved = ResolvedEnv::default();
    for (key, value) in merged {
        let value = match placeholder_key(&value) {
            Some(name) => match secrets.get(name).filter(|s| !s.is_empty()) {
                Some(secret) => {
                    resolved.substituted.insert(key.clone());
                    secret.to_string()
                }
                None => {
                    resolved.unresolved.push(name.to_string());
                    value
                }
            },
            None => value,
        };
        resolved.values.insert(key, value);
    }

    if !resolved.unresolved.is_empty() {
        log::warn!(
            "unresolved secret placeholders: {}",
            resolved.unresolved.join(", ")
        );
    }

    if strict {
        if !resolved.unresolved.is_empty() {
            return Err(Error::UnresolvedPlaceholder {
                keys: resolved.unresolved.clone(),
            });
        }
        let missing: Vec<String> = required_keys
            .iter()
            .filter(|k| {
                resolved
                    .values
                    .get(k.as_str())
                    .is_none_or(|v| v.is_empty() || is_placeholder(v))
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingRequiredValue { keys: missing });
        }
    }

    Ok(resolved)
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '$'))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str(r"\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str(r"\n"),
            '\r' => out.push_str(r"\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Render a map as `KEY=VALUE` lines.
pub fn render(env: &EnvMap) -> String {
    let mut content = String::new();
    for (key, value) in env {
        content.push_str(key);
        content.push('=');
        if needs_quotes(value) {
            content.push('"');
            content.push_str(&escape(value));
            content.push('"');
        } else {
            content.push_str(value);
        }
        content.push('\n');
    }
    content
}

/// Parse file contents produced by [`render`] (or a hand-written dotenv file).
pub fn parse(content: &str) -> EnvMap {
    let mut env = EnvMap::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let value = match raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
        {
            Some(inner) => unescape(inner),
            None => match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
                Some(inner) => inner.to_string(),
                None => raw.trim_end().to_string(),
            },
        };
        env.insert(key.trim().to_string(), value);
    }
    env
}

/// Keys whose value is still placeholder-shaped, with the secret they name.
pub fn placeholders(env: &EnvMap) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|(k, v)| placeholder_key(v).map(|name| (k.clone(), name.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn secrets(pairs: &[(&str, &str)]) -> SecretMap {
        let mut s = SecretMap::new();
        for (k, v) in pairs {
            s.insert(*k, *v);
        }
        s
    }

    #[test]
    fn test_per_env_wins_over_shared_and_base() {
        let base = map(&[("APP_ENV", "local"), ("LOG_LEVEL", "debug"), ("A", "base")]);
        let shared = map(&[("APP_ENV", "shared"), ("A", "shared")]);
        let per_env = map(&[("APP_ENV", "production")]);
        let env = build_environment(&base, &shared, &per_env, &SecretMap::new(), false, &[]).unwrap();
        assert_eq!(env.values["APP_ENV"], "production");
        assert_eq!(env.values["A"], "shared");
        assert_eq!(env.values["LOG_LEVEL"], "debug");
    }

    #[test]
    fn test_placeholders_substituted_whole_value_only() {
        let base = map(&[
            ("DB_PASSWORD", "{db_password}"),
            ("DSN", "pgsql://{db_password}@db"),
        ]);
        let env = build_environment(
            &base,
            &EnvMap::new(),
            &EnvMap::new(),
            &secrets(&[("db_password", "pw")]),
            true,
            &[],
        )
        .unwrap();
        assert_eq!(env.values["DB_PASSWORD"], "pw");
        assert_eq!(env.values["DSN"], "pgsql://{db_password}@db");
        assert!(env.substituted.contains("DB_PASSWORD"));
        assert_eq!(env.masked()["DB_PASSWORD"], MASK);
    }

    #[test]
    fn test_unknown_placeholder_left_literal_when_lenient() {
        let base = map(&[("STRIPE_KEY", "{stripe_key}")]);
        let env = build_environment(&base, &EnvMap::new(), &EnvMap::new(), &SecretMap::new(), false, &[])
            .unwrap();
        assert_eq!(env.values["STRIPE_KEY"], "{stripe_key}");
        assert_eq!(env.unresolved, vec!["stripe_key"]);
    }

    #[test]
    fn test_strict_rejects_unresolved_and_empty_secret() {
        let base = map(&[("STRIPE_KEY", "{stripe_key}"), ("DB_PASSWORD", "{db_password}")]);
        let err = build_environment(
            &base,
            &EnvMap::new(),
            &EnvMap::new(),
            &secrets(&[("db_password", "")]),
            true,
            &[],
        )
        .unwrap_err();
        match err {
            Error::UnresolvedPlaceholder { keys } => {
                assert_eq!(keys, vec!["db_password", "stripe_key"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_strict_required_keys() {
        let base = map(&[("APP_KEY", ""), ("APP_URL", "https://example.test")]);
        let required = vec!["APP_KEY".to_string(), "APP_URL".to_string(), "APP_NAME".to_string()];
        let err = build_environment(&base, &EnvMap::new(), &EnvMap::new(), &SecretMap::new(), true, &required)
            .unwrap_err();
        match err {
            Error::MissingRequiredValue { keys } => assert_eq!(keys, vec!["APP_KEY", "APP_NAME"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_render_quotes_special_values() {
        let env = map(&[
            ("A", "plain"),
            ("B", ""),
            ("C", "two words"),
            ("D", "say \"hi\""),
            ("E", "$HOME"),
            ("F", "a#b"),
        ]);
        assert_eq!(
            render(&env),
            "A=plain\nB=\"\"\nC=\"two words\"\nD=\"say \\\"hi\\\"\"\nE=\"$HOME\"\nF=\"a#b\"\n"
        );
    }

    #[test]
    fn test_render_parse_round_trip() {
        let env = map(&[
            ("APP_NAME", "My App"),
            ("EMPTY", ""),
            ("MULTI", "line1\nline2\r\n"),
            ("QUOTES", "it's \"quoted\""),
            ("BACKSLASH", r"C:\path\n"),
            ("BACKSLASH_QUOTED", r"a \ b"),
            ("HASH", "#notacomment"),
            ("TAB", "a\tb"),
            ("URL", "https://example.test/?a=b&c=d"),
            ("SPACES", "  padded  "),
        ]);
        assert_eq!(parse(&render(&env)), env);
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let env = parse("# comment\n\nexport A=1\nB='single quoted'\n");
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "single quoted");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_placeholders_listing() {
        let env = map(&[("A", "{app_key}"), ("B", "x")]);
        assert_eq!(placeholders(&env), vec![("A".to_string(), "app_key".to_string())]);
    }
}
