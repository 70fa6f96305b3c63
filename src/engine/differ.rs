//! Environment file diff computation and display

use colored::Colorize;
use regex::Regex;
use releasekit::envfile::{self, EnvMap, MASK, ResolvedEnv};
use similar::{ChangeTag, TextDiff};
use std::sync::LazyLock;

/// Keys whose values are masked even when they did not come from a secret.
static SENSITIVE_KEY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(PASSWORD|PASSWD|SECRET|TOKEN|_KEY$|^APP_KEY$|PRIVATE)").ok()
});

/// One changed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Added { key: String, value: String },
    Removed { key: String, value: String },
    Changed { key: String, from: String, to: String },
}

impl EnvChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Removed { key, .. } | Self::Changed { key, .. } => key,
        }
    }
}

/// Whether a key names a credential.
pub fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEY.as_ref().is_some_and(|re| re.is_match(key))
}

/// Mask both sides of a comparison so secrets never reach the terminal.
///
/// Keys filled from a secret, and keys that look like credentials, are
/// replaced by the mask on both sides.
pub fn mask_pair(current: &EnvMap, desired: &ResolvedEnv) -> (EnvMap, EnvMap) {
    let hide = |key: &str| desired.substituted.contains(key) || is_sensitive(key);
    let mask = |map: &EnvMap| -> EnvMap {
        map.iter()
            .map(|(k, v)| {
                let shown = if hide(k) && !v.is_empty() { MASK.to_string() } else { v.clone() };
                (k.clone(), shown)
            })
            .collect()
    };
    (mask(current), mask(&desired.values))
}

/// Changes needed to turn `current` into `desired`, in key order.
///
/// Masked values that differ are still reported as changed; the comparison
/// runs on the real values.
pub fn compute_env_changes(current: &EnvMap, desired: &ResolvedEnv) -> Vec<EnvChange> {
    let (shown_current, shown_desired) = mask_pair(current, desired);
    let mut changes = Vec::new();

    for (key, value) in &desired.values {
        match current.get(key) {
            None => changes.push(EnvChange::Added {
                key: key.clone(),
                value: shown_desired[key].clone(),
            }),
            Some(old) if old != value => changes.push(EnvChange::Changed {
                key: key.clone(),
                from: shown_current[key].clone(),
                to: shown_desired[key].clone(),
            }),
            Some(_) => {}
        }
    }
    for key in current.keys() {
        if !desired.values.contains_key(key) {
            changes.push(EnvChange::Removed {
                key: key.clone(),
                value: shown_current[key].clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.key().cmp(b.key()));
    changes
}

/// Unified line diff of the rendered files, masked.
pub fn unified_diff(current: &EnvMap, desired: &ResolvedEnv) -> String {
    let (shown_current, shown_desired) = mask_pair(current, desired);
    let old = envfile::render(&shown_current);
    let new = envfile::render(&shown_desired);

    let diff = TextDiff::from_lines(&old, &new);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-",
            ChangeTag::Insert => "+",
            ChangeTag::Equal => " ",
        };
        out.push_str(sign);
        out.push_str(change.value());
        if change.missing_newline() {
            out.push('\n');
        }
    }
    out
}

/// Display a list of changes in a user-friendly format
pub fn display_env_diff(stage: &str, changes: &[EnvChange]) {
    if changes.is_empty() {
        println!();
        println!("  {} Environment file of {stage} is up to date", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        format!("Environment Diff: {stage}").bold()
    );
    println!("│");

    for change in changes {
        match change {
            EnvChange::Added { key, value } => {
                println!("│   {} {:<30} {}", "+".green(), key, value.dimmed());
            }
            EnvChange::Removed { key, value } => {
                println!("│   {} {:<30} {}", "-".red(), key, value.dimmed());
            }
            EnvChange::Changed { key, from, to } => {
                println!(
                    "│   {} {:<30} {}",
                    "~".yellow(),
                    key,
                    format!("{from} → {to}").dimmed()
                );
            }
        }
    }

    let count = |f: fn(&EnvChange) -> bool| changes.iter().filter(|c| f(c)).count();
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} added, {} changed, {} removed",
        count(|c| matches!(c, EnvChange::Added { .. })).to_string().green(),
        count(|c| matches!(c, EnvChange::Changed { .. })).to_string().yellow(),
        count(|c| matches!(c, EnvChange::Removed { .. })).to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn resolved(pairs: &[(&str, &str)], substituted: &[&str]) -> ResolvedEnv {
        ResolvedEnv {
            values: env(pairs),
            unresolved: Vec::new(),
            substituted: substituted.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_changes_in_key_order() {
        let current = env(&[("APP_NAME", "Shop"), ("OLD", "1"), ("APP_DEBUG", "true")]);
        let desired = resolved(&[("APP_NAME", "Shop"), ("APP_DEBUG", "false"), ("NEW", "x")], &[]);

        let changes = compute_env_changes(&current, &desired);
        assert_eq!(
            changes,
            vec![
                EnvChange::Changed {
                    key: "APP_DEBUG".to_string(),
                    from: "true".to_string(),
                    to: "false".to_string()
                },
                EnvChange::Added {
                    key: "NEW".to_string(),
                    value: "x".to_string()
                },
                EnvChange::Removed {
                    key: "OLD".to_string(),
                    value: "1".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_secrets_are_masked_but_compared() {
        let current = env(&[("DB_PASSWORD", "old-pass"), ("MAIL_FROM", "shop@example.com")]);
        let desired = resolved(
            &[("DB_PASSWORD", "new-pass"), ("MAIL_FROM", "hello@example.com")],
            &["MAIL_FROM"],
        );

        let changes = compute_env_changes(&current, &desired);
        assert_eq!(changes.len(), 2);
        for change in &changes {
            let EnvChange::Changed { from, to, .. } = change else {
                panic!("expected a change");
            };
            assert_eq!(from, MASK);
            assert_eq!(to, MASK);
        }
    }

    #[test]
    fn test_unchanged_secret_not_reported() {
        let current = env(&[("APP_KEY", "base64:abc")]);
        let desired = resolved(&[("APP_KEY", "base64:abc")], &["APP_KEY"]);
        assert!(compute_env_changes(&current, &desired).is_empty());
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive("DB_PASSWORD"));
        assert!(is_sensitive("STRIPE_SECRET"));
        assert!(is_sensitive("AWS_ACCESS_KEY"));
        assert!(is_sensitive("APP_KEY"));
        assert!(!is_sensitive("APP_NAME"));
        assert!(!is_sensitive("KEYBOARD_LAYOUT"));
    }

    #[test]
    fn test_unified_diff_never_shows_secrets() {
        let current = env(&[("APP_NAME", "Shop"), ("REDIS_PASSWORD", "hunter2")]);
        let desired = resolved(&[("APP_NAME", "Shop 2"), ("REDIS_PASSWORD", "swordfish")], &[]);

        let diff = unified_diff(&current, &desired);
        assert!(diff.contains("-APP_NAME=Shop\n"));
        assert!(diff.contains("+APP_NAME=\"Shop 2\"\n") || diff.contains("+APP_NAME=Shop 2\n"));
        assert!(!diff.contains("hunter2"));
        assert!(!diff.contains("swordfish"));
    }
}
