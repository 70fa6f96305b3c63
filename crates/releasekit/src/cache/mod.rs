//! Cache keyed builder.
//!
//! A [`Fingerprint`] summarizes the content of a file set. When the stored
//! fingerprint of a cache domain matches and the artifact is still there,
//! the artifact is restored instead of rebuilt. The new fingerprint is only
//! recorded after the artifact it describes has been written.

pub mod remote;

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use remote::{AssetCache, CacheStatus, DependencyCache, DomainStatus, RemoteCache};

/// Content hash over a file set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a stored hash string.
    pub fn from_stored(value: &str) -> Option<Self> {
        let value = value.trim();
        if !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for display and artifact names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file of a fingerprinted set: relative path and content hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHash {
    /// Path relative to the tree root
    pub path: String,
    /// Hex content hash
    pub hash: String,
}

/// Combine per-file hashes into one fingerprint.
///
/// Entries are sorted first, so input order does not matter.
pub fn fingerprint(entries: &[FileHash]) -> Fingerprint {
    let mut sorted: Vec<&FileHash> = entries.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for entry in sorted {
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.hash.as_bytes());
        hasher.update(b"\n");
    }
    Fingerprint(hasher.finalize().to_hex().to_string())
}

/// Parse `sha256sum` style output (`<hash>  <path>`).
pub fn parse_hash_lines(output: &str) -> Vec<FileHash> {
    output
        .lines()
        .filter_map(|line| {
            let (hash, path) = line.trim().split_once(char::is_whitespace)?;
            let path = path.trim_start().trim_start_matches('*');
            let path = path.strip_prefix("./").unwrap_or(path);
            if hash.is_empty() || path.is_empty() {
                return None;
            }
            Some(FileHash {
                path: path.to_string(),
                hash: hash.to_string(),
            })
        })
        .collect()
}

/// Set of files described by glob patterns relative to a tree root.
///
/// Supports `*`, `?`, `**/` and `{a,b}` alternatives.
#[derive(Debug, Clone)]
pub struct FileSet {
    patterns: Vec<String>,
    matchers: Vec<Regex>,
}

impl FileSet {
    /// Compile patterns.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let matchers = patterns
            .iter()
            .map(|p| {
                Regex::new(&glob_to_regex(p))
                    .map_err(|e| Error::config(format!("invalid file pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns: patterns.to_vec(),
            matchers,
        })
    }

    /// Whether a relative path belongs to the set.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.matchers.iter().any(|m| m.is_match(path))
    }

    /// Keep only entries inside the set.
    pub fn filter(&self, entries: Vec<FileHash>) -> Vec<FileHash> {
        entries
            .into_iter()
            .filter(|e| self.matches(&e.path))
            .collect()
    }

    /// Paths that need scanning to cover every pattern.
    ///
    /// A top-level glob such as `vite.config.*` only needs the files
    /// directly in the root; a leading `**` needs the whole tree.
    pub fn roots(&self) -> Vec<ScanRoot> {
        let mut roots: Vec<ScanRoot> = self
            .patterns
            .iter()
            .map(|p| {
                let (first, rest) = match p.split_once('/') {
                    Some((first, rest)) => (first, Some(rest)),
                    None => (p.as_str(), None),
                };
                if !first.contains(['*', '?', '{']) {
                    ScanRoot::Path(first.to_string())
                } else if rest.is_none() {
                    ScanRoot::TopLevel
                } else {
                    ScanRoot::Tree
                }
            })
            .collect();
        roots.sort();
        roots.dedup();
        if roots.contains(&ScanRoot::Tree) {
            return vec![ScanRoot::Tree];
        }
        roots
    }

    /// The configured patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Where to look for files of a [`FileSet`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanRoot {
    /// Files directly inside the root
    TopLevel,
    /// A file or directory below the root, scanned recursively
    Path(String),
    /// The whole tree
    Tree,
}

fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    let mut in_group = false;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '{' => {
                in_group = true;
                re.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                re.push(')');
            }
            ',' if in_group => re.push('|'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    re.push('$');
    re
}

/// Whether a cache hit was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Artifact restored from cache
    Reused,
    /// Artifact rebuilt (and stored for next time)
    Rebuilt,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOutcome::Reused => f.write_str("reused"),
            CacheOutcome::Rebuilt => f.write_str("rebuilt"),
        }
    }
}

/// A cache domain: where its fingerprint and artifacts live and how to
/// rebuild them.
pub trait CacheTarget {
    /// Domain name for logs and errors.
    fn domain(&self) -> &str;

    /// Fingerprint recorded by the last successful rebuild.
    fn stored_fingerprint(&self) -> Result<Option<Fingerprint>>;

    /// Whether an artifact for `fingerprint` is available.
    fn artifact_exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Put the cached artifact in place.
    fn restore(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Check that a restore produced usable output.
    fn verify_restored(&self) -> Result<()>;

    /// Produce the output from scratch.
    fn rebuild(&self) -> Result<()>;

    /// Save the freshly built output as the artifact for `fingerprint`.
    fn persist_artifact(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Record `fingerprint` as current.
    fn store_fingerprint(&self, fingerprint: &Fingerprint) -> Result<()>;
}

/// Reuse the cached artifact when possible, otherwise rebuild.
///
/// Restore or verification problems degrade to a rebuild. Rebuild failures
/// are returned. When the artifact cannot be persisted the fingerprint is
/// left untouched, so the next run rebuilds again.
pub fn ensure(target: &dyn CacheTarget, fingerprint: &Fingerprint) -> Result<CacheOutcome> {
    let domain = target.domain();
    let stored = target.stored_fingerprint().unwrap_or_else(|e| {
        log::warn!("[{domain}] could not read stored fingerprint: {e}");
        None
    });

    if stored.as_ref() == Some(fingerprint) {
        match try_reuse(target, fingerprint) {
            Ok(true) => {
                log::info!("[{domain}] fingerprint {} unchanged, reused cache", fingerprint.short());
                return Ok(CacheOutcome::Reused);
            }
            Ok(false) => log::info!("[{domain}] cached artifact missing, rebuilding"),
            Err(e) => log::warn!("[{domain}] {e}; falling back to a full rebuild"),
        }
    } else {
        log::info!("[{domain}] fingerprint changed, rebuilding");
    }

    target.rebuild()?;

    if let Err(e) = target.persist_artifact(fingerprint) {
        log::warn!("[{domain}] could not store artifact, cache not updated: {e}");
        return Ok(CacheOutcome::Rebuilt);
    }
    target.store_fingerprint(fingerprint)?;
    Ok(CacheOutcome::Rebuilt)
}

fn try_reuse(target: &dyn CacheTarget, fingerprint: &Fingerprint) -> Result<bool> {
    if !target.artifact_exists(fingerprint)? {
        return Ok(false);
    }
    let integrity = |e: Error| match e {
        e @ Error::CacheIntegrity { .. } => e,
        other => Error::CacheIntegrity {
            domain: target.domain().to_string(),
            message: other.to_string(),
        },
    };
    target.restore(fingerprint).map_err(integrity)?;
    target.verify_restored().map_err(integrity)?;
    Ok(true)
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Use caching at all
    pub enabled: bool,
    /// Artifacts kept per domain
    pub keep: usize,
    /// Dependency lockfile, relative to the release
    pub lockfile: String,
    /// Directory produced by the install command
    pub dependency_dir: String,
    /// Fresh install
    pub install_command: String,
    /// Lightweight pass run after a restore
    pub verify_command: String,
    /// Asset build
    pub build_command: String,
    /// Asset build output, relative to the release
    pub build_output: String,
    /// File inside the build output that must exist after a restore
    pub build_marker: Option<String>,
    /// Files whose content affects the build output
    pub asset_sources: Vec<String>,
    /// Install timeout in seconds
    pub install_timeout: u64,
    /// Build timeout in seconds
    pub build_timeout: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep: 3,
            lockfile: "package-lock.json".to_string(),
            dependency_dir: "node_modules".to_string(),
            install_command: "npm ci --no-audit --no-fund".to_string(),
            verify_command: "npm ci --no-audit --no-fund --prefer-offline".to_string(),
            build_command: "npm run build".to_string(),
            build_output: "public/build".to_string(),
            build_marker: Some("manifest.json".to_string()),
            asset_sources: vec![
                "package-lock.json".to_string(),
                "vite.config.*".to_string(),
                "tailwind.config.*".to_string(),
                "postcss.config.*".to_string(),
                "resources/**/*.{js,ts,vue,css,scss}".to_string(),
                "resources/**/*.blade.php".to_string(),
            ],
            install_timeout: 900,
            build_timeout: 900,
        }
    }
}
