//! Cache domains stored on the target host.
//!
//! Layout under `{deploy_path}/shared/cache`:
//!
//! ```text
//! dependencies.hash                          current lockfile fingerprint
//! dependencies/node_modules-<fp>.tar.gz      installed dependency archives
//! assets.hash                                current asset source fingerprint
//! assets/assets-<fp>/                        copies of the build output
//! ```

use super::{CacheConfig, CacheOutcome, CacheTarget, FileSet, Fingerprint, ScanRoot, ensure, fingerprint, parse_hash_lines};
use crate::conduit::{Conduit, ExecOptions, HostRef};
use crate::error::{Error, Result};
use crate::shell::{quote, quote_path};
use std::time::Duration;

const DEPENDENCIES: &str = "dependencies";
const ASSETS: &str = "assets";

/// Fingerprints and artifacts of one cache domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    /// Domain name
    pub domain: String,
    /// Fingerprint of the inspected release
    pub current: Option<Fingerprint>,
    /// Fingerprint recorded by the last rebuild
    pub stored: Option<Fingerprint>,
    /// Artifact names, newest first
    pub artifacts: Vec<String>,
}

impl DomainStatus {
    /// Whether the next deploy of the same sources would reuse the cache.
    pub fn is_match(&self) -> bool {
        self.current.is_some() && self.current == self.stored
    }
}

/// Status of every cache domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    /// Dependency cache
    pub dependencies: DomainStatus,
    /// Asset cache
    pub assets: DomainStatus,
}

/// Remote cache bound to one release directory.
pub struct RemoteCache<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    release_path: String,
    cache_root: String,
    config: &'a CacheConfig,
}

impl<'a> RemoteCache<'a> {
    /// Bind the cache to a release directory.
    pub fn new(
        conduit: &'a dyn Conduit,
        host: &'a HostRef,
        release_path: impl Into<String>,
        cache_root: impl Into<String>,
        config: &'a CacheConfig,
    ) -> Self {
        Self {
            conduit,
            host,
            release_path: release_path.into(),
            cache_root: cache_root.into(),
            config,
        }
    }

    fn run(&self, script: &str) -> Result<String> {
        self.conduit.run(self.host, script, &ExecOptions::default())
    }

    fn run_for(&self, script: &str, timeout_secs: u64) -> Result<String> {
        self.conduit.run(
            self.host,
            script,
            &ExecOptions::with_timeout(Duration::from_secs(timeout_secs)),
        )
    }

    fn in_release(&self, command: &str) -> String {
        format!("cd {} && {command}", quote_path(&self.release_path))
    }

    fn release_file(&self, relative: &str) -> String {
        quote_path(&format!("{}/{relative}", self.release_path))
    }

    fn domain_dir(&self, domain: &str) -> String {
        format!("{}/{domain}", self.cache_root)
    }

    fn hash_file(&self, domain: &str) -> String {
        format!("{}/{domain}.hash", self.cache_root)
    }

    fn read_fingerprint(&self, domain: &str) -> Result<Option<Fingerprint>> {
        let out = self.run(&format!(
            "cat {} 2>/dev/null || true",
            quote_path(&self.hash_file(domain))
        ))?;
        Ok(Fingerprint::from_stored(&out))
    }

    fn write_fingerprint(&self, domain: &str, fp: &Fingerprint) -> Result<()> {
        let file = quote_path(&self.hash_file(domain));
        self.run(&format!(
            "printf '%s\\n' {} > {file}.tmp && mv -f {file}.tmp {file}",
            quote(fp.as_str())
        ))?;
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        self.run(&format!(
            "mkdir -p {} {}",
            quote_path(&self.domain_dir(DEPENDENCIES)),
            quote_path(&self.domain_dir(ASSETS))
        ))?;
        Ok(())
    }

    fn prune(&self, domain: &str, pattern: &str) -> Result<()> {
        let keep = self.config.keep.max(1);
        self.run(&format!(
            "cd {} && ls -1dt {pattern} 2>/dev/null | tail -n +{} | xargs -r rm -rf --",
            quote_path(&self.domain_dir(domain)),
            keep + 1
        ))?;
        Ok(())
    }

    fn artifacts(&self, domain: &str, pattern: &str) -> Result<Vec<String>> {
        let out = self.run(&format!(
            "cd {} 2>/dev/null && ls -1dt {pattern} 2>/dev/null || true",
            quote_path(&self.domain_dir(domain))
        ))?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Fingerprint of the dependency lockfile, `None` when it is missing.
    pub fn lockfile_fingerprint(&self) -> Result<Option<Fingerprint>> {
        let lockfile = quote(&self.config.lockfile);
        let out = self.run(&self.in_release(&format!(
            "if [ -f {lockfile} ]; then sha256sum {lockfile}; fi"
        )))?;
        let entries = parse_hash_lines(&out);
        Ok((!entries.is_empty()).then(|| fingerprint(&entries)))
    }

    /// Fingerprint of the asset sources, `None` when no source file exists.
    pub fn asset_fingerprint(&self) -> Result<Option<Fingerprint>> {
        let set = FileSet::new(&self.config.asset_sources)?;
        let scans: Vec<String> = set
            .roots()
            .into_iter()
            .map(|root| match root {
                ScanRoot::TopLevel => "find . -maxdepth 1 -type f -exec sha256sum {} +".to_string(),
                ScanRoot::Path(path) => {
                    let path = quote(&path);
                    format!("if [ -e {path} ]; then find {path} -type f -exec sha256sum {{}} +; fi")
                }
                ScanRoot::Tree => "find . -type f -not -path './node_modules/*' -not -path './vendor/*' -not -path './.git/*' -exec sha256sum {} +".to_string(),
            })
            .collect();
        let out = self.run(&self.in_release(&format!("{{ {}; }}", scans.join("; "))))?;
        let entries = set.filter(parse_hash_lines(&out));
        log::debug!("asset fingerprint covers {} file(s)", entries.len());
        Ok((!entries.is_empty()).then(|| fingerprint(&entries)))
    }

    /// Install dependencies, reusing the archived install when the lockfile
    /// is unchanged.
    pub fn install_dependencies(&self) -> Result<CacheOutcome> {
        if !self.config.enabled {
            self.run_for(&self.in_release(&self.config.install_command), self.config.install_timeout)?;
            return Ok(CacheOutcome::Rebuilt);
        }
        let Some(fp) = self.lockfile_fingerprint()? else {
            log::warn!("no {} found, running a plain install", self.config.lockfile);
            self.run_for(&self.in_release(&self.config.install_command), self.config.install_timeout)?;
            return Ok(CacheOutcome::Rebuilt);
        };
        self.prepare()?;
        ensure(&DependencyCache { cache: self }, &fp)
    }

    /// Build assets, copying the cached output when the sources are unchanged.
    pub fn build_assets(&self) -> Result<CacheOutcome> {
        if !self.config.enabled {
            self.run_for(&self.in_release(&self.config.build_command), self.config.build_timeout)?;
            return Ok(CacheOutcome::Rebuilt);
        }
        let Some(fp) = self.asset_fingerprint()? else {
            log::warn!("no asset sources matched, running a plain build");
            self.run_for(&self.in_release(&self.config.build_command), self.config.build_timeout)?;
            return Ok(CacheOutcome::Rebuilt);
        };
        self.prepare()?;
        ensure(&AssetCache { cache: self }, &fp)
    }

    /// Current vs stored fingerprints and the artifacts on disk.
    pub fn status(&self) -> Result<CacheStatus> {
        Ok(CacheStatus {
            dependencies: DomainStatus {
                domain: DEPENDENCIES.to_string(),
                current: self.lockfile_fingerprint()?,
                stored: self.read_fingerprint(DEPENDENCIES)?,
                artifacts: self.artifacts(DEPENDENCIES, "node_modules-*.tar.gz")?,
            },
            assets: DomainStatus {
                domain: ASSETS.to_string(),
                current: self.asset_fingerprint()?,
                stored: self.read_fingerprint(ASSETS)?,
                artifacts: self.artifacts(ASSETS, "assets-*")?,
            },
        })
    }

    /// Remove every artifact and fingerprint.
    pub fn clear(&self) -> Result<()> {
        self.run(&format!(
            "rm -rf {} {} && rm -f {} {}",
            quote_path(&self.domain_dir(DEPENDENCIES)),
            quote_path(&self.domain_dir(ASSETS)),
            quote_path(&self.hash_file(DEPENDENCIES)),
            quote_path(&self.hash_file(ASSETS)),
        ))?;
        log::info!("cache cleared at {}", self.cache_root);
        Ok(())
    }
}

/// Installed dependencies archived per lockfile fingerprint.
pub struct DependencyCache<'c, 'a> {
    cache: &'c RemoteCache<'a>,
}

impl DependencyCache<'_, '_> {
    fn archive(&self, fp: &Fingerprint) -> String {
        format!(
            "{}/node_modules-{}.tar.gz",
            self.cache.domain_dir(DEPENDENCIES),
            fp.as_str()
        )
    }
}

impl CacheTarget for DependencyCache<'_, '_> {
    fn domain(&self) -> &str {
        DEPENDENCIES
    }

    fn stored_fingerprint(&self) -> Result<Option<Fingerprint>> {
        self.cache.read_fingerprint(DEPENDENCIES)
    }

    fn artifact_exists(&self, fp: &Fingerprint) -> Result<bool> {
        self.cache
            .conduit
            .test(self.cache.host, &format!("[ -s {} ]", quote_path(&self.archive(fp))))
    }

    fn restore(&self, fp: &Fingerprint) -> Result<()> {
        let release = quote_path(&self.cache.release_path);
        self.cache.run_for(
            &format!(
                "rm -rf {} && tar -xzf {} -C {release}",
                self.cache.release_file(&self.cache.config.dependency_dir),
                quote_path(&self.archive(fp))
            ),
            self.cache.config.install_timeout,
        )?;
        Ok(())
    }

    fn verify_restored(&self) -> Result<()> {
        self.cache
            .run_for(
                &self.cache.in_release(&self.cache.config.verify_command),
                self.cache.config.install_timeout,
            )
            .map_err(|e| Error::CacheIntegrity {
                domain: DEPENDENCIES.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn rebuild(&self) -> Result<()> {
        self.cache.run_for(
            &self.cache.in_release(&self.cache.config.install_command),
            self.cache.config.install_timeout,
        )?;
        Ok(())
    }

    fn persist_artifact(&self, fp: &Fingerprint) -> Result<()> {
        let archive = quote_path(&self.archive(fp));
        self.cache.run_for(
            &format!(
                "tar -czf {archive}.tmp -C {} {} && mv -f {archive}.tmp {archive}",
                quote_path(&self.cache.release_path),
                quote(&self.cache.config.dependency_dir)
            ),
            self.cache.config.install_timeout,
        )?;
        self.cache.prune(DEPENDENCIES, "node_modules-*.tar.gz")
    }

    fn store_fingerprint(&self, fp: &Fingerprint) -> Result<()> {
        self.cache.write_fingerprint(DEPENDENCIES, fp)
    }
}

/// Build output copied per source fingerprint.
pub struct AssetCache<'c, 'a> {
    cache: &'c RemoteCache<'a>,
}

impl AssetCache<'_, '_> {
    fn artifact(&self, fp: &Fingerprint) -> String {
        format!("{}/assets-{}", self.cache.domain_dir(ASSETS), fp.as_str())
    }

    fn output(&self) -> String {
        self.cache.release_file(&self.cache.config.build_output)
    }
}

impl CacheTarget for AssetCache<'_, '_> {
    fn domain(&self) -> &str {
        ASSETS
    }

    fn stored_fingerprint(&self) -> Result<Option<Fingerprint>> {
        self.cache.read_fingerprint(ASSETS)
    }

    fn artifact_exists(&self, fp: &Fingerprint) -> Result<bool> {
        self.cache
            .conduit
            .test(self.cache.host, &format!("[ -d {} ]", quote_path(&self.artifact(fp))))
    }

    fn restore(&self, fp: &Fingerprint) -> Result<()> {
        let output = self.output();
        self.cache.run(&format!(
            "rm -rf {output} && mkdir -p {output} && cp -a {}/. {output}/",
            quote_path(&self.artifact(fp))
        ))?;
        Ok(())
    }

    fn verify_restored(&self) -> Result<()> {
        let Some(marker) = &self.cache.config.build_marker else {
            return Ok(());
        };
        let path = self
            .cache
            .release_file(&format!("{}/{marker}", self.cache.config.build_output));
        if self.cache.conduit.test(self.cache.host, &format!("[ -s {path} ]"))? {
            Ok(())
        } else {
            Err(Error::CacheIntegrity {
                domain: ASSETS.to_string(),
                message: format!("{marker} missing from restored build output"),
            })
        }
    }

    fn rebuild(&self) -> Result<()> {
        self.cache.run_for(
            &self.cache.in_release(&self.cache.config.build_command),
            self.cache.config.build_timeout,
        )?;
        Ok(())
    }

    fn persist_artifact(&self, fp: &Fingerprint) -> Result<()> {
        let artifact = quote_path(&self.artifact(fp));
        let output = self.output();
        self.cache.run(&format!(
            "[ -d {output} ] && rm -rf {artifact}.tmp && cp -a {output} {artifact}.tmp && rm -rf {artifact} && mv {artifact}.tmp {artifact}"
        ))?;
        self.cache.prune(ASSETS, "assets-*")
    }

    fn store_fingerprint(&self, fp: &Fingerprint) -> Result<()> {
        self.cache.write_fingerprint(ASSETS, fp)
    }
}
