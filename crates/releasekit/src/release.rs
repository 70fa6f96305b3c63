//! Releases, activation and rollback.
//!
//! Layout under the deploy path:
//!
//! ```text
//! releases/<YYYYmmddHHMMSS>/   one directory per release
//! current -> releases/<id>     active pointer, swapped with rename(2)
//! shared/                      files and directories linked into every release
//! .stagehand/                  lock, caches
//! ```

use crate::conduit::{Conduit, ExecOptions, HostRef};
use crate::error::{Error, Result};
use crate::service::{Maintenance, ServiceControl};
use crate::shell::{quote, quote_path, validate_relative_path};
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Format of release directory names.
pub const RELEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Timestamp name of a release. Ordering is chronological.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseId(String);

impl ReleaseId {
    /// Parse a directory name, rejecting anything that is not a release id.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().trim_end_matches('/');
        if value.len() != 14 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(value, RELEASE_ID_FORMAT)
            .ok()
            .map(|_| Self(value.to_string()))
    }

    /// Id for a point in time.
    pub fn at(time: NaiveDateTime) -> Self {
        Self(time.format(RELEASE_ID_FORMAT).to_string())
    }

    /// Id for `now`, bumped past `latest` so ids stay strictly increasing.
    pub fn next_after(latest: Option<&Self>, now: NaiveDateTime) -> Self {
        match latest.and_then(Self::timestamp) {
            Some(last) if now <= last => Self::at(last + TimeDelta::seconds(1)),
            _ => Self::at(now),
        }
    }

    /// Id for the current local time.
    pub fn now(latest: Option<&Self>) -> Self {
        Self::next_after(latest, Local::now().naive_local())
    }

    /// Creation time.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, RELEASE_ID_FORMAT).ok()
    }

    /// Directory name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paths under a deploy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployLayout {
    root: String,
}

impl DeployLayout {
    /// Layout rooted at `deploy_path`.
    pub fn new(deploy_path: impl Into<String>) -> Self {
        let root: String = deploy_path.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// The deploy path itself.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Directory holding all releases.
    pub fn releases(&self) -> String {
        format!("{}/releases", self.root)
    }

    /// Directory of one release.
    pub fn release(&self, id: &ReleaseId) -> String {
        format!("{}/releases/{id}", self.root)
    }

    /// The active pointer.
    pub fn current(&self) -> String {
        format!("{}/current", self.root)
    }

    /// Directory shared between releases.
    pub fn shared(&self) -> String {
        format!("{}/shared", self.root)
    }

    /// Path inside the shared directory.
    pub fn shared_path(&self, relative: &str) -> String {
        format!("{}/shared/{relative}", self.root)
    }

    /// Persisted environment file.
    pub fn env_file(&self) -> String {
        self.shared_path(".env")
    }

    /// Default backup directory.
    pub fn backups(&self) -> String {
        self.shared_path("backups")
    }

    /// Bookkeeping directory.
    pub fn internal(&self) -> String {
        format!("{}/.stagehand", self.root)
    }

    /// Deploy lock.
    pub fn lock(&self) -> String {
        format!("{}/.stagehand/deploy.lock", self.root)
    }

    /// Build cache root.
    pub fn cache(&self) -> String {
        format!("{}/.stagehand/cache", self.root)
    }
}

/// Release settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Releases kept after a successful deploy
    pub keep: usize,
    /// Directories linked from `shared/` into each release
    pub shared_dirs: Vec<String>,
    /// Files linked from `shared/` into each release
    pub shared_files: Vec<String>,
    /// Git repository cloned into new releases
    pub repository: Option<String>,
    /// Branch checked out
    pub branch: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            keep: 5,
            shared_dirs: vec!["storage".to_string()],
            shared_files: vec![".env".to_string()],
            repository: None,
            branch: "main".to_string(),
        }
    }
}

/// Releases on a host, newest first, and the active one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSet {
    releases: Vec<ReleaseId>,
    active: Option<ReleaseId>,
}

impl ReleaseSet {
    /// Build a set; order and duplicates in `releases` do not matter.
    pub fn new(mut releases: Vec<ReleaseId>, active: Option<ReleaseId>) -> Self {
        releases.sort_by(|a, b| b.cmp(a));
        releases.dedup();
        let active = active.filter(|a| releases.contains(a));
        Self { releases, active }
    }

    /// Releases, newest first.
    pub fn releases(&self) -> &[ReleaseId] {
        &self.releases
    }

    /// The active release, if `current` points at a known one.
    pub fn active(&self) -> Option<&ReleaseId> {
        self.active.as_ref()
    }

    /// Newest release.
    pub fn latest(&self) -> Option<&ReleaseId> {
        self.releases.first()
    }

    /// Number of releases.
    pub fn len(&self) -> usize {
        self.releases.len()
    }

    /// Whether there are no releases.
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// The release right before the active one.
    pub fn previous(&self) -> Option<&ReleaseId> {
        let active = self.active.as_ref()?;
        let index = self.releases.iter().position(|r| r == active)?;
        self.releases.get(index + 1)
    }

    /// Releases to delete so that `keep` remain. Never includes the active one.
    pub fn prune_candidates(&self, keep: usize) -> Vec<&ReleaseId> {
        self.releases
            .iter()
            .skip(keep.max(1))
            .filter(|r| Some(*r) != self.active.as_ref())
            .collect()
    }

    /// Whether `id` is a known release.
    pub fn contains(&self, id: &ReleaseId) -> bool {
        self.releases.contains(id)
    }
}

/// Inputs deciding whether a rollback may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackPolicy {
    /// The active release failed verification
    pub unhealthy: bool,
    /// Roll back on any deploy failure
    pub auto_rollback: bool,
    /// Requested explicitly by the operator
    pub forced: bool,
}

impl RollbackPolicy {
    /// Whether a rollback is permitted.
    pub fn permits(&self) -> bool {
        self.unhealthy || self.auto_rollback || self.forced
    }
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Fewer than two releases, nothing to roll back to
    NoPreviousRelease,
    /// The policy did not allow a rollback
    NotPermitted,
    /// The active pointer was moved back
    RolledBack {
        /// Release that was active
        from: Option<ReleaseId>,
        /// Release now active
        to: ReleaseId,
        /// Post-rollback verification, `None` when not run
        verified: Option<bool>,
    },
}

/// Manages the releases of one deploy path on one host.
pub struct ReleaseManager<'a> {
    conduit: &'a dyn Conduit,
    host: &'a HostRef,
    layout: DeployLayout,
    services: Option<&'a ServiceControl<'a>>,
    maintenance: Option<&'a Maintenance<'a>>,
}

impl<'a> ReleaseManager<'a> {
    /// Create a manager without service or maintenance control.
    pub fn new(conduit: &'a dyn Conduit, host: &'a HostRef, layout: DeployLayout) -> Self {
        Self {
            conduit,
            host,
            layout,
            services: None,
            maintenance: None,
        }
    }

    /// Pause and restart services around activation.
    #[must_use]
    pub fn with_services(mut self, services: &'a ServiceControl<'a>) -> Self {
        self.services = Some(services);
        self
    }

    /// Use maintenance mode during rollback.
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: &'a Maintenance<'a>) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    /// Paths in use.
    pub fn layout(&self) -> &DeployLayout {
        &self.layout
    }

    /// Releases on the host and the active one.
    pub fn list(&self) -> Result<ReleaseSet> {
        let out = self.conduit.run(
            self.host,
            &format!(
                "ls -1 {} 2>/dev/null || true; echo '--current--'; readlink {} 2>/dev/null || true",
                quote_path(&self.layout.releases()),
                quote_path(&self.layout.current())
            ),
            &ExecOptions::default(),
        )?;
        let (listing, current) = out.split_once("--current--").unwrap_or((out.as_str(), ""));
        let releases = listing.lines().filter_map(ReleaseId::parse).collect();
        let active = current
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(ReleaseId::parse);
        Ok(ReleaseSet::new(releases, active))
    }

    /// Create the release directory and the shared layout.
    pub fn create(&self, id: &ReleaseId) -> Result<String> {
        let path = self.layout.release(id);
        self.conduit.run(
            self.host,
            &format!(
                "mkdir -p {} {}",
                quote_path(&path),
                quote_path(&self.layout.shared())
            ),
            &ExecOptions::default(),
        )?;
        log::info!("created release {id}");
        Ok(path)
    }

    /// Clone `repository` at `branch` into a fresh release.
    pub fn checkout(&self, id: &ReleaseId, repository: &str, branch: &str) -> Result<()> {
        let path = self.layout.release(id);
        self.conduit.run(
            self.host,
            &format!(
                "git clone --quiet --depth 1 --branch {} {} {}",
                quote(branch),
                quote(repository),
                quote_path(&path)
            ),
            &ExecOptions::with_timeout(Duration::from_secs(600)),
        )?;
        Ok(())
    }

    /// Link shared directories and files into a release.
    pub fn link_shared(&self, id: &ReleaseId, dirs: &[String], files: &[String]) -> Result<()> {
        let release = self.layout.release(id);
        let mut steps = Vec::new();
        for dir in dirs {
            validate_relative_path(dir)?;
            let shared = quote_path(&self.layout.shared_path(dir));
            let target = quote_path(&format!("{release}/{dir}"));
            steps.push(format!(
                "mkdir -p {shared} && rm -rf {target} && mkdir -p \"$(dirname {target})\" && ln -sfn {shared} {target}"
            ));
        }
        for file in files {
            validate_relative_path(file)?;
            let shared = quote_path(&self.layout.shared_path(file));
            let target = quote_path(&format!("{release}/{file}"));
            steps.push(format!(
                "mkdir -p \"$(dirname {shared})\" && touch {shared} && rm -rf {target} && mkdir -p \"$(dirname {target})\" && ln -sfn {shared} {target}"
            ));
        }
        if steps.is_empty() {
            return Ok(());
        }
        self.conduit
            .run(self.host, &steps.join(" && "), &ExecOptions::default())?;
        Ok(())
    }

    /// Point `current` at a release in one rename.
    pub fn switch(&self, id: &ReleaseId) -> Result<()> {
        let current = self.layout.current();
        let tmp = format!("{current}.tmp");
        self.conduit.run(
            self.host,
            &format!(
                "[ -d {release} ] && ln -sfn {release} {tmp} && mv -Tf {tmp} {current}",
                release = quote_path(&self.layout.release(id)),
                tmp = quote_path(&tmp),
                current = quote_path(&current),
            ),
            &ExecOptions::default(),
        )?;
        log::info!("current -> {id}");
        Ok(())
    }

    /// Pause workers, swap the pointer, restart services, resume workers.
    pub fn activate(&self, id: &ReleaseId) -> Result<()> {
        if let Some(services) = self.services {
            services.pause_workers()?;
        }
        self.switch(id)?;
        if let Some(services) = self.services {
            services.restart_php_fpm()?;
            services.restart_workers()?;
        }
        Ok(())
    }

    /// Roll back to the release before the active one.
    ///
    /// `verify` runs after the switch and reports whether the rollback target
    /// serves correctly; `None` means it was not checked. A failed check is
    /// returned as [`Error::Rollback`] and nothing further is attempted.
    pub fn rollback<F>(&self, policy: RollbackPolicy, verify: F) -> Result<RollbackOutcome>
    where
        F: FnOnce() -> Option<bool>,
    {
        let set = self.list()?;
        let Some(target) = set.previous().cloned() else {
            log::warn!("no previous release to roll back to");
            return Ok(RollbackOutcome::NoPreviousRelease);
        };
        if !policy.permits() {
            log::info!("rollback not permitted by policy, leaving {} active", set.active().map_or("-", ReleaseId::as_str));
            return Ok(RollbackOutcome::NotPermitted);
        }
        self.revert(set.active().cloned(), target, verify)
    }

    /// Roll back to a specific older release.
    pub fn rollback_to<F>(&self, target: &ReleaseId, verify: F) -> Result<RollbackOutcome>
    where
        F: FnOnce() -> Option<bool>,
    {
        let set = self.list()?;
        if !set.contains(target) {
            return Err(Error::invalid("release", format!("release {target} does not exist")));
        }
        if set.active() == Some(target) {
            return Err(Error::invalid("release", format!("{target} is already active")));
        }
        self.revert(set.active().cloned(), target.clone(), verify)
    }

    fn revert<F>(&self, from: Option<ReleaseId>, to: ReleaseId, verify: F) -> Result<RollbackOutcome>
    where
        F: FnOnce() -> Option<bool>,
    {
        log::warn!(
            "rolling back from {} to {to}",
            from.as_ref().map_or("-", ReleaseId::as_str)
        );

        let current = self.layout.current();
        let down = self.maintenance.is_some_and(|m| {
            m.down(&current).unwrap_or_else(|e| {
                log::warn!("could not enter maintenance mode: {e}");
                false
            })
        });

        self.switch(&to).map_err(|e| Error::Rollback {
            message: format!("could not switch to {to}: {e}"),
        })?;

        if let Some(services) = self.services {
            if let Err(e) = services.restart_php_fpm() {
                log::warn!("PHP-FPM restart failed during rollback: {e}");
            }
            if let Err(e) = services.restart_workers() {
                log::warn!("worker restart failed during rollback: {e}");
            }
        }

        if down
            && let Some(maintenance) = self.maintenance
            && let Err(e) = maintenance.up(&current)
        {
            log::warn!("could not leave maintenance mode: {e}");
        }

        let verified = verify();
        if verified == Some(false) {
            return Err(Error::Rollback {
                message: format!(
                    "rolled back to {to} but it failed verification; manual intervention is required"
                ),
            });
        }
        log::info!("rolled back to {to}");
        Ok(RollbackOutcome::RolledBack { from, to, verified })
    }

    /// Delete old releases, keeping `keep` and always the active one.
    pub fn prune(&self, keep: usize) -> Result<Vec<ReleaseId>> {
        let set = self.list()?;
        let doomed: Vec<ReleaseId> = set.prune_candidates(keep).into_iter().cloned().collect();
        if doomed.is_empty() {
            return Ok(doomed);
        }
        let paths: Vec<String> = doomed
            .iter()
            .map(|id| quote_path(&self.layout.release(id)))
            .collect();
        self.conduit.run(
            self.host,
            &format!("rm -rf -- {}", paths.join(" ")),
            &ExecOptions::with_timeout(Duration::from_secs(300)),
        )?;
        log::info!("pruned {} old release(s)", doomed.len());
        Ok(doomed)
    }

    /// Delete one release. The active release cannot be removed.
    pub fn remove(&self, id: &ReleaseId) -> Result<()> {
        let set = self.list()?;
        if set.active() == Some(id) {
            return Err(Error::invalid("release", format!("{id} is active and cannot be removed")));
        }
        self.conduit.run(
            self.host,
            &format!("rm -rf -- {}", quote_path(&self.layout.release(id))),
            &ExecOptions::with_timeout(Duration::from_secs(300)),
        )?;
        log::info!("removed release {id}");
        Ok(())
    }
}
