use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use pkgfarm_domain::PlanItem;

use crate::archive::ArchivedCatalog;
use crate::config::FarmConfig;
use crate::publish::BuiltCatalog;
use crate::store::{ArtifactStore, DocsManifest};
use crate::vm::guest::{GuestEnv, PkgScope};
use crate::vm::{Hypervisor, Transport, VmSession};

/// Name of the snapshot every build attempt starts from.
pub const INSTALLED_SNAPSHOT: &str = "installed";

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildStats {
    pub built: usize,
    pub failed: usize,
}

/// Drives the VM through the plan: restore, install, leakage check, doc
/// extraction, artifact pull, record, publish; failing multi-item groups are
/// bisected down to single plan items.
pub struct BuildEngine<'a> {
    config: &'a FarmConfig,
    store: &'a ArtifactStore,
    hypervisor: &'a dyn Hypervisor,
    transport: &'a dyn Transport,
    guest: GuestEnv,
    catalog: &'a ArchivedCatalog,
    installed: &'a BTreeSet<String>,
    publisher: &'a mut BuiltCatalog,
    stats: BuildStats,
}

enum Attempt {
    Success,
    Failure(FailureRecord),
}

struct FailureRecord {
    transcript: String,
    zips: Vec<(String, PathBuf)>,
    docs: Option<DocsManifest>,
    // Holds the pulled artifacts alive until salvage decides their fate.
    _staging: TempDir,
}

impl<'a> BuildEngine<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a FarmConfig,
        store: &'a ArtifactStore,
        hypervisor: &'a dyn Hypervisor,
        transport: &'a dyn Transport,
        catalog: &'a ArchivedCatalog,
        installed: &'a BTreeSet<String>,
        publisher: &'a mut BuiltCatalog,
    ) -> Self {
        Self {
            config,
            store,
            hypervisor,
            transport,
            guest: GuestEnv::new(config),
            catalog,
            installed,
            publisher,
            stats: BuildStats::default(),
        }
    }

    /// Attempt every plan item, in order.
    ///
    /// # Errors
    ///
    /// Returns an error for host-environment failures; build failures are
    /// recorded in the store instead.
    pub fn run(&mut self, items: &[PlanItem]) -> Result<BuildStats> {
        for chunk in chunk_plan(items, self.config.max_build_together) {
            self.attempt_or_bisect(&chunk)?;
        }
        Ok(self.stats)
    }

    fn attempt_or_bisect(&mut self, items: &[PlanItem]) -> Result<()> {
        let members: Vec<String> = items
            .iter()
            .flat_map(|item| item.members().iter().cloned())
            .collect();
        // An oversized multi-item group is split without being attempted
        // whole; a single item is always attempted intact, cycles included.
        if members.len() > self.config.max_build_together && items.len() > 1 {
            let mid = items.len() / 2;
            self.attempt_or_bisect(&items[..mid])?;
            return self.attempt_or_bisect(&items[mid..]);
        }

        info!(group = ?members, "attempting build group");
        match self.attempt_group(&members)? {
            Attempt::Success => {
                self.stats.built += members.len();
                Ok(())
            }
            Attempt::Failure(failure) => {
                if items.len() == 1 {
                    self.record_group_failure(&members, &failure)
                } else {
                    debug!(group = ?members, "group failed; bisecting");
                    let mid = items.len() / 2;
                    self.attempt_or_bisect(&items[..mid])?;
                    self.attempt_or_bisect(&items[mid..])
                }
            }
        }
    }

    /// One full VM round for a group. Only environment problems surface as
    /// errors; everything about the build itself comes back as an
    /// [`Attempt`].
    fn attempt_group(&mut self, members: &[String]) -> Result<Attempt> {
        let session = VmSession::begin(self.hypervisor, INSTALLED_SNAPSHOT)?;
        let result = self.group_body(members);
        match result {
            Ok(attempt) => {
                session.stop()?;
                Ok(attempt)
            }
            Err(err) => {
                // The drop guard powers the VM off.
                drop(session);
                Err(err)
            }
        }
    }

    fn group_body(&mut self, members: &[String]) -> Result<Attempt> {
        let timeout = Duration::from_secs(self.config.timeout);
        let mut transcript = String::new();

        let fail_fast = members.len() == 1;
        let install_cmd = format!(
            "{} && {}",
            self.guest.reset_built_dir_cmd(),
            self.guest.install_cmd(members, fail_fast)
        );
        let install = self.transport.exec(&install_cmd, timeout, None)?;
        transcript.push_str(&install.transcript);
        let ok_install = install.ok();

        let staging = tempfile::tempdir().context("failed to create staging dir")?;

        let mut leak_failure = None;
        if ok_install {
            leak_failure = self.check_leakage(members, timeout, &staging, &mut transcript)?;
        }

        // Archives and the doc manifest are attempted even after a failed
        // install; whatever comes out feeds the dumpster.
        let mut ok_docs = true;
        for pkg in members {
            let archive = self
                .transport
                .exec(&self.guest.create_archive_cmd(pkg), timeout, None)?;
            transcript.push_str(&archive.transcript);
            ok_docs &= archive.ok();
        }
        let manifest_cmd = self
            .guest
            .docs_manifest_cmd(&self.guest.group_docs_path(), members);
        let manifest_run = self.transport.exec(&manifest_cmd, timeout, None)?;
        transcript.push_str(&manifest_run.transcript);
        ok_docs &= manifest_run.ok();

        let mut zips = Vec::new();
        for pkg in members {
            let local = staging.path().join(format!("{pkg}.zip"));
            if self
                .transport
                .pull(&self.guest.zip_path(pkg), &local, true)?
            {
                zips.push((pkg.clone(), local));
            }
        }
        let docs_local = staging.path().join("docs.json");
        let docs: Option<DocsManifest> = if self
            .transport
            .pull(&self.guest.group_docs_path(), &docs_local, true)?
        {
            match std::fs::read(&docs_local)
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
            {
                Some(manifest) => Some(manifest),
                None => {
                    transcript.push_str("\nmalformed documentation manifest\n");
                    None
                }
            }
        } else {
            None
        };

        if let Some(leak) = leak_failure {
            transcript.push_str(&leak);
            return Ok(Attempt::Failure(FailureRecord {
                transcript,
                zips,
                docs,
                _staging: staging,
            }));
        }

        let complete = ok_install && ok_docs && zips.len() == members.len() && docs.is_some();
        if !complete {
            return Ok(Attempt::Failure(FailureRecord {
                transcript,
                zips,
                docs,
                _staging: staging,
            }));
        }

        let docs = docs.unwrap_or_default();
        self.commit_group(members, &zips, &docs)?;
        Ok(Attempt::Success)
    }

    /// Compare the guest's user-scope package set against what the group was
    /// allowed to pull in. Returns the failure text, if any.
    fn check_leakage(
        &self,
        members: &[String],
        timeout: Duration,
        staging: &TempDir,
        transcript: &mut String,
    ) -> Result<Option<String>> {
        let list_cmd = self
            .guest
            .list_pkgs_cmd(PkgScope::User, &self.guest.user_pkgs_path());
        let listing = self.transport.exec(&list_cmd, timeout, None)?;
        transcript.push_str(&listing.transcript);
        if !listing.ok() {
            return Ok(Some("\nfailed to enumerate user-scope packages\n".to_string()));
        }
        let local = staging.path().join("user-pkgs.json");
        if !self
            .transport
            .pull(&self.guest.user_pkgs_path(), &local, true)?
        {
            return Ok(Some("\nuser-scope package listing missing\n".to_string()));
        }
        let raw =
            std::fs::read(&local).with_context(|| format!("failed to read {}", local.display()))?;
        let user_pkgs: Vec<String> =
            serde_json::from_slice(&raw).context("malformed user-scope package listing")?;

        let leaks: Vec<&String> = user_pkgs
            .iter()
            .filter(|pkg| {
                !members.contains(pkg)
                    && !self.installed.contains(*pkg)
                    && !self.publisher.contains(pkg)
            })
            .collect();
        if leaks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "\nuse of package not previously built: {}\n",
                leaks
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    fn commit_group(
        &mut self,
        members: &[String],
        zips: &[(String, PathBuf)],
        docs: &DocsManifest,
    ) -> Result<()> {
        for (pkg, local) in zips {
            let checksum = self.store.install_archive(pkg, local)?;
            let mut manifest = DocsManifest::new();
            manifest.insert(pkg.clone(), docs.get(pkg).cloned().unwrap_or_default());
            self.store.write_docs_manifest(pkg, &manifest)?;
            if let Some(entry) = self.catalog.details.get(pkg) {
                self.store.set_orig_checksum(pkg, &entry.checksum)?;
            }
            self.store.record_success(
                pkg,
                &format!(
                    "built {pkg} ({checksum}) at {}\n",
                    time::OffsetDateTime::now_utc()
                ),
            )?;
            info!(pkg, "build succeeded");
        }
        self.publisher
            .publish_group(members, &self.catalog.details, self.store)?;
        Ok(())
    }

    /// Record a failed single plan item: the first member owns the
    /// transcript, the rest of a mutual set get a copy; every member's
    /// source checksum is pinned so the failure stays recognized as current.
    fn record_group_failure(&mut self, members: &[String], failure: &FailureRecord) -> Result<()> {
        warn!(group = ?members, "build failed");
        for pkg in members {
            self.store.record_failure(pkg, &failure.transcript)?;
            if let Some(entry) = self.catalog.details.get(pkg) {
                self.store.set_orig_checksum(pkg, &entry.checksum)?;
            }
        }
        for (pkg, local) in &failure.zips {
            self.store.salvage_zip(pkg, local);
        }
        if let Some(docs) = &failure.docs {
            for pkg in members {
                let mut manifest = DocsManifest::new();
                manifest.insert(pkg.clone(), docs.get(pkg).cloned().unwrap_or_default());
                self.store.salvage_docs(pkg, &manifest);
            }
        }
        self.stats.failed += members.len();
        Ok(())
    }
}

/// Pack consecutive plan items into attempt groups of at most `max` members.
/// A cycle larger than `max` still travels as one group; it is never split.
fn chunk_plan(items: &[PlanItem], max: usize) -> Vec<Vec<PlanItem>> {
    let mut chunks = Vec::new();
    let mut current: Vec<PlanItem> = Vec::new();
    let mut count = 0usize;
    for item in items {
        let size = item.members().len();
        if !current.is_empty() && count + size > max {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(item.clone());
        count += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
