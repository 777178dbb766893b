use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use pkgfarm_domain::plan_builds;

use crate::archive::{archive_catalogs, http_client, reload_archive, ArchivedCatalog};
use crate::config::FarmConfig;
use crate::docs::assemble_docs;
use crate::engine::BuildEngine;
use crate::provision::provision;
use crate::publish::BuiltCatalog;
use crate::server::CatalogServer;
use crate::store::ArtifactStore;
use crate::vm::{Hypervisor, SshTransport, Transport, VboxDriver};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// Packages the planner scheduled this run.
    pub planned: usize,
    pub built: usize,
    pub failed: usize,
    /// Recorded failures that are still current and were not retried.
    pub up_to_date_failures: usize,
    pub docs_assembled: bool,
}

/// One complete farm run: archive, provision, plan, build, assemble docs.
///
/// # Errors
///
/// Returns an error for host-environment failures (unwritable work dir,
/// missing tools, unreachable upstream or VM). Per-package build failures are
/// recorded in the artifact store instead.
pub fn run_farm(config: &FarmConfig) -> Result<RunSummary> {
    config.validate()?;
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("failed to create {}", config.work_dir.display()))?;
    let store = ArtifactStore::open(&config.work_dir)?;
    let _server = CatalogServer::spawn(config.server_dir(), config.server_port)?;
    let client = http_client()?;
    let hypervisor = VboxDriver::new(config)?;
    let transport = SshTransport::new(config)?;
    run_with(config, &store, &hypervisor, &transport, &client)
}

/// The run pipeline over abstract VM control and transport; `run_farm` wires
/// in the real drivers.
///
/// # Errors
///
/// See [`run_farm`].
pub fn run_with(
    config: &FarmConfig,
    store: &ArtifactStore,
    hypervisor: &dyn Hypervisor,
    transport: &dyn Transport,
    client: &reqwest::blocking::Client,
) -> Result<RunSummary> {
    let catalog: ArchivedCatalog = if config.skip_archive {
        reload_archive(config)?
    } else {
        archive_catalogs(config, client)?
    };

    let baseline = provision(config, hypervisor, transport, client)?;

    // The baseline is implicitly built: pin its checksums, drop any stray
    // build artifacts left from before it entered the install.
    for pkg in &baseline {
        if let Some(details) = catalog.details.get(pkg) {
            store.normalize_baseline(pkg, &details.checksum)?;
        }
    }

    let snapshot = store.snapshot(&catalog.details)?;
    let plan = plan_builds(&catalog.details, &baseline, &snapshot);
    info!(
        changed = plan.changed_pkgs.len(),
        need = plan.need_pkgs.len(),
        failed = plan.failed_pkgs.len(),
        items = plan.items.len(),
        "build plan ready"
    );

    let mut summary = RunSummary {
        planned: plan.need_pkgs.len(),
        up_to_date_failures: plan.failed_pkgs.len(),
        ..RunSummary::default()
    };

    if config.skip_build {
        info!("skip_build set; leaving the plan unattempted");
    } else if plan.items.is_empty() {
        info!("everything is up to date");
    } else {
        for pkg in &plan.update_pkgs {
            if !baseline.contains(pkg) {
                store.invalidate(pkg)?;
            }
        }
        let mut publisher = BuiltCatalog::open(&config.built_dir(), catalog.snapshot_pkgs.clone())?;
        let stats = BuildEngine::new(
            config,
            store,
            hypervisor,
            transport,
            &catalog,
            &baseline,
            &mut publisher,
        )
        .run(&plan.items)?;
        summary.built = stats.built;
        summary.failed = stats.failed;
    }

    if config.skip_docs {
        info!("skip_docs set; documentation tree left as is");
    } else {
        summary.docs_assembled = assemble_docs(config, store, hypervisor, transport)?;
    }

    info!(
        planned = summary.planned,
        built = summary.built,
        failed = summary.failed,
        "run complete"
    );
    Ok(summary)
}
