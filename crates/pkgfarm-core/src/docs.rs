use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::config::FarmConfig;
use crate::engine::INSTALLED_SNAPSHOT;
use crate::store::ArtifactStore;
use crate::vm::guest::GuestEnv;
use crate::vm::{Hypervisor, Transport, VmSession};

/// Install every package with docs of its own in one VM session and capture
/// the combined documentation tree into `work_dir/doc-tree/`.
///
/// Returns `false` when there was nothing to assemble or the assembly did
/// not complete; assembly problems are logged, never fatal.
///
/// # Errors
///
/// Returns an error for host-environment failures (VM control, unpacking).
pub fn assemble_docs(
    config: &FarmConfig,
    store: &ArtifactStore,
    hypervisor: &dyn Hypervisor,
    transport: &dyn Transport,
) -> Result<bool> {
    let documented = store.documented_packages()?;
    if documented.is_empty() {
        info!("no documented packages; skipping doc assembly");
        return Ok(false);
    }
    info!(count = documented.len(), "assembling documentation tree");

    let guest = GuestEnv::new(config);
    let timeout = Duration::from_secs(config.timeout);
    let tarball = config.work_dir.join("doc-tree.tgz");

    let session = VmSession::begin(hypervisor, INSTALLED_SNAPSHOT)?;
    let captured = (|| -> Result<bool> {
        let install = transport.exec(&guest.install_cmd(&documented, false), timeout, None)?;
        if !install.ok() {
            warn!("doc assembly install failed; tree not captured");
            return Ok(false);
        }
        let tar = transport.exec(&guest.tar_doc_tree_cmd(), timeout, None)?;
        if !tar.ok() {
            warn!("doc tree tar failed; tree not captured");
            return Ok(false);
        }
        if !transport.pull(&guest.doc_tarball_path(), &tarball, true)? {
            warn!("doc tree tarball missing in guest");
            return Ok(false);
        }
        Ok(true)
    })();

    match captured {
        Ok(true) => {
            session.stop()?;
            unpack_doc_tree(config, &tarball)?;
            Ok(true)
        }
        Ok(false) => {
            session.stop()?;
            Ok(false)
        }
        Err(err) => {
            drop(session);
            Err(err)
        }
    }
}

/// Replace `work_dir/doc-tree/` with the tarball's contents.
fn unpack_doc_tree(config: &FarmConfig, tarball: &std::path::Path) -> Result<()> {
    let tree = config.doc_tree_dir();
    if tree.exists() {
        fs::remove_dir_all(&tree)
            .with_context(|| format!("failed to clear {}", tree.display()))?;
    }
    fs::create_dir_all(&tree).with_context(|| format!("failed to create {}", tree.display()))?;
    let file = fs::File::open(tarball)
        .with_context(|| format!("failed to open {}", tarball.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(&tree)
        .with_context(|| format!("failed to unpack {}", tarball.display()))?;
    info!(tree = %tree.display(), "documentation tree unpacked");
    Ok(())
}
