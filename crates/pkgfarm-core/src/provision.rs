use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::archive::join_url;
use crate::config::FarmConfig;
use crate::engine::INSTALLED_SNAPSHOT;
use crate::vm::guest::{GuestEnv, PkgScope};
use crate::vm::{Hypervisor, Transport};

/// The guest-side helper that reports declared documentation per package.
const DOCS_HELPER: &str = include_str!("../assets/docs-manifest.rkt");

/// Establish the `installed` snapshot and the baseline package set.
///
/// With `skip_install` the cached baseline from a previous provisioning is
/// reused; the caller vouches that the snapshot and the cache are still
/// current.
///
/// # Errors
///
/// Provisioning failures are host-environment failures and abort the run.
pub fn provision(
    config: &FarmConfig,
    hypervisor: &dyn Hypervisor,
    transport: &dyn Transport,
    client: &reqwest::blocking::Client,
) -> Result<BTreeSet<String>> {
    if config.skip_install {
        return load_cached_baseline(config);
    }

    let installer = fetch_installer(config, client)?;
    let guest = GuestEnv::new(config);
    let timeout = std::time::Duration::from_secs(config.timeout);

    hypervisor.snapshot_restore(&config.vm_init_snapshot)?;
    hypervisor.start()?;
    let body = (|| -> Result<BTreeSet<String>> {
        transport.push(&installer, &guest.installer_path())?;
        let install = transport.exec(&guest.run_installer_cmd(), timeout, None)?;
        if !install.ok() {
            bail!(
                "installer failed in the sandbox:\n{}",
                tail(&install.transcript, 2000)
            );
        }

        let helper = stage_helper()?;
        transport.push(helper.path(), &guest.helper_path())?;

        let listing = transport.exec(
            &guest.list_pkgs_cmd(PkgScope::Installation, &guest.install_list_path()),
            timeout,
            None,
        )?;
        if !listing.ok() {
            bail!(
                "failed to enumerate the pristine install:\n{}",
                tail(&listing.transcript, 2000)
            );
        }
        transport.pull(
            &guest.install_list_path(),
            &config.install_list_path(),
            false,
        )?;
        let baseline = read_baseline(config)?;

        capture_baseline_docs(config, transport, &guest, &baseline, timeout);
        Ok(baseline)
    })();

    match body {
        Ok(baseline) => {
            hypervisor.stop(true)?;
            if hypervisor.snapshot_exists(INSTALLED_SNAPSHOT)? {
                hypervisor.snapshot_delete(INSTALLED_SNAPSHOT)?;
            }
            hypervisor.snapshot_take(INSTALLED_SNAPSHOT)?;
            info!(count = baseline.len(), "provisioned baseline install");
            Ok(baseline)
        }
        Err(err) => {
            let _ = hypervisor.stop(false);
            Err(err)
        }
    }
}

fn load_cached_baseline(config: &FarmConfig) -> Result<BTreeSet<String>> {
    let path = config.install_list_path();
    if !path.exists() {
        bail!(
            "skip_install is set but no cached baseline exists at {}",
            path.display()
        );
    }
    let baseline = read_baseline(config)?;
    info!(
        count = baseline.len(),
        path = %path.display(),
        "reusing cached baseline (caller vouches it matches the snapshot)"
    );
    Ok(baseline)
}

fn read_baseline(config: &FarmConfig) -> Result<BTreeSet<String>> {
    let path = config.install_list_path();
    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let names: Vec<String> = serde_json::from_slice(&raw)
        .with_context(|| format!("malformed baseline listing {}", path.display()))?;
    Ok(names.into_iter().collect())
}

/// Resolve the platform's installer through `installers/table.json` and
/// download it once; the cached copy is keyed by filename.
fn fetch_installer(config: &FarmConfig, client: &reqwest::blocking::Client) -> Result<PathBuf> {
    let table_url = join_url(&config.snapshot_url, "installers/table.json")?;
    let table: BTreeMap<String, String> = client
        .get(table_url.clone())
        .send()
        .with_context(|| format!("failed to fetch {table_url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {table_url}"))?
        .json()
        .with_context(|| format!("malformed installer table at {table_url}"))?;
    let filename = table.get(&config.installer_platform_name).ok_or_else(|| {
        anyhow!(
            "no installer for platform `{}` in {table_url}",
            config.installer_platform_name
        )
    })?;

    let dest_dir = config.work_dir.join("installer");
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;
    let dest = dest_dir.join(filename);
    if dest.exists() {
        info!(installer = filename, "reusing downloaded installer");
        return Ok(dest);
    }

    let url = join_url(&config.snapshot_url, &format!("installers/{filename}"))?;
    info!(%url, "downloading installer");
    let bytes = client
        .get(url.clone())
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {url}"))?
        .bytes()
        .with_context(|| format!("stream error for {url}"))?;
    crate::store::atomic_replace(&dest, &bytes)?;
    Ok(dest)
}

fn stage_helper() -> Result<NamedTempFile> {
    let mut helper = NamedTempFile::new().context("failed to stage docs helper")?;
    helper
        .write_all(DOCS_HELPER.as_bytes())
        .context("failed to write docs helper")?;
    helper.flush().context("failed to flush docs helper")?;
    Ok(helper)
}

/// The baseline doc manifest is informational; problems are logged, not
/// fatal.
fn capture_baseline_docs(
    config: &FarmConfig,
    transport: &dyn Transport,
    guest: &GuestEnv,
    baseline: &BTreeSet<String>,
    timeout: std::time::Duration,
) {
    let pkgs: Vec<String> = baseline.iter().cloned().collect();
    let dest = guest.group_docs_path();
    let prepare = format!("mkdir -p {}", guest.built_dir());
    let command = format!("{prepare} && {}", guest.docs_manifest_cmd(&dest, &pkgs));
    match transport.exec(&command, timeout, None) {
        Ok(outcome) if outcome.ok() => {
            match transport.pull(&dest, &config.install_docs_path(), true) {
                Ok(true) => {}
                Ok(false) => warn!("baseline docs manifest missing in guest"),
                Err(err) => warn!(error = %err, "failed to pull baseline docs manifest"),
            }
        }
        Ok(outcome) => warn!(
            transcript = %tail(&outcome.transcript, 500),
            "baseline docs manifest capture failed"
        ),
        Err(err) => warn!(error = %err, "baseline docs manifest capture failed"),
    }
}

fn tail(text: &str, limit: usize) -> &str {
    let start = text.len().saturating_sub(limit);
    // Back off to a character boundary.
    let mut start = start;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
