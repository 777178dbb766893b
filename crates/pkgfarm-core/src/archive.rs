use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use url::Url;

use pkgfarm_domain::{PackageDetails, PackageMap};

use crate::config::FarmConfig;
use crate::store::atomic_replace;

/// Everything the planner and the publisher need to know about upstream.
#[derive(Debug, Clone, Default)]
pub struct ArchivedCatalog {
    /// Union of all catalogs; `source` rewritten to the mirrored zip.
    pub details: PackageMap,
    /// Names served by the snapshot catalog (the installed base); these are
    /// never published to the built catalog.
    pub snapshot_pkgs: BTreeSet<String>,
}

impl ArchivedCatalog {
    #[must_use]
    pub fn all_pkgs(&self) -> BTreeSet<String> {
        self.details.keys().cloned().collect()
    }
}

/// A shared blocking HTTP client for catalog and installer downloads.
///
/// # Errors
///
/// Returns an error when the client cannot be constructed.
pub fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("failed to construct http client")
}

/// Append `path` to `base`, tolerating a missing trailing slash on `base`.
///
/// # Errors
///
/// Returns an error for an unparseable base URL.
pub fn join_url(base: &str, path: &str) -> Result<Url> {
    let normalized = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let base = Url::parse(&normalized).with_context(|| format!("invalid url {base}"))?;
    base.join(path)
        .with_context(|| format!("cannot join {path} onto {base}"))
}

/// Mirror the snapshot catalog plus every configured extra catalog into
/// `work_dir/server/archive`, returning the merged view.
///
/// Per-package download problems drop the package from the current run; they
/// never abort archiving.
///
/// # Errors
///
/// Returns an error when a catalog index cannot be fetched or the mirror
/// cannot be written.
pub fn archive_catalogs(
    config: &FarmConfig,
    client: &reqwest::blocking::Client,
) -> Result<ArchivedCatalog> {
    let snapshot_catalog = join_url(&config.snapshot_url, "catalog/")?;
    let snapshot = fetch_catalog(client, &snapshot_catalog)?;
    let snapshot_pkgs: BTreeSet<String> = snapshot.keys().cloned().collect();
    info!(count = snapshot.len(), url = %snapshot_catalog, "fetched snapshot catalog");

    let mut extras = Vec::new();
    for raw in &config.pkg_catalogs {
        let url = join_url(raw, "")?;
        let catalog = fetch_catalog(client, &url)?;
        info!(count = catalog.len(), url = %url, "fetched extra catalog");
        extras.push(catalog);
    }

    let merged = merge_catalogs(snapshot, extras);

    let archive_dir = config.archive_dir();
    let pkgs_dir = archive_dir.join("pkgs");
    fs::create_dir_all(&pkgs_dir)
        .with_context(|| format!("failed to create {}", pkgs_dir.display()))?;

    let mut mirrored = PackageMap::new();
    for (name, mut details) in merged {
        if details.checksum.is_empty() || details.source.is_empty() {
            warn!(pkg = name, "catalog entry lacks checksum or source; skipping");
            continue;
        }
        match mirror_source(client, &pkgs_dir, &name, &details) {
            Ok(()) => {
                details.source = format!("../pkgs/{name}.zip");
                mirrored.insert(name, details);
            }
            Err(err) => {
                warn!(pkg = name, error = %err, "failed to archive package; skipping");
            }
        }
    }

    write_local_catalog(&archive_dir.join("catalog"), &mirrored, &snapshot_pkgs)?;

    Ok(ArchivedCatalog {
        details: mirrored,
        snapshot_pkgs,
    })
}

/// Reload the mirror written by a previous run, for `skip_archive`.
///
/// # Errors
///
/// Returns an error when no usable mirror exists on disk.
pub fn reload_archive(config: &FarmConfig) -> Result<ArchivedCatalog> {
    let catalog_dir = config.archive_dir().join("catalog");
    let details = read_json(&catalog_dir.join("pkgs-all"))?;
    let snapshot_pkgs = read_json(&catalog_dir.join("snapshot-pkgs"))?;
    info!(path = %catalog_dir.display(), "reusing archived catalog");
    Ok(ArchivedCatalog {
        details,
        snapshot_pkgs,
    })
}

/// Union the snapshot catalog with the extras; extras shadow the snapshot and
/// later extras shadow earlier ones.
fn merge_catalogs(snapshot: PackageMap, extras: Vec<PackageMap>) -> PackageMap {
    let mut merged = snapshot;
    for extra in extras {
        for (name, details) in extra {
            merged.insert(name, details);
        }
    }
    merged
}

fn fetch_catalog(client: &reqwest::blocking::Client, base: &Url) -> Result<PackageMap> {
    let url = base
        .join("pkgs-all")
        .with_context(|| format!("cannot join pkgs-all onto {base}"))?;
    let response = client
        .get(url.clone())
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {url}"))?;
    let catalog: PackageMap = response
        .json()
        .with_context(|| format!("malformed catalog at {url}"))?;
    Ok(catalog)
}

/// Download one package's source archive unless the mirrored copy already
/// matches the advertised checksum.
fn mirror_source(
    client: &reqwest::blocking::Client,
    pkgs_dir: &Path,
    name: &str,
    details: &PackageDetails,
) -> Result<()> {
    let zip = pkgs_dir.join(format!("{name}.zip"));
    let marker = pkgs_dir.join(format!("{name}.zip.CHECKSUM"));
    if zip.exists() {
        if let Ok(have) = fs::read_to_string(&marker) {
            if have.trim() == details.checksum {
                debug!(pkg = name, "mirror is current");
                return Ok(());
            }
        }
    }

    let (tmp, observed) = download_hashed(client, &details.source, pkgs_dir)?;
    if observed != details.checksum {
        return Err(anyhow!(
            "checksum mismatch for {name}: catalog advertises {} but source hashes to {observed}",
            details.checksum
        ));
    }
    tmp.persist(&zip)
        .with_context(|| format!("failed to persist {}", zip.display()))?;
    atomic_replace(&marker, details.checksum.as_bytes())?;
    debug!(pkg = name, "mirrored source archive");
    Ok(())
}

fn download_hashed(
    client: &reqwest::blocking::Client,
    source: &str,
    stage_dir: &Path,
) -> Result<(NamedTempFile, String)> {
    let mut response = client
        .get(source)
        .send()
        .with_context(|| format!("failed to fetch {source}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {source}"))?;

    let mut tmp = NamedTempFile::new_in(stage_dir)
        .with_context(|| format!("failed to stage download in {}", stage_dir.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("stream error for {source}"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tmp.write_all(&buffer[..read])
            .context("failed to write staged download")?;
    }
    Ok((tmp, hex::encode(hasher.finalize())))
}

/// Write the catalog documents a sandbox-side client resolves against:
/// `pkgs-all`, `pkgs`, one `pkg/P` per package, and the snapshot name list
/// used to reload the mirror.
fn write_local_catalog(
    catalog_dir: &Path,
    details: &PackageMap,
    snapshot_pkgs: &BTreeSet<String>,
) -> Result<()> {
    fs::create_dir_all(catalog_dir.join("pkg"))
        .with_context(|| format!("failed to create {}", catalog_dir.display()))?;
    atomic_replace(
        &catalog_dir.join("pkgs-all"),
        &serde_json::to_vec_pretty(details).context("failed to encode pkgs-all")?,
    )?;
    let names: Vec<&String> = details.keys().collect();
    atomic_replace(
        &catalog_dir.join("pkgs"),
        &serde_json::to_vec_pretty(&names).context("failed to encode pkgs")?,
    )?;
    atomic_replace(
        &catalog_dir.join("snapshot-pkgs"),
        &serde_json::to_vec_pretty(snapshot_pkgs).context("failed to encode snapshot-pkgs")?,
    )?;
    for (name, entry) in details {
        atomic_replace(
            &catalog_dir.join("pkg").join(name),
            &serde_json::to_vec_pretty(entry)
                .with_context(|| format!("failed to encode details for {name}"))?,
        )?;
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("malformed json in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(checksum: &str) -> PackageDetails {
        PackageDetails {
            checksum: checksum.to_string(),
            source: format!("http://example.invalid/{checksum}.zip"),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn extras_shadow_the_snapshot_catalog() {
        let snapshot: PackageMap = [
            ("a".to_string(), details("snap-a")),
            ("b".to_string(), details("snap-b")),
        ]
        .into_iter()
        .collect();
        let extra: PackageMap = [
            ("b".to_string(), details("extra-b")),
            ("c".to_string(), details("extra-c")),
        ]
        .into_iter()
        .collect();
        let merged = merge_catalogs(snapshot, vec![extra]);
        assert_eq!(merged["a"].checksum, "snap-a");
        assert_eq!(merged["b"].checksum, "extra-b");
        assert_eq!(merged["c"].checksum, "extra-c");
    }

    #[test]
    fn join_url_tolerates_missing_slash() {
        let joined = join_url("http://example.invalid/snap", "catalog/").expect("join");
        assert_eq!(joined.as_str(), "http://example.invalid/snap/catalog/");
        let joined = join_url("http://example.invalid/snap/", "installers/table.json")
            .expect("join");
        assert_eq!(
            joined.as_str(),
            "http://example.invalid/snap/installers/table.json"
        );
    }

    #[test]
    fn local_catalog_round_trips_through_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = FarmConfig {
            work_dir: dir.path().to_path_buf(),
            snapshot_url: "http://example.invalid/snap".to_string(),
            ..FarmConfig::default()
        };
        let map: PackageMap = [
            ("a".to_string(), details("h1")),
            ("b".to_string(), details("h2")),
        ]
        .into_iter()
        .collect();
        let snapshot_pkgs: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        write_local_catalog(&config.archive_dir().join("catalog"), &map, &snapshot_pkgs)
            .expect("write");

        let reloaded = reload_archive(&config).expect("reload");
        assert_eq!(reloaded.details, map);
        assert_eq!(reloaded.snapshot_pkgs, snapshot_pkgs);
        assert_eq!(
            reloaded.all_pkgs(),
            ["a".to_string(), "b".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn reload_without_a_mirror_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = FarmConfig {
            work_dir: dir.path().to_path_buf(),
            snapshot_url: "http://example.invalid/snap".to_string(),
            ..FarmConfig::default()
        };
        assert!(reload_archive(&config).is_err());
    }
}
