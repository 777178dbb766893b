use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use pkgfarm_domain::{PackageDetails, PackageMap};

use crate::store::{atomic_replace, ArtifactStore};

/// The accreting catalog of successfully built packages, served to the
/// sandbox so later builds can consume earlier results.
///
/// Layout under `server/built`:
///
/// ```text
/// catalog/pkg/P      details for one package
/// catalog/pkgs-all   every published package
/// catalog/pkgs       the published name list
/// pkgs/P.zip         the served archives
/// ```
pub struct BuiltCatalog {
    built_dir: PathBuf,
    snapshot_pkgs: BTreeSet<String>,
    published: PackageMap,
}

impl BuiltCatalog {
    /// Open the catalog, seeding the published set from a previous run's
    /// `pkgs-all` when present.
    ///
    /// # Errors
    ///
    /// Returns an error when the layout cannot be created or an existing
    /// `pkgs-all` is unreadable.
    pub fn open(built_dir: &Path, snapshot_pkgs: BTreeSet<String>) -> Result<Self> {
        for dir in [built_dir.join("catalog").join("pkg"), built_dir.join("pkgs")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let pkgs_all = built_dir.join("catalog").join("pkgs-all");
        let published = match fs::read(&pkgs_all) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("malformed built catalog {}", pkgs_all.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => PackageMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", pkgs_all.display()))
            }
        };
        if !published.is_empty() {
            info!(count = published.len(), "seeded built catalog from disk");
        }
        Ok(Self {
            built_dir: built_dir.to_path_buf(),
            snapshot_pkgs,
            published,
        })
    }

    #[must_use]
    pub fn contains(&self, pkg: &str) -> bool {
        self.published.contains_key(pkg)
    }

    /// Publish one successful group: copy each member's zip into the served
    /// tree and rewrite its details to point at it, then atomically rewrite
    /// the catalog indexes. Members the snapshot catalog already serves are
    /// skipped so the built catalog never shadows the installed base.
    ///
    /// # Errors
    ///
    /// Returns an error when a zip cannot be copied or a document cannot be
    /// written.
    pub fn publish_group(
        &mut self,
        members: &[String],
        details: &PackageMap,
        store: &ArtifactStore,
    ) -> Result<()> {
        let mut wrote = false;
        for pkg in members {
            if self.snapshot_pkgs.contains(pkg) {
                debug!(pkg, "snapshot package stays unpublished");
                continue;
            }
            let Some(entry) = details.get(pkg) else {
                continue;
            };
            let served = self.built_dir.join("pkgs").join(format!("{pkg}.zip"));
            fs::copy(store.zip_path(pkg), &served)
                .with_context(|| format!("failed to stage {} for serving", pkg))?;
            let published = PackageDetails {
                checksum: store.zip_checksum(pkg)?,
                source: format!("../pkgs/{pkg}.zip"),
                dependencies: entry.dependencies.clone(),
            };
            atomic_replace(
                &self.built_dir.join("catalog").join("pkg").join(pkg),
                &serde_json::to_vec_pretty(&published)
                    .with_context(|| format!("failed to encode details for {pkg}"))?,
            )?;
            self.published.insert(pkg.clone(), published);
            wrote = true;
        }
        if wrote {
            self.rewrite_indexes()?;
        }
        Ok(())
    }

    fn rewrite_indexes(&self) -> Result<()> {
        let catalog_dir = self.built_dir.join("catalog");
        atomic_replace(
            &catalog_dir.join("pkgs-all"),
            &serde_json::to_vec_pretty(&self.published).context("failed to encode pkgs-all")?,
        )?;
        let names: Vec<&String> = self.published.keys().collect();
        atomic_replace(
            &catalog_dir.join("pkgs"),
            &serde_json::to_vec_pretty(&names).context("failed to encode pkgs")?,
        )?;
        Ok(())
    }
}
