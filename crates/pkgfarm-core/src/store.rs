use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use pkgfarm_domain::{PackageMap, StoreSnapshot};

/// Documentation manifest: package name to the doc names it renders.
pub type DocsManifest = BTreeMap<String, Vec<String>>;

/// File-backed record of every build outcome, laid out under the work dir:
///
/// ```text
/// pkgs/P.orig-CHECKSUM   source checksum the current state corresponds to
/// pkgs/P.zip             built archive
/// pkgs/P.zip.CHECKSUM    content hash of the archive
/// success/P              most recent attempt succeeded
/// fail/P                 most recent attempt failed; contents are the transcript
/// docs/P-docs.json       documentation manifest
/// dumpster/              best-effort salvage from failed group builds
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and lay out) the store under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error when a store directory cannot be created.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            store.pkgs_dir(),
            store.success_dir(),
            store.fail_dir(),
            store.docs_dir(),
            store.dumpster_dir().join("pkgs"),
            store.dumpster_dir().join("docs"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pkgs_dir(&self) -> PathBuf {
        self.root.join("pkgs")
    }

    fn success_dir(&self) -> PathBuf {
        self.root.join("success")
    }

    fn fail_dir(&self) -> PathBuf {
        self.root.join("fail")
    }

    fn docs_dir(&self) -> PathBuf {
        self.root.join("docs")
    }

    fn dumpster_dir(&self) -> PathBuf {
        self.root.join("dumpster")
    }

    #[must_use]
    pub fn zip_path(&self, pkg: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{pkg}.zip"))
    }

    #[must_use]
    pub fn zip_checksum_path(&self, pkg: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{pkg}.zip.CHECKSUM"))
    }

    fn orig_checksum_path(&self, pkg: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{pkg}.orig-CHECKSUM"))
    }

    fn success_path(&self, pkg: &str) -> PathBuf {
        self.success_dir().join(pkg)
    }

    #[must_use]
    pub fn fail_path(&self, pkg: &str) -> PathBuf {
        self.fail_dir().join(pkg)
    }

    #[must_use]
    pub fn docs_path(&self, pkg: &str) -> PathBuf {
        self.docs_dir().join(format!("{pkg}-docs.json"))
    }

    /// # Errors
    ///
    /// Returns an error on unreadable (as opposed to missing) files.
    pub fn orig_checksum(&self, pkg: &str) -> Result<Option<String>> {
        read_optional(&self.orig_checksum_path(pkg))
    }

    /// # Errors
    ///
    /// Returns an error when the checksum cannot be written.
    pub fn set_orig_checksum(&self, pkg: &str, checksum: &str) -> Result<()> {
        atomic_replace(&self.orig_checksum_path(pkg), checksum.as_bytes())
    }

    #[must_use]
    pub fn has_failure(&self, pkg: &str) -> bool {
        self.fail_path(pkg).exists()
    }

    #[must_use]
    pub fn has_archive(&self, pkg: &str) -> bool {
        self.zip_path(pkg).exists() && self.zip_checksum_path(pkg).exists()
    }

    /// Read the content hash of the built archive.
    ///
    /// # Errors
    ///
    /// Returns an error when the checksum file is missing or unreadable.
    pub fn zip_checksum(&self, pkg: &str) -> Result<String> {
        let path = self.zip_checksum_path(pkg);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(raw.trim().to_string())
    }

    /// Install a freshly pulled archive: move the zip into place and record
    /// its content hash.
    ///
    /// # Errors
    ///
    /// Returns an error when the zip cannot be moved or hashed.
    pub fn install_archive(&self, pkg: &str, zip: &Path) -> Result<String> {
        let dest = self.zip_path(pkg);
        replace_with_file(zip, &dest)?;
        let checksum = sha256_file(&dest)?;
        atomic_replace(&self.zip_checksum_path(pkg), checksum.as_bytes())?;
        Ok(checksum)
    }

    /// # Errors
    ///
    /// Returns an error when the manifest cannot be written.
    pub fn write_docs_manifest(&self, pkg: &str, manifest: &DocsManifest) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(manifest)
            .with_context(|| format!("failed to encode docs manifest for {pkg}"))?;
        atomic_replace(&self.docs_path(pkg), &encoded)
    }

    /// # Errors
    ///
    /// Returns an error on unreadable or malformed manifests; a missing
    /// manifest reads as `None`.
    pub fn read_docs_manifest(&self, pkg: &str) -> Result<Option<DocsManifest>> {
        let path = self.docs_path(pkg);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let manifest = serde_json::from_slice(&raw)
            .with_context(|| format!("malformed docs manifest {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Record a successful build; drops any stale failure transcript.
    ///
    /// # Errors
    ///
    /// Returns an error when the marker cannot be written.
    pub fn record_success(&self, pkg: &str, note: &str) -> Result<()> {
        atomic_replace(&self.success_path(pkg), note.as_bytes())?;
        remove_if_present(&self.fail_path(pkg))
    }

    /// Record a failed build with its transcript; drops any stale success
    /// marker.
    ///
    /// # Errors
    ///
    /// Returns an error when the transcript cannot be written.
    pub fn record_failure(&self, pkg: &str, transcript: &str) -> Result<()> {
        atomic_replace(&self.fail_path(pkg), transcript.as_bytes())?;
        remove_if_present(&self.success_path(pkg))
    }

    /// Remove everything a rebuild of `pkg` will re-establish, so a crash
    /// mid-attempt cannot leave a zip whose recorded source checksum
    /// disagrees with the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error when a present file cannot be removed.
    pub fn invalidate(&self, pkg: &str) -> Result<()> {
        debug!(pkg, "invalidating stored artifacts");
        for path in [
            self.zip_path(pkg),
            self.zip_checksum_path(pkg),
            self.orig_checksum_path(pkg),
            self.success_path(pkg),
        ] {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    /// Bring a baseline package's entries in line: the baseline is implicitly
    /// built, so only its source checksum is retained.
    ///
    /// # Errors
    ///
    /// Returns an error when a file cannot be written or removed.
    pub fn normalize_baseline(&self, pkg: &str, checksum: &str) -> Result<()> {
        if self.orig_checksum(pkg)?.as_deref() != Some(checksum) {
            self.set_orig_checksum(pkg, checksum)?;
        }
        for path in [
            self.zip_path(pkg),
            self.zip_checksum_path(pkg),
            self.success_path(pkg),
            self.fail_path(pkg),
        ] {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    /// Best-effort copy of a failed build's outputs into the dumpster.
    pub fn salvage_zip(&self, pkg: &str, zip: &Path) {
        let dest = self.dumpster_dir().join("pkgs").join(format!("{pkg}.zip"));
        if let Err(err) = fs::copy(zip, &dest) {
            debug!(pkg, error = %err, "dumpster zip salvage skipped");
        }
    }

    /// Best-effort copy of a failed build's doc manifest into the dumpster.
    pub fn salvage_docs(&self, pkg: &str, manifest: &DocsManifest) {
        let dest = self
            .dumpster_dir()
            .join("docs")
            .join(format!("{pkg}-docs.json"));
        match serde_json::to_vec_pretty(manifest) {
            Ok(encoded) => {
                if let Err(err) = fs::write(&dest, encoded) {
                    debug!(pkg, error = %err, "dumpster docs salvage skipped");
                }
            }
            Err(err) => debug!(pkg, error = %err, "dumpster docs salvage skipped"),
        }
    }

    /// Collect the read-only view the planner consumes.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be enumerated.
    pub fn snapshot(&self, details: &PackageMap) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::default();
        for pkg in details.keys() {
            if let Some(checksum) = self.orig_checksum(pkg)? {
                snapshot.orig_checksums.insert(pkg.clone(), checksum);
            }
            if self.has_failure(pkg) {
                snapshot.failed.insert(pkg.clone());
            }
            if self.has_archive(pkg) {
                snapshot.archived.insert(pkg.clone());
            }
        }
        Ok(snapshot)
    }

    /// Packages whose stored doc manifest declares non-empty docs for the
    /// package itself.
    ///
    /// # Errors
    ///
    /// Returns an error when the docs directory cannot be listed.
    pub fn documented_packages(&self) -> Result<Vec<String>> {
        let mut documented = Vec::new();
        let dir = self.docs_dir();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            let name = entry.file_name();
            let Some(pkg) = name
                .to_str()
                .and_then(|name| name.strip_suffix("-docs.json"))
            else {
                continue;
            };
            match self.read_docs_manifest(pkg) {
                Ok(Some(manifest)) => {
                    if manifest.get(pkg).is_some_and(|docs| !docs.is_empty()) {
                        documented.push(pkg.to_string());
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(pkg, error = %err, "skipping unreadable docs manifest"),
            }
        }
        documented.sort();
        Ok(documented)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Write `contents` to `path` through a temp file in the same directory, so
/// readers only ever observe a complete file.
///
/// # Errors
///
/// Returns an error when the temp file cannot be created or persisted.
pub fn atomic_replace(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage temp file in {}", parent.display()))?;
    fs::write(tmp.path(), contents)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Move `src` over `dest`, falling back to copy across devices.
fn replace_with_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            fs::copy(src, dest)
                .map(|_| ())
                .with_context(|| format!("failed to copy {} into place", src.display()))?;
            let _ = fs::remove_file(src);
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to move {} into place", src.display()))
        }
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(18))
}

/// SHA-256 of a file's contents, hex encoded.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgfarm_domain::PackageDetails;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open store");
        (dir, store)
    }

    #[test]
    fn orig_checksum_round_trips() {
        let (_dir, store) = store();
        assert_eq!(store.orig_checksum("a").expect("read"), None);
        store.set_orig_checksum("a", "h1").expect("write");
        assert_eq!(store.orig_checksum("a").expect("read").as_deref(), Some("h1"));
    }

    #[test]
    fn success_and_failure_are_mutually_exclusive() {
        let (_dir, store) = store();
        store.record_failure("a", "boom").expect("fail");
        assert!(store.has_failure("a"));
        store.record_success("a", "built").expect("success");
        assert!(!store.has_failure("a"));
        assert!(store.success_path("a").exists());
        store.record_failure("a", "boom again").expect("fail");
        assert!(!store.success_path("a").exists());
        let transcript = fs::read_to_string(store.fail_path("a")).expect("read");
        assert_eq!(transcript, "boom again");
    }

    #[test]
    fn install_archive_writes_a_matching_checksum() {
        let (dir, store) = store();
        let staged = dir.path().join("staged.zip");
        fs::write(&staged, b"zip bytes").expect("stage");
        let checksum = store.install_archive("a", &staged).expect("install");
        assert!(store.has_archive("a"));
        assert_eq!(checksum, sha256_file(&store.zip_path("a")).expect("hash"));
        assert_eq!(store.zip_checksum("a").expect("read"), checksum);
    }

    #[test]
    fn invalidate_clears_everything_but_the_failure() {
        let (dir, store) = store();
        let staged = dir.path().join("staged.zip");
        fs::write(&staged, b"zip").expect("stage");
        store.install_archive("a", &staged).expect("install");
        store.set_orig_checksum("a", "h1").expect("orig");
        store.record_success("a", "ok").expect("success");
        store.invalidate("a").expect("invalidate");
        assert!(!store.has_archive("a"));
        assert_eq!(store.orig_checksum("a").expect("read"), None);
        assert!(!store.success_path("a").exists());
    }

    #[test]
    fn normalize_baseline_strips_build_artifacts() {
        let (dir, store) = store();
        let staged = dir.path().join("staged.zip");
        fs::write(&staged, b"zip").expect("stage");
        store.install_archive("base", &staged).expect("install");
        store.record_failure("base", "old noise").expect("fail");
        store.normalize_baseline("base", "h0").expect("normalize");
        assert_eq!(
            store.orig_checksum("base").expect("read").as_deref(),
            Some("h0")
        );
        assert!(!store.has_archive("base"));
        assert!(!store.has_failure("base"));
    }

    #[test]
    fn snapshot_reflects_disk_state() {
        let (dir, store) = store();
        let details: PackageMap = [
            ("a".to_string(), PackageDetails::default()),
            ("b".to_string(), PackageDetails::default()),
            ("c".to_string(), PackageDetails::default()),
        ]
        .into_iter()
        .collect();
        store.set_orig_checksum("a", "h1").expect("orig");
        let staged = dir.path().join("staged.zip");
        fs::write(&staged, b"zip").expect("stage");
        store.install_archive("a", &staged).expect("install");
        store.record_failure("b", "boom").expect("fail");

        let snapshot = store.snapshot(&details).expect("snapshot");
        assert_eq!(snapshot.orig_checksums.get("a").map(String::as_str), Some("h1"));
        assert!(snapshot.archived.contains("a"));
        assert!(snapshot.failed.contains("b"));
        assert!(!snapshot.failed.contains("c"));
    }

    #[test]
    fn documented_packages_require_docs_for_self() {
        let (_dir, store) = store();
        let mut with_docs = DocsManifest::new();
        with_docs.insert("a".to_string(), vec!["a-manual".to_string()]);
        store.write_docs_manifest("a", &with_docs).expect("write");

        let mut empty = DocsManifest::new();
        empty.insert("b".to_string(), Vec::new());
        store.write_docs_manifest("b", &empty).expect("write");

        let mut other_only = DocsManifest::new();
        other_only.insert("a".to_string(), vec!["a-manual".to_string()]);
        store.write_docs_manifest("c", &other_only).expect("write");

        assert_eq!(store.documented_packages().expect("list"), vec!["a"]);
    }
}
