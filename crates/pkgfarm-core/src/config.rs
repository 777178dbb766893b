use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// The full configuration surface of a farm run, loadable from a TOML file.
/// Every field has a default except `snapshot_url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FarmConfig {
    /// Root of all host-side state.
    pub work_dir: PathBuf,
    /// Base URL of the installer table and the snapshot catalog.
    pub snapshot_url: String,
    /// Key into `installers/table.json`.
    pub installer_platform_name: String,
    /// Extra catalog URLs unioned over the snapshot catalog.
    pub pkg_catalogs: Vec<String>,

    pub vm_name: String,
    pub vm_host: String,
    pub vm_user: String,
    /// Guest-side working directory.
    pub vm_dir: String,
    /// Pristine snapshot restored before provisioning.
    pub vm_init_snapshot: String,

    pub skip_install: bool,
    pub skip_archive: bool,
    pub skip_build: bool,
    pub skip_docs: bool,

    /// Per-remote-command timeout in seconds.
    pub timeout: u64,
    /// Upper bound on attempt-group size before forced bisection.
    pub max_build_together: usize,
    /// Loopback port the catalog server binds.
    pub server_port: u16,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("build-farm"),
            snapshot_url: String::new(),
            installer_platform_name: "linux64".to_string(),
            pkg_catalogs: Vec::new(),
            vm_name: "pkgfarm".to_string(),
            vm_host: "localhost".to_string(),
            vm_user: "builder".to_string(),
            vm_dir: "/home/builder/build".to_string(),
            vm_init_snapshot: "init".to_string(),
            skip_install: false,
            skip_archive: false,
            skip_build: false,
            skip_docs: false,
            timeout: 600,
            max_build_together: 1,
            server_port: 18333,
        }
    }
}

impl FarmConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, is not valid TOML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml_edit::de::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error for an empty `snapshot_url`, a zero timeout, a zero
    /// group bound, or a zero server port.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_url.is_empty() {
            bail!("config: snapshot_url must be set");
        }
        if self.timeout == 0 {
            bail!("config: timeout must be at least one second");
        }
        if self.max_build_together == 0 {
            bail!("config: max_build_together must be at least 1");
        }
        if self.server_port == 0 {
            bail!("config: server_port must be a fixed port");
        }
        Ok(())
    }

    /// Subtree served by the catalog HTTP server.
    #[must_use]
    pub fn server_dir(&self) -> PathBuf {
        self.work_dir.join("server")
    }

    /// Mirror of the upstream catalogs and their source archives.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.server_dir().join("archive")
    }

    /// The accreting built catalog and its zips.
    #[must_use]
    pub fn built_dir(&self) -> PathBuf {
        self.server_dir().join("built")
    }

    /// Cached baseline package listing.
    #[must_use]
    pub fn install_list_path(&self) -> PathBuf {
        self.work_dir.join("install-list.json")
    }

    /// Baseline documentation manifest captured at provisioning time.
    #[must_use]
    pub fn install_docs_path(&self) -> PathBuf {
        self.work_dir.join("install-docs.json")
    }

    /// Where the combined documentation tree is unpacked.
    #[must_use]
    pub fn doc_tree_dir(&self) -> PathBuf {
        self.work_dir.join("doc-tree")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: FarmConfig =
            toml_edit::de::from_str("snapshot_url = \"http://example.invalid/snap\"")
                .expect("parse");
        assert_eq!(config.installer_platform_name, "linux64");
        assert_eq!(config.timeout, 600);
        assert_eq!(config.max_build_together, 1);
        config.validate().expect("valid");
    }

    #[test]
    fn missing_snapshot_url_is_rejected() {
        let config = FarmConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<FarmConfig, _> =
            toml_edit::de::from_str("snapshot_url = \"x\"\nspeed = 11");
        assert!(parsed.is_err());
    }

    #[test]
    fn load_round_trips_a_full_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("farm.toml");
        fs::write(
            &path,
            r#"
work_dir = "/tmp/farm"
snapshot_url = "http://example.invalid/snap"
installer_platform_name = "linux64"
pkg_catalogs = ["http://example.invalid/extra"]
vm_name = "builder-vm"
timeout = 30
max_build_together = 4
server_port = 9999
"#,
        )
        .expect("write");
        let config = FarmConfig::load(&path).expect("load");
        assert_eq!(config.vm_name, "builder-vm");
        assert_eq!(config.pkg_catalogs.len(), 1);
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.server_dir(), PathBuf::from("/tmp/farm/server"));
    }
}
