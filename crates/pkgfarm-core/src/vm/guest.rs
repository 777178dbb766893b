//! Guest-side command lines. Everything the engine runs inside the sandbox
//! is assembled here, so the in-VM protocol has a single seam.

use crate::config::FarmConfig;

/// Quote one word for the guest's `/bin/sh`.
#[must_use]
pub fn sh_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Package scope inside the guest runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgScope {
    /// Packages shipped by the installer.
    Installation,
    /// Packages added by build attempts.
    User,
}

impl PkgScope {
    fn symbol(self) -> &'static str {
        match self {
            PkgScope::Installation => "installation",
            PkgScope::User => "user",
        }
    }
}

/// Paths and command builders for one configured guest.
#[derive(Debug, Clone)]
pub struct GuestEnv {
    vm_dir: String,
    server_port: u16,
}

impl GuestEnv {
    #[must_use]
    pub fn new(config: &FarmConfig) -> Self {
        Self {
            vm_dir: config.vm_dir.trim_end_matches('/').to_string(),
            server_port: config.server_port,
        }
    }

    fn raco(&self) -> String {
        format!("{}/racket/bin/raco", self.vm_dir)
    }

    fn racket(&self) -> String {
        format!("{}/racket/bin/racket", self.vm_dir)
    }

    #[must_use]
    pub fn racket_dir(&self) -> String {
        format!("{}/racket", self.vm_dir)
    }

    /// Guest directory that build outputs are staged in.
    #[must_use]
    pub fn built_dir(&self) -> String {
        format!("{}/built", self.vm_dir)
    }

    #[must_use]
    pub fn installer_path(&self) -> String {
        format!("{}/installer.sh", self.vm_dir)
    }

    #[must_use]
    pub fn helper_path(&self) -> String {
        format!("{}/docs-manifest.rkt", self.vm_dir)
    }

    #[must_use]
    pub fn install_list_path(&self) -> String {
        format!("{}/install-list.json", self.vm_dir)
    }

    #[must_use]
    pub fn user_pkgs_path(&self) -> String {
        format!("{}/user-pkgs.json", self.vm_dir)
    }

    #[must_use]
    pub fn group_docs_path(&self) -> String {
        format!("{}/built/docs.json", self.vm_dir)
    }

    #[must_use]
    pub fn doc_tarball_path(&self) -> String {
        format!("{}/doc-tree.tgz", self.vm_dir)
    }

    #[must_use]
    pub fn zip_path(&self, pkg: &str) -> String {
        format!("{}/built/{pkg}.zip", self.vm_dir)
    }

    /// The two catalogs a build resolves against, already-built packages
    /// first. Both reach the host through the reverse tunnel.
    fn catalog_args(&self) -> String {
        format!(
            "--catalog http://localhost:{0}/built/catalog/ --catalog http://localhost:{0}/archive/catalog/",
            self.server_port
        )
    }

    #[must_use]
    pub fn reset_built_dir_cmd(&self) -> String {
        let built = sh_quote(&self.built_dir());
        format!("rm -rf {built} && mkdir -p {built}")
    }

    /// Run the pushed installer into `racket/` under the guest work dir.
    #[must_use]
    pub fn run_installer_cmd(&self) -> String {
        format!(
            "cd {} && sh {} --in-place --dest {}",
            sh_quote(&self.vm_dir),
            sh_quote(&self.installer_path()),
            sh_quote(&self.racket_dir())
        )
    }

    /// Install a group. Single packages get fail-fast so a package listed
    /// alone must install cleanly on its own; groups run in the permissive
    /// mode that continues past individual errors.
    #[must_use]
    pub fn install_cmd(&self, pkgs: &[String], fail_fast: bool) -> String {
        let mut cmd = format!(
            "cd {} && {} pkg install --batch --auto --scope user {}",
            sh_quote(&self.vm_dir),
            sh_quote(&self.raco()),
            self.catalog_args()
        );
        if fail_fast {
            cmd.push_str(" --fail-fast");
        }
        for pkg in pkgs {
            cmd.push(' ');
            cmd.push_str(&sh_quote(pkg));
        }
        cmd
    }

    /// Write the sorted package names of one scope as JSON to `dest`.
    #[must_use]
    pub fn list_pkgs_cmd(&self, scope: PkgScope, dest: &str) -> String {
        let expr = format!(
            "(require pkg/lib json) \
             (call-with-output-file* \"{dest}\" #:exists 'replace \
               (lambda (out) (write-json (sort (installed-pkg-names #:scope '{scope}) string<?) out)))",
            scope = scope.symbol(),
        );
        format!("{} -e {}", sh_quote(&self.racket()), sh_quote(&expr))
    }

    /// Create `built/P.zip` from the installed copy of `pkg`.
    #[must_use]
    pub fn create_archive_cmd(&self, pkg: &str) -> String {
        format!(
            "cd {} && {} pkg create --from-install --dest {} {}",
            sh_quote(&self.vm_dir),
            sh_quote(&self.raco()),
            sh_quote(&self.built_dir()),
            sh_quote(pkg)
        )
    }

    /// Produce the group documentation manifest via the pushed helper.
    #[must_use]
    pub fn docs_manifest_cmd(&self, dest: &str, pkgs: &[String]) -> String {
        let mut cmd = format!(
            "{} {} {}",
            sh_quote(&self.racket()),
            sh_quote(&self.helper_path()),
            sh_quote(dest)
        );
        for pkg in pkgs {
            cmd.push(' ');
            cmd.push_str(&sh_quote(pkg));
        }
        cmd
    }

    /// Tar the rendered user documentation tree to `doc-tree.tgz`.
    #[must_use]
    pub fn tar_doc_tree_cmd(&self) -> String {
        format!(
            "tar -czf {} -C \"$({} -e '(require setup/dirs) (display (find-user-doc-dir))')\" .",
            sh_quote(&self.doc_tarball_path()),
            self.racket()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest() -> GuestEnv {
        let config = FarmConfig {
            vm_dir: "/home/builder/build/".to_string(),
            server_port: 18333,
            snapshot_url: "http://example.invalid".to_string(),
            ..FarmConfig::default()
        };
        GuestEnv::new(&config)
    }

    #[test]
    fn quoting_passes_plain_words_through() {
        assert_eq!(sh_quote("abc-123_ok./x"), "abc-123_ok./x");
    }

    #[test]
    fn quoting_wraps_and_escapes() {
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("two words"), "'two words'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote("$(boom)"), "'$(boom)'");
    }

    #[test]
    fn vm_dir_trailing_slash_is_normalized() {
        assert_eq!(guest().built_dir(), "/home/builder/build/built");
    }

    #[test]
    fn single_install_is_fail_fast_and_group_is_not() {
        let guest = guest();
        let single = guest.install_cmd(&["alone".to_string()], true);
        assert!(single.contains("--fail-fast"));
        assert!(single.ends_with(" alone"));
        let group = guest.install_cmd(&["a".to_string(), "b".to_string()], false);
        assert!(!group.contains("--fail-fast"));
        assert!(group.ends_with(" a b"));
    }

    #[test]
    fn install_resolves_built_catalog_before_archive() {
        let cmd = guest().install_cmd(&["a".to_string()], true);
        let built = cmd.find("/built/catalog").expect("built catalog");
        let archive = cmd.find("/archive/catalog").expect("archive catalog");
        assert!(built < archive);
        assert!(cmd.contains("http://localhost:18333"));
    }

    #[test]
    fn list_pkgs_targets_the_requested_scope() {
        let guest = guest();
        let cmd = guest.list_pkgs_cmd(PkgScope::Installation, "/tmp/out.json");
        assert!(cmd.contains("'installation"));
        let cmd = guest.list_pkgs_cmd(PkgScope::User, "/tmp/out.json");
        assert!(cmd.contains("'user"));
        assert!(cmd.starts_with("/home/builder/build/racket/bin/racket -e "));
    }

    #[test]
    fn archive_and_docs_commands_name_the_staging_dir() {
        let guest = guest();
        let archive = guest.create_archive_cmd("pkg-a");
        assert!(archive.contains("pkg create --from-install"));
        assert!(archive.contains("/home/builder/build/built"));
        let docs = guest.docs_manifest_cmd(&guest.group_docs_path(), &["pkg-a".to_string()]);
        assert!(docs.ends_with(" pkg-a"));
        assert!(docs.contains("docs-manifest.rkt"));
    }
}
