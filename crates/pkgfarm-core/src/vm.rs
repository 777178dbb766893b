use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::FarmConfig;
use crate::process::{run_command, run_streaming_with_timeout};
use crate::store::atomic_replace;

pub mod guest;

const VBOX_MANAGE: &str = "VBoxManage";

/// Outcome of one remote command. Failure and timeout are values, not
/// errors: the engine branches on the tag, only environment problems (an
/// unlaunchable transport) propagate as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub transcript: String,
}

impl ExecOutcome {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to launch `{program}`: {detail}")]
    Launch { program: String, detail: String },
    #[error("transfer {direction} `{path}` failed: {detail}")]
    Transfer {
        direction: &'static str,
        path: String,
        detail: String,
    },
}

/// Command execution and file transfer into the sandbox.
pub trait Transport {
    /// Run a shell command in the guest, streaming output to the console and
    /// the returned transcript. On a non-success outcome the transcript is
    /// also written atomically to `capture_dest` when one is given.
    ///
    /// # Errors
    ///
    /// Returns an error only for host-environment problems; command failure
    /// and timeout are reported in the outcome.
    fn exec(
        &self,
        command: &str,
        timeout: Duration,
        capture_dest: Option<&Path>,
    ) -> Result<ExecOutcome>;

    /// # Errors
    ///
    /// Returns an error when the transfer fails.
    fn push(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Fetch a guest file. With `may_fail` a missing remote file is reported
    /// as `Ok(false)` instead of an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the transfer fails and `may_fail` is unset.
    fn pull(&self, remote: &str, local: &Path, may_fail: bool) -> Result<bool, TransportError>;
}

/// SSH/SCP transport with a reverse tunnel for the catalog server. When the
/// configured host is loopback and no user is set, commands run locally
/// through `sh -c` instead; callers cannot tell the difference.
pub struct SshTransport {
    host: String,
    user: String,
    tunnel_port: u16,
    local: bool,
}

impl SshTransport {
    /// # Errors
    ///
    /// Returns an error when `ssh`/`scp` are required but not on PATH.
    pub fn new(config: &FarmConfig) -> Result<Self> {
        let local = is_loopback(&config.vm_host) && config.vm_user.is_empty();
        if !local {
            for tool in ["ssh", "scp"] {
                which::which(tool)
                    .with_context(|| format!("host precondition: `{tool}` not found on PATH"))?;
            }
        }
        Ok(Self {
            host: config.vm_host.clone(),
            user: config.vm_user.clone(),
            tunnel_port: config.server_port,
            local,
        })
    }

    fn target(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        vec!["-o".to_string(), "BatchMode=yes".to_string(), from, to]
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

impl Transport for SshTransport {
    fn exec(
        &self,
        command: &str,
        timeout: Duration,
        capture_dest: Option<&Path>,
    ) -> Result<ExecOutcome> {
        let (program, args) = if self.local {
            (
                "/bin/sh".to_string(),
                vec!["-c".to_string(), command.to_string()],
            )
        } else {
            (
                "ssh".to_string(),
                vec![
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-R".to_string(),
                    format!("{0}:localhost:{0}", self.tunnel_port),
                    self.target(),
                    command.to_string(),
                ],
            )
        };
        debug!(%program, command, "guest exec");
        let run = run_streaming_with_timeout(&program, &args, timeout)?;
        let status = if run.timed_out {
            ExecStatus::TimedOut
        } else if run.code == Some(0) {
            ExecStatus::Success
        } else {
            ExecStatus::Failed
        };
        match capture_dest {
            Some(dest) if status != ExecStatus::Success => {
                atomic_replace(dest, run.transcript.as_bytes())?;
            }
            _ => {}
        }
        Ok(ExecOutcome {
            status,
            transcript: run.transcript,
        })
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if self.local {
            copy_local(local, Path::new(remote)).map_err(|err| TransportError::Transfer {
                direction: "to guest",
                path: remote.to_string(),
                detail: err.to_string(),
            })?;
            return Ok(());
        }
        let args = self.scp_args(
            local.display().to_string(),
            format!("{}:{remote}", self.target()),
        );
        let output = run_command("scp", &args).map_err(|err| TransportError::Launch {
            program: "scp".to_string(),
            detail: err.to_string(),
        })?;
        if output.code != 0 {
            return Err(TransportError::Transfer {
                direction: "to guest",
                path: remote.to_string(),
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn pull(&self, remote: &str, local: &Path, may_fail: bool) -> Result<bool, TransportError> {
        if self.local {
            return match copy_local(Path::new(remote), local) {
                Ok(()) => Ok(true),
                Err(_) if may_fail => Ok(false),
                Err(err) => Err(TransportError::Transfer {
                    direction: "from guest",
                    path: remote.to_string(),
                    detail: err.to_string(),
                }),
            };
        }
        let args = self.scp_args(
            format!("{}:{remote}", self.target()),
            local.display().to_string(),
        );
        let output = run_command("scp", &args).map_err(|err| TransportError::Launch {
            program: "scp".to_string(),
            detail: err.to_string(),
        })?;
        if output.code != 0 {
            if may_fail {
                debug!(remote, "optional pull skipped");
                return Ok(false);
            }
            return Err(TransportError::Transfer {
                direction: "from guest",
                path: remote.to_string(),
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(true)
    }
}

fn copy_local(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(from, to)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))
}

/// Snapshot and power management for the sandbox VM.
pub trait Hypervisor {
    /// # Errors
    ///
    /// All methods return an error when the management tool reports one.
    fn snapshot_restore(&self, name: &str) -> Result<()>;
    /// # Errors
    /// See [`Hypervisor::snapshot_restore`].
    fn snapshot_take(&self, name: &str) -> Result<()>;
    /// # Errors
    /// See [`Hypervisor::snapshot_restore`].
    fn snapshot_delete(&self, name: &str) -> Result<()>;
    /// # Errors
    /// See [`Hypervisor::snapshot_restore`].
    fn snapshot_exists(&self, name: &str) -> Result<bool>;
    /// # Errors
    /// See [`Hypervisor::snapshot_restore`].
    fn start(&self) -> Result<()>;
    /// # Errors
    /// See [`Hypervisor::snapshot_restore`].
    fn stop(&self, save_state: bool) -> Result<()>;
}

/// Driver over the VirtualBox management executable.
pub struct VboxDriver {
    tool: PathBuf,
    vm: String,
}

impl VboxDriver {
    /// # Errors
    ///
    /// Returns an error when the management tool is not on PATH.
    pub fn new(config: &FarmConfig) -> Result<Self> {
        let tool = which::which(VBOX_MANAGE)
            .with_context(|| format!("host precondition: `{VBOX_MANAGE}` not found on PATH"))?;
        Ok(Self {
            tool,
            vm: config.vm_name.clone(),
        })
    }

    fn manage(&self, args: &[String]) -> Result<String> {
        let output = run_command(&self.tool.to_string_lossy(), args)?;
        if output.code != 0 {
            bail!(
                "{VBOX_MANAGE} {} failed (exit {}): {}",
                args.join(" "),
                output.code,
                output.stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}

impl Hypervisor for VboxDriver {
    fn snapshot_restore(&self, name: &str) -> Result<()> {
        info!(vm = self.vm, snapshot = name, "restoring snapshot");
        self.manage(&to_args(&["snapshot", &self.vm, "restore", name]))?;
        Ok(())
    }

    fn snapshot_take(&self, name: &str) -> Result<()> {
        info!(vm = self.vm, snapshot = name, "taking snapshot");
        self.manage(&to_args(&["snapshot", &self.vm, "take", name]))?;
        Ok(())
    }

    fn snapshot_delete(&self, name: &str) -> Result<()> {
        info!(vm = self.vm, snapshot = name, "deleting snapshot");
        self.manage(&to_args(&["snapshot", &self.vm, "delete", name]))?;
        Ok(())
    }

    fn snapshot_exists(&self, name: &str) -> Result<bool> {
        let args = to_args(&["snapshot", &self.vm, "list", "--machinereadable"]);
        let output = run_command(&self.tool.to_string_lossy(), &args)?;
        // A VM without snapshots reports failure; that simply means "no".
        if output.code != 0 {
            return Ok(false);
        }
        Ok(listing_names_snapshot(&output.stdout, name))
    }

    fn start(&self) -> Result<()> {
        info!(vm = self.vm, "starting vm");
        self.manage(&to_args(&["startvm", &self.vm, "--type", "headless"]))?;
        Ok(())
    }

    fn stop(&self, save_state: bool) -> Result<()> {
        let action = if save_state { "savestate" } else { "poweroff" };
        info!(vm = self.vm, action, "stopping vm");
        self.manage(&to_args(&["controlvm", &self.vm, action]))?;
        Ok(())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Match a snapshot name in `--machinereadable` listing output.
fn listing_names_snapshot(listing: &str, name: &str) -> bool {
    let needle = format!("=\"{name}\"");
    listing
        .lines()
        .any(|line| line.starts_with("SnapshotName") && line.ends_with(needle.as_str()))
}

/// Scoped VM acquisition: restores a snapshot and boots; the VM is powered
/// off (state discarded) on every exit path, including unwinds.
pub struct VmSession<'a> {
    hypervisor: &'a dyn Hypervisor,
    active: bool,
}

impl<'a> VmSession<'a> {
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be restored or the VM will
    /// not start.
    pub fn begin(hypervisor: &'a dyn Hypervisor, snapshot: &str) -> Result<Self> {
        hypervisor.snapshot_restore(snapshot)?;
        hypervisor.start()?;
        Ok(Self {
            hypervisor,
            active: true,
        })
    }

    /// Stop the VM, reporting the error the drop guard would swallow.
    ///
    /// # Errors
    ///
    /// Returns an error when the VM cannot be stopped.
    pub fn stop(mut self) -> Result<()> {
        self.active = false;
        self.hypervisor.stop(false)
    }
}

impl Drop for VmSession<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.hypervisor.stop(false) {
                warn!(error = %err, "failed to stop vm during cleanup");
            }
        }
    }
}

/// Scripted hypervisor and transport doubles shared by the engine,
/// provisioner, and run-driver tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use anyhow::Result;

    use super::{ExecOutcome, ExecStatus, Hypervisor, Transport, TransportError};

    pub(crate) fn outcome(status: ExecStatus, transcript: &str) -> ExecOutcome {
        ExecOutcome {
            status,
            transcript: transcript.to_string(),
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeHypervisor {
        pub(crate) calls: RefCell<Vec<String>>,
    }

    impl Hypervisor for FakeHypervisor {
        fn snapshot_restore(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("restore {name}"));
            Ok(())
        }
        fn snapshot_take(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("take {name}"));
            Ok(())
        }
        fn snapshot_delete(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("delete {name}"));
            Ok(())
        }
        fn snapshot_exists(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        fn start(&self) -> Result<()> {
            self.calls.borrow_mut().push("start".to_string());
            Ok(())
        }
        fn stop(&self, save_state: bool) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("stop save={save_state}"));
            Ok(())
        }
    }

    /// Scripted transport: `exec` is answered by a closure over the command
    /// text, `pull` serves from a remote-path map.
    pub(crate) struct FakeTransport {
        exec_fn: Box<dyn Fn(&str) -> ExecOutcome>,
        pub(crate) remote_files: RefCell<HashMap<String, Vec<u8>>>,
        pub(crate) execs: RefCell<Vec<String>>,
    }

    impl FakeTransport {
        pub(crate) fn new(exec_fn: impl Fn(&str) -> ExecOutcome + 'static) -> Self {
            Self {
                exec_fn: Box::new(exec_fn),
                remote_files: RefCell::new(HashMap::new()),
                execs: RefCell::new(Vec::new()),
            }
        }

        pub(crate) fn stage(&self, remote: &str, contents: &[u8]) {
            self.remote_files
                .borrow_mut()
                .insert(remote.to_string(), contents.to_vec());
        }
    }

    impl Transport for FakeTransport {
        fn exec(
            &self,
            command: &str,
            _timeout: Duration,
            _capture_dest: Option<&Path>,
        ) -> Result<ExecOutcome> {
            self.execs.borrow_mut().push(command.to_string());
            Ok((self.exec_fn)(command))
        }

        fn push(&self, _local: &Path, _remote: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn pull(&self, remote: &str, local: &Path, may_fail: bool) -> Result<bool, TransportError> {
            match self.remote_files.borrow().get(remote) {
                Some(contents) => {
                    fs::write(local, contents).expect("write pulled file");
                    Ok(true)
                }
                None if may_fail => Ok(false),
                None => Err(TransportError::Transfer {
                    direction: "from guest",
                    path: remote.to_string(),
                    detail: "missing".to_string(),
                }),
            }
        }
    }
}
