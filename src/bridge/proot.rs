//! # proot Bridge
//!
//! Production [`NativeBridge`] implementation over `proot`: user-space
//! chroot plus bind mounts, requiring no privileges from the host. Each
//! session becomes one proot process tree in its own process group.
//!
//! ## Readiness Protocol
//!
//! The host-side runtime directory is bind-mounted into the rootfs at
//! `/.session`. The entry command is wrapped so the guest touches
//! `/.session/ready` immediately before exec'ing the real init:
//!
//! ```text
//! /bin/sh -c ':> /.session/ready; exec <entry>'
//! ```
//!
//! The bridge polls the host-side `ready` file; its appearance proves the
//! guest reached userland with a working rootfs and mounts. No guest
//! cooperation beyond a functional `/bin/sh` is needed.
//!
//! ## Shutdown Protocol
//!
//! SIGTERM to the process group, [`TERMINATE_GRACE_PERIOD`] to exit,
//! then SIGKILL bounded by [`KILL_WAIT_TIMEOUT`]. Signals go to the
//! group, not the leader, so shells with children cannot orphan them.

use super::{
    kill_group, BridgeHandle, ExecOutput, IoChannel, KillSignal, LaunchSpec, NativeBridge,
};
use crate::constants::{
    EXEC_TIMEOUT, KILL_WAIT_TIMEOUT, READY_POLL_INTERVAL, SESSION_READY_TIMEOUT,
    TERMINATE_GRACE_PERIOD,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Base environment for every session, independent of host environment.
const BASE_ENV: &[(&str, &str)] = &[
    ("HOME", "/root"),
    ("USER", "root"),
    ("TERM", "xterm-256color"),
    ("LANG", "C.UTF-8"),
    (
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    ),
];

/// Host paths bind-mounted into every session.
const DEFAULT_BINDS: &[&str] = &["/dev", "/proc", "/sys"];

/// Guest mount point of the per-session runtime directory.
const SESSION_MOUNT: &str = "/.session";

/// Readiness marker file name inside the runtime directory.
const READY_FILE: &str = "ready";

/// Bridge over the `proot` binary.
pub struct ProotBridge {
    proot_path: PathBuf,
    /// Extra `host:guest` binds on top of the defaults.
    extra_binds: Vec<(PathBuf, String)>,
}

impl ProotBridge {
    /// Creates a bridge using `proot` from `PATH`.
    pub fn new() -> Self {
        Self {
            proot_path: PathBuf::from("proot"),
            extra_binds: Vec::new(),
        }
    }

    /// Creates a bridge with an explicit proot binary path.
    pub fn with_binary(proot_path: PathBuf) -> Self {
        Self {
            proot_path,
            extra_binds: Vec::new(),
        }
    }

    /// Adds a host directory bound at a guest path for every session.
    pub fn bind(mut self, host: PathBuf, guest: impl Into<String>) -> Self {
        self.extra_binds.push((host, guest.into()));
        self
    }

    /// Common proot argument prefix for a rootfs: root mapping, rootfs,
    /// default and extra binds.
    fn base_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "-0".to_string(),
            "-r".to_string(),
            spec.rootfs.display().to_string(),
        ];
        for bind in DEFAULT_BINDS {
            args.push("-b".to_string());
            args.push(bind.to_string());
        }
        for (host, guest) in &self.extra_binds {
            args.push("-b".to_string());
            args.push(format!("{}:{guest}", host.display()));
        }
        args.push("-w".to_string());
        args.push(spec.workdir.clone());
        args
    }

    fn apply_env(command: &mut Command, spec: &LaunchSpec) {
        command.env_clear();
        for (key, value) in BASE_ENV {
            command.env(key, value);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
    }

    /// Wraps the entry command so the guest signals readiness before
    /// exec'ing the real init.
    fn wrapped_entry(entry: &[String]) -> Vec<String> {
        let joined = entry
            .iter()
            .map(|part| shell_quote(part))
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(":> {SESSION_MOUNT}/{READY_FILE}; exec {joined}"),
        ]
    }
}

impl Default for ProotBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal POSIX single-quote escaping for command parts passed through
/// `/bin/sh -c`.
fn shell_quote(part: &str) -> String {
    if !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl NativeBridge for ProotBridge {
    async fn initialize(&self, spec: &LaunchSpec) -> Result<BridgeHandle> {
        if spec.entry.is_empty() {
            return Err(Error::Spawn {
                reason: "entry command is empty".to_string(),
            });
        }
        if !spec.rootfs.is_dir() {
            return Err(Error::Spawn {
                reason: format!("rootfs {} does not exist", spec.rootfs.display()),
            });
        }
        std::fs::create_dir_all(&spec.runtime_dir)?;
        // Stale marker from a previous run of this session id.
        let _ = std::fs::remove_file(spec.runtime_dir.join(READY_FILE));

        let mut command = Command::new(&self.proot_path);
        command.args(self.base_args(spec));
        command.arg("-b").arg(format!(
            "{}:{SESSION_MOUNT}",
            spec.runtime_dir.display()
        ));
        command.args(Self::wrapped_entry(&spec.entry));
        Self::apply_env(&mut command, spec);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // Own process group so terminate() can signal the whole tree.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| Error::Spawn {
            reason: format!("failed to spawn proot: {e}"),
        })?;
        let pid = child.id().ok_or_else(|| Error::Spawn {
            reason: "spawned process has no pid".to_string(),
        })? as i32;

        let io = IoChannel {
            stdin: Box::new(child.stdin.take().ok_or_else(|| Error::Spawn {
                reason: "stdin pipe missing".to_string(),
            })?),
            stdout: Box::new(child.stdout.take().ok_or_else(|| Error::Spawn {
                reason: "stdout pipe missing".to_string(),
            })?),
            stderr: Box::new(child.stderr.take().ok_or_else(|| Error::Spawn {
                reason: "stderr pipe missing".to_string(),
            })?),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(pid, error = %e, "wait on session process failed");
                    -1
                }
            };
            debug!(pid, code, "session process exited");
            let _ = exit_tx.send(Some(code));
        });

        info!(pid, rootfs = %spec.rootfs.display(), "session process spawned");
        Ok(BridgeHandle::new(
            pid,
            exit_rx,
            io,
            spec.rootfs.clone(),
            spec.runtime_dir.clone(),
        ))
    }

    async fn wait_ready(&self, handle: &BridgeHandle) -> Result<()> {
        let marker = handle.runtime_dir().join(READY_FILE);
        let deadline = Instant::now() + SESSION_READY_TIMEOUT;
        loop {
            if marker.exists() {
                debug!(pid = handle.pid(), "session ready");
                return Ok(());
            }
            if let Some(code) = handle.exit_code() {
                return Err(Error::UnexpectedExit { code });
            }
            if Instant::now() >= deadline {
                return Err(Error::StartupTimeout {
                    timeout: SESSION_READY_TIMEOUT,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&self, handle: &BridgeHandle) -> Result<i32> {
        if let Some(code) = handle.exit_code() {
            handle.mark_reaped();
            return Ok(code);
        }

        let pid = handle.pid();
        debug!(pid, "sending SIGTERM to session group");
        kill_group(pid, KillSignal::Term);

        if let Ok(code) =
            tokio::time::timeout(TERMINATE_GRACE_PERIOD, handle.wait_exit()).await
        {
            let _ = std::fs::remove_dir_all(handle.runtime_dir());
            return Ok(code);
        }

        warn!(pid, "grace period expired, sending SIGKILL");
        kill_group(pid, KillSignal::Kill);
        match tokio::time::timeout(KILL_WAIT_TIMEOUT, handle.wait_exit()).await {
            Ok(code) => {
                let _ = std::fs::remove_dir_all(handle.runtime_dir());
                Ok(code)
            }
            Err(_) => Err(Error::Internal(format!(
                "session process group {pid} survived SIGKILL"
            ))),
        }
    }

    async fn exec(&self, handle: &BridgeHandle, command_line: &[String]) -> Result<ExecOutput> {
        if command_line.is_empty() {
            return Err(Error::Spawn {
                reason: "exec command is empty".to_string(),
            });
        }

        let spec = LaunchSpec {
            rootfs: handle.rootfs().to_path_buf(),
            entry: Vec::new(),
            workdir: "/root".to_string(),
            env: Vec::new(),
            runtime_dir: handle.runtime_dir().to_path_buf(),
        };
        let mut command = Command::new(&self.proot_path);
        command.args(self.base_args(&spec));
        command.args(command_line);
        Self::apply_env(&mut command, &spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| Error::Spawn {
            reason: format!("failed to spawn exec command: {e}"),
        })?;

        let output = tokio::time::timeout(EXEC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Internal(format!("exec exceeded {EXEC_TIMEOUT:?}")))?
            .map_err(Error::Io)?;

        Ok(ExecOutput {
            exit_code: exit_code_of(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Maps an exit status to a single code: the process code when present,
/// `128 + signal` for signal deaths, `-1` otherwise.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}
