//! # Native Bridge
//!
//! Supervision layer between the session lifecycle and the host kernel.
//! A bridge turns a prepared rootfs plus a launch spec into a supervised
//! native process tree and exposes exactly four capabilities:
//!
//! - spawn the session's init process ([`NativeBridge::initialize`])
//! - await its readiness signal ([`NativeBridge::wait_ready`])
//! - terminate it with bounded escalation ([`NativeBridge::terminate`])
//! - run one-shot commands inside it ([`NativeBridge::exec`])
//!
//! The trait keeps the lifecycle testable without spawning real
//! processes; [`proot::ProotBridge`] is the production implementation.
//!
//! ## Process Ownership
//!
//! The spawned child is owned by a monitor task, never by the handle.
//! Exit is published through a `watch` channel, so any number of
//! observers (lifecycle monitor, terminate path, tests) can await it
//! without contending for the child itself.

pub mod proot;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::warn;

// =============================================================================
// Launch Spec
// =============================================================================

/// Everything a bridge needs to start one session process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Extracted rootfs to enter.
    pub rootfs: PathBuf,
    /// Init command line, resolved inside the rootfs (e.g. `["/bin/bash"]`).
    pub entry: Vec<String>,
    /// Initial working directory inside the rootfs.
    pub workdir: String,
    /// Additional environment on top of the bridge's base environment.
    pub env: Vec<(String, String)>,
    /// Host-side per-session runtime directory. The bridge uses it for
    /// the readiness marker and removes it on teardown.
    pub runtime_dir: PathBuf,
}

// =============================================================================
// I/O Channel
// =============================================================================

/// The session init process's standard streams.
///
/// Taken at most once per session; a second attach fails at the session
/// layer before it ever reaches the handle.
pub struct IoChannel {
    /// Write side feeding the process's stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read side of the process's stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Read side of the process's stderr.
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoChannel").finish_non_exhaustive()
    }
}

/// Output of a one-shot command run inside a session.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

// =============================================================================
// Bridge Handle
// =============================================================================

/// Live handle to one supervised session process.
///
/// Dropping a handle whose process is still alive force-kills the whole
/// process group; an unsupervised session tree must never outlive its
/// handle.
pub struct BridgeHandle {
    pid: i32,
    exit: watch::Receiver<Option<i32>>,
    io: Mutex<Option<IoChannel>>,
    rootfs: PathBuf,
    runtime_dir: PathBuf,
    reaped: AtomicBool,
}

impl BridgeHandle {
    /// Builds a handle for a spawned process. `exit` must receive
    /// `Some(code)` exactly once, when the process exits.
    pub fn new(
        pid: i32,
        exit: watch::Receiver<Option<i32>>,
        io: IoChannel,
        rootfs: PathBuf,
        runtime_dir: PathBuf,
    ) -> Self {
        Self {
            pid,
            exit,
            io: Mutex::new(Some(io)),
            rootfs,
            runtime_dir,
            reaped: AtomicBool::new(false),
        }
    }

    /// OS pid of the supervised init process (also its group leader).
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Rootfs this session runs in.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Host-side runtime directory for this session.
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Exit code if the process has already exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Subscribes to the exit notification.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Awaits process exit and returns its code.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                self.reaped.store(true, Ordering::SeqCst);
                return code;
            }
            if rx.changed().await.is_err() {
                // Monitor task gone without publishing a code.
                return -1;
            }
        }
    }

    /// Takes the I/O channel, leaving `None` behind.
    pub fn take_io(&self) -> Result<Option<IoChannel>> {
        let mut guard = self
            .io
            .lock()
            .map_err(|_| Error::Internal("io channel lock poisoned".to_string()))?;
        Ok(guard.take())
    }

    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if self.exit_code().is_none() && !self.reaped.load(Ordering::SeqCst) {
            warn!(pid = self.pid, "handle dropped with live process, force killing group");
            kill_group(self.pid, KillSignal::Kill);
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signals the bridge sends to a session's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillSignal {
    /// Graceful shutdown request (SIGTERM).
    Term,
    /// Forced kill (SIGKILL).
    Kill,
}

/// Sends a signal to the whole process group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_group(pid: i32, signal: KillSignal) {
    let sig = match signal {
        KillSignal::Term => libc::SIGTERM,
        KillSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg with a valid signal number; failure (ESRCH on an
    // already-reaped group) is benign here.
    unsafe {
        libc::killpg(pid, sig);
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: i32, _signal: KillSignal) {}

/// Probes whether a process with `pid` is still alive.
#[cfg(unix)]
pub(crate) fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs permission/existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: i32) -> bool {
    false
}

// =============================================================================
// Bridge Trait
// =============================================================================

/// Supervision interface between the session lifecycle and the host.
#[async_trait]
pub trait NativeBridge: Send + Sync {
    /// Spawns the session init process described by `spec`.
    ///
    /// On success the process is running (not necessarily ready) and
    /// supervised; the caller owns the returned handle.
    async fn initialize(&self, spec: &LaunchSpec) -> Result<BridgeHandle>;

    /// Awaits the init process's readiness signal, bounded by
    /// [`crate::constants::SESSION_READY_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// - [`Error::StartupTimeout`] if the deadline passes
    /// - [`Error::UnexpectedExit`] if the process dies before readiness
    async fn wait_ready(&self, handle: &BridgeHandle) -> Result<()>;

    /// Terminates the session's process group with bounded escalation:
    /// SIGTERM, grace period, SIGKILL, kill-wait bound. Returns the exit
    /// code. Idempotent on an already-exited process.
    async fn terminate(&self, handle: &BridgeHandle) -> Result<i32>;

    /// Runs a one-shot command inside the session's rootfs and captures
    /// its output. Independent of the init process; requires only that
    /// the session is running.
    async fn exec(&self, handle: &BridgeHandle, command: &[String]) -> Result<ExecOutput>;
}
