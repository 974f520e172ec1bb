//! # Session Lifecycle
//!
//! One [`Session`] supervises one native process tree running inside an
//! extracted rootfs. The lifecycle is a strict state machine:
//!
//! ```text
//! Created ──▶ Preparing ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                │              │           │
//!                └──────────────┴───────────┴──▶ Failed(reason)
//! ```
//!
//! `Recovering` is entered only at startup for sessions found persisted
//! in a non-terminal state; it settles to `Failed(Interrupted)` after
//! orphan cleanup.
//!
//! ## Single-Writer Discipline
//!
//! All lifecycle mutations run under one async mutex per session, so
//! transitions are serialized and every observer sees a consistent
//! ordering. `stop()` raises its flags *before* queuing on the mutex:
//! a stop issued while `start()` is still downloading cancels the
//! download and coalesces to `Stopped` without ever reaching `Running`.

use crate::bridge::{BridgeHandle, ExecOutput, IoChannel, LaunchSpec, NativeBridge};
use crate::error::{Error, Result};
use crate::manifest::{ImageId, RootfsStatus};
use crate::rootfs::{CancelFlag, RootfsManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Identity and Configuration
// =============================================================================

/// Unique session identifier (UUIDv7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generates a fresh time-ordered id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::SessionNotFound(s.to_string()))
    }
}

/// User-supplied configuration for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Rootfs image the session runs in.
    pub image: ImageId,
    /// Init command line inside the rootfs.
    pub entry: Vec<String>,
    /// Initial working directory inside the rootfs.
    pub workdir: String,
    /// Extra environment on top of the bridge defaults.
    pub env: Vec<(String, String)>,
}

impl SessionConfig {
    /// Creates a config with the default interactive shell entry.
    pub fn shell(image: ImageId) -> Self {
        Self {
            image,
            entry: vec!["/bin/bash".to_string(), "--login".to_string()],
            workdir: "/root".to_string(),
            env: Vec::new(),
        }
    }
}

// =============================================================================
// States
// =============================================================================

/// Why a session landed in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The rootfs could not be acquired (download, verify, or extract).
    ImageAcquisition { detail: String },
    /// The init process could not be spawned.
    SpawnFailed { detail: String },
    /// The init process never signaled readiness.
    StartupTimeout,
    /// The init process exited while the session was `Running`.
    UnexpectedExit { code: i32 },
    /// The host restarted while the session was live.
    Interrupted,
    /// Anything else.
    Internal { detail: String },
}

impl FailureReason {
    pub(crate) fn from_error(error: &Error) -> Self {
        match error {
            Error::Transport { .. }
            | Error::DigestMismatch { .. }
            | Error::Extraction { .. }
            | Error::PathTraversal { .. }
            | Error::ArchiveTooLarge { .. }
            | Error::RootfsTooLarge { .. }
            | Error::ImageUnknown(_)
            | Error::Cancelled => FailureReason::ImageAcquisition {
                detail: error.to_string(),
            },
            Error::Spawn { reason } => FailureReason::SpawnFailed {
                detail: reason.clone(),
            },
            Error::StartupTimeout { .. } => FailureReason::StartupTimeout,
            Error::UnexpectedExit { code } => FailureReason::UnexpectedExit { code: *code },
            other => FailureReason::Internal {
                detail: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ImageAcquisition { detail } => {
                write!(f, "image acquisition failed: {detail}")
            }
            FailureReason::SpawnFailed { detail } => write!(f, "spawn failed: {detail}"),
            FailureReason::StartupTimeout => write!(f, "startup timed out"),
            FailureReason::UnexpectedExit { code } => {
                write!(f, "process exited unexpectedly with code {code}")
            }
            FailureReason::Interrupted => write!(f, "interrupted by host restart"),
            FailureReason::Internal { detail } => write!(f, "internal failure: {detail}"),
        }
    }
}

/// Lifecycle state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, nothing started.
    Created,
    /// Rootfs acquisition in progress.
    Preparing,
    /// Process spawned, awaiting readiness.
    Starting,
    /// Ready and supervised.
    Running,
    /// Graceful terminate in progress.
    Stopping,
    /// Exited by request. Terminal.
    Stopped,
    /// Found non-terminal after a host restart; settling.
    Recovering,
    /// Lifecycle failed. Terminal.
    Failed { reason: FailureReason },
}

impl SessionState {
    /// Terminal states accept no supervision and hold no process.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed { .. })
    }

    /// Short state name for logs and listings.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Preparing => "preparing",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Recovering => "recovering",
            SessionState::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// Transition Sink
// =============================================================================

/// Observer invoked for every state transition, in order.
///
/// The manager's hub implements this to persist the record and publish
/// the lifecycle event stream.
#[async_trait]
pub trait TransitionSink: Send + Sync {
    /// Called after the in-memory state has changed.
    async fn on_transition(
        &self,
        id: SessionId,
        image: &ImageId,
        state: &SessionState,
        pid: Option<i32>,
    );

    /// Called for rootfs acquisition progress observed while the session
    /// is `Preparing`. Not persisted, only published.
    async fn on_progress(&self, id: SessionId, image: &ImageId, status: &RootfsStatus);
}

/// Shared collaborators a session needs to run.
#[derive(Clone)]
pub struct SessionContext {
    /// Rootfs acquisition and store.
    pub rootfs: Arc<RootfsManager>,
    /// Process supervision.
    pub bridge: Arc<dyn NativeBridge>,
    /// Transition observer (persistence + events).
    pub sink: Arc<dyn TransitionSink>,
    /// Base directory for per-session runtime directories.
    pub runtime_base: PathBuf,
}

// =============================================================================
// Session
// =============================================================================

/// One supervised session.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    ctx: SessionContext,
    /// Serializes all lifecycle mutations.
    lifecycle: Mutex<()>,
    state: std::sync::RwLock<SessionState>,
    handle: Mutex<Option<Arc<BridgeHandle>>>,
    stop_requested: AtomicBool,
    cancel: std::sync::RwLock<CancelFlag>,
}

impl Session {
    /// Creates a session in `Created`. The caller (the manager) emits the
    /// initial transition.
    pub fn new(id: SessionId, config: SessionConfig, ctx: SessionContext) -> Self {
        Self {
            id,
            config,
            created_at: Utc::now(),
            ctx,
            lifecycle: Mutex::new(()),
            state: std::sync::RwLock::new(SessionState::Created),
            handle: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            cancel: std::sync::RwLock::new(CancelFlag::new()),
        }
    }

    /// Restores a persisted session directly into `state` without
    /// emitting a transition. Used by recovery at startup.
    pub fn restored(
        id: SessionId,
        config: SessionConfig,
        ctx: SessionContext,
        state: SessionState,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut session = Self::new(id, config, ctx);
        session.created_at = created_at;
        if let Ok(mut guard) = session.state.write() {
            *guard = state;
        }
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn image(&self) -> &ImageId {
        &self.config.image
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state (cloned snapshot).
    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(SessionState::Failed {
                reason: FailureReason::Internal {
                    detail: "state lock poisoned".to_string(),
                },
            })
    }

    /// Pid of the supervised process, while one exists.
    pub async fn pid(&self) -> Option<i32> {
        self.handle.lock().await.as_ref().map(|h| h.pid())
    }

    async fn transition(&self, next: SessionState) {
        let pid = self.pid().await;
        {
            let mut state = match self.state.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            debug!(session = %self.id, from = %*state, to = %next, "transition");
            *state = next.clone();
        }
        self.ctx
            .sink
            .on_transition(self.id, &self.config.image, &next, pid)
            .await;
    }

    fn cancel_flag(&self) -> CancelFlag {
        self.cancel
            .read()
            .map(|flag| flag.clone())
            .unwrap_or_default()
    }

    fn runtime_dir(&self) -> PathBuf {
        self.ctx.runtime_base.join(self.id.to_string())
    }

    // =========================================================================
    // start
    // =========================================================================

    /// Drives the session to `Running`: acquires the rootfs, spawns the
    /// init process, and awaits readiness.
    ///
    /// Valid only from `Created`. `Stopped` and `Failed` are terminal;
    /// a new session must be created to run the image again. A `stop()`
    /// issued mid-preparation cancels the acquisition and settles the
    /// session in `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let current = self.state();
        match current {
            SessionState::Created => {}
            other => {
                return Err(Error::InvalidTransition {
                    id: self.id.to_string(),
                    state: other.to_string(),
                    operation: "start".to_string(),
                })
            }
        }
        let cancel = self.cancel_flag();

        self.transition(SessionState::Preparing).await;

        // Forward byte-level acquisition progress into the lifecycle
        // event stream while this session prepares.
        let forwarder = {
            let mut progress = self.ctx.rootfs.subscribe();
            let sink = Arc::clone(&self.ctx.sink);
            let id = self.id;
            let image = self.config.image.clone();
            tokio::spawn(async move {
                while let Ok(event) = progress.recv().await {
                    if event.image != image {
                        continue;
                    }
                    if matches!(
                        event.status,
                        RootfsStatus::Downloading { .. }
                            | RootfsStatus::Verifying
                            | RootfsStatus::Extracting
                    ) {
                        sink.on_progress(id, &image, &event.status).await;
                    }
                }
            })
        };

        let mut acquired = self.ctx.rootfs.ensure_ready(&self.config.image, &cancel).await;
        if matches!(acquired, Err(Error::Cancelled)) && !self.stop_requested.load(Ordering::SeqCst)
        {
            // This session joined an in-flight acquisition whose leader
            // was stopped. Nobody stopped *us*, so run our own
            // acquisition; the cancelled attempt has left the in-flight
            // slot and any partial download resumes from its checkpoint.
            debug!(session = %self.id, "joined acquisition cancelled, retrying");
            acquired = self.ctx.rootfs.ensure_ready(&self.config.image, &cancel).await;
        }
        forwarder.abort();
        let rootfs = match acquired {
            Ok(path) => path,
            Err(Error::Cancelled) if self.stop_requested.load(Ordering::SeqCst) => {
                info!(session = %self.id, "stop during preparation, settling stopped");
                self.transition(SessionState::Stopped).await;
                return Err(Error::Cancelled);
            }
            Err(e) => {
                self.transition(SessionState::Failed {
                    reason: FailureReason::from_error(&e),
                })
                .await;
                return Err(e);
            }
        };

        if self.stop_requested.load(Ordering::SeqCst) {
            // Acquisition finished before the cancel flag was observed.
            info!(session = %self.id, "stop during preparation, settling stopped");
            self.transition(SessionState::Stopped).await;
            return Err(Error::Cancelled);
        }

        self.transition(SessionState::Starting).await;
        let spec = LaunchSpec {
            rootfs,
            entry: self.config.entry.clone(),
            workdir: self.config.workdir.clone(),
            env: self.config.env.clone(),
            runtime_dir: self.runtime_dir(),
        };

        let handle = match self.ctx.bridge.initialize(&spec).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.transition(SessionState::Failed {
                    reason: FailureReason::from_error(&e),
                })
                .await;
                return Err(e);
            }
        };

        if let Err(e) = self.ctx.bridge.wait_ready(&handle).await {
            // Best-effort teardown of the half-started process.
            let _ = self.ctx.bridge.terminate(&handle).await;
            self.transition(SessionState::Failed {
                reason: FailureReason::from_error(&e),
            })
            .await;
            return Err(e);
        }

        *self.handle.lock().await = Some(handle.clone());
        self.transition(SessionState::Running).await;
        info!(session = %self.id, pid = handle.pid(), "session running");

        self.spawn_monitor(handle);
        Ok(())
    }

    /// Watches for process exit while `Running`. A requested stop owns
    /// its own transitions; the monitor only reports *unexpected* death.
    fn spawn_monitor(self: &Arc<Self>, handle: Arc<BridgeHandle>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let code = handle.wait_exit().await;
            let _guard = session.lifecycle.lock().await;
            if session.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            if !matches!(session.state(), SessionState::Running) {
                return;
            }
            warn!(session = %session.id, code, "session process exited unexpectedly");
            *session.handle.lock().await = None;
            let _ = std::fs::remove_dir_all(session.runtime_dir());
            session
                .transition(SessionState::Failed {
                    reason: FailureReason::UnexpectedExit { code },
                })
                .await;
        });
    }

    // =========================================================================
    // stop
    // =========================================================================

    /// Stops the session.
    ///
    /// Idempotent: already-terminal sessions return `Ok` unchanged. The
    /// stop flags are raised before queuing on the lifecycle mutex so an
    /// in-flight `start()` observes them at its next checkpoint.
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel_flag().cancel();

        let _guard = self.lifecycle.lock().await;
        match self.state() {
            SessionState::Stopped | SessionState::Failed { .. } => return Ok(()),
            SessionState::Created => {
                self.transition(SessionState::Stopped).await;
                return Ok(());
            }
            SessionState::Running => {}
            // start() holds the lifecycle mutex through Preparing and
            // Starting, so those states are unobservable here; anything
            // else is the recovery path.
            other => {
                return Err(Error::InvalidTransition {
                    id: self.id.to_string(),
                    state: other.to_string(),
                    operation: "stop".to_string(),
                })
            }
        }

        self.transition(SessionState::Stopping).await;
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            match self.ctx.bridge.terminate(&handle).await {
                Ok(code) => debug!(session = %self.id, code, "session terminated"),
                Err(e) => warn!(session = %self.id, error = %e, "terminate reported failure"),
            }
        }
        let _ = std::fs::remove_dir_all(self.runtime_dir());
        self.transition(SessionState::Stopped).await;
        info!(session = %self.id, "session stopped");
        Ok(())
    }

    // =========================================================================
    // attach / exec
    // =========================================================================

    /// Takes the session's I/O channel. Valid only while `Running`, and
    /// at most once per run.
    pub async fn attach(&self) -> Result<IoChannel> {
        if !matches!(self.state(), SessionState::Running) {
            return Err(Error::NotRunning {
                id: self.id.to_string(),
            });
        }
        let handle = self.handle.lock().await;
        let handle = handle.as_ref().ok_or_else(|| Error::NotRunning {
            id: self.id.to_string(),
        })?;
        handle.take_io()?.ok_or_else(|| Error::AlreadyAttached {
            id: self.id.to_string(),
        })
    }

    /// Runs a one-shot command inside the running session's rootfs.
    pub async fn exec(&self, command: &[String]) -> Result<ExecOutput> {
        if !matches!(self.state(), SessionState::Running) {
            return Err(Error::NotRunning {
                id: self.id.to_string(),
            });
        }
        let handle = {
            let guard = self.handle.lock().await;
            guard.as_ref().cloned().ok_or_else(|| Error::NotRunning {
                id: self.id.to_string(),
            })?
        };
        self.ctx.bridge.exec(&handle, command).await
    }

    // =========================================================================
    // recovery
    // =========================================================================

    /// Settles a `Recovering` session: kills any orphaned process group
    /// from the previous host run, then lands in `Failed(Interrupted)`.
    pub async fn settle_recovery(&self, orphan_pid: Option<i32>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !matches!(self.state(), SessionState::Recovering) {
            return Ok(());
        }
        if let Some(pid) = orphan_pid {
            if crate::bridge::process_alive(pid) {
                warn!(session = %self.id, pid, "killing orphaned session process group");
                crate::bridge::kill_group(pid, crate::bridge::KillSignal::Kill);
            }
        }
        let _ = std::fs::remove_dir_all(self.runtime_dir());
        self.transition(SessionState::Failed {
            reason: FailureReason::Interrupted,
        })
        .await;
        Ok(())
    }

    /// Emits the current state through the sink. Used by the manager for
    /// the initial `Created` transition.
    pub(crate) async fn announce(&self) {
        let state = self.state();
        let pid = self.pid().await;
        self.ctx
            .sink
            .on_transition(self.id, &self.config.image, &state, pid)
            .await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("image", &self.config.image)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
