//! # Session Manager
//!
//! Top-level coordinator tying the pieces together: the session
//! registry, the transition hub (persistence + event stream), the
//! rootfs manager, and the native bridge.
//!
//! ```text
//!              ┌──────────────────────────────────────┐
//!              │            SessionManager             │
//!              │  registry: id → Arc<Session>          │
//!              └──────┬──────────────┬────────────────┘
//!                     │              │
//!            ┌────────▼───────┐ ┌────▼──────────┐
//!            │ TransitionHub  │ │ RootfsManager │
//!            │ persist+events │ │ images        │
//!            └────────┬───────┘ └───────────────┘
//!                     │
//!            ┌────────▼───────┐
//!            │ SessionStore   │
//!            └────────────────┘
//! ```
//!
//! ## Event Ordering
//!
//! Every transition flows through the hub in transition order per
//! session: persist first (with bounded retries), then publish. The
//! broadcast stream is lossy for slow subscribers; [`SessionManager::snapshot`]
//! re-syncs them.
//!
//! ## Recovery
//!
//! At startup, persisted records are reloaded. Terminal sessions are
//! restored as-is. Non-terminal records mean the previous host process
//! died mid-lifecycle: their sessions enter `Recovering`, any orphaned
//! process group from the recorded pid is killed, and they settle in
//! `Failed(Interrupted)`.

use crate::bridge::{ExecOutput, IoChannel, NativeBridge};
use crate::constants::{
    EVENT_CHANNEL_CAPACITY, MAX_SESSIONS, PERSIST_RETRY_BASE, PERSIST_RETRY_LIMIT,
};
use crate::error::{Error, Result};
use crate::manifest::{ImageId, RootfsStatus};
use crate::persist::{SessionRecord, SessionStore};
use crate::rootfs::{CancelFlag, ImageRefCounts, RootfsManager, RootfsProgress};
use crate::session::{
    Session, SessionConfig, SessionContext, SessionId, SessionState, TransitionSink,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

// =============================================================================
// Events
// =============================================================================

/// One lifecycle event, published on every state transition and, while
/// a session is `Preparing`, on rootfs acquisition progress.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Session that transitioned.
    pub id: SessionId,
    /// Image the session runs in.
    pub image: ImageId,
    /// State entered (or held, for progress-only events).
    pub state: SessionState,
    /// Supervised pid, while one exists.
    pub pid: Option<i32>,
    /// Acquisition progress, on progress-only events during `Preparing`.
    pub progress: Option<RootfsStatus>,
}

// =============================================================================
// Transition Hub
// =============================================================================

/// Metadata the hub needs to rebuild a full record per transition.
struct SessionMeta {
    config: SessionConfig,
    created_at: DateTime<Utc>,
}

/// Persists and publishes every session transition, in order.
pub struct TransitionHub {
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<SessionEvent>,
    meta: std::sync::RwLock<HashMap<SessionId, SessionMeta>>,
}

impl TransitionHub {
    fn new(store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            meta: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, id: SessionId, config: SessionConfig, created_at: DateTime<Utc>) {
        if let Ok(mut meta) = self.meta.write() {
            meta.insert(id, SessionMeta { config, created_at });
        }
    }

    fn unregister(&self, id: SessionId) {
        if let Ok(mut meta) = self.meta.write() {
            meta.remove(&id);
        }
    }

    fn record_for(
        &self,
        id: SessionId,
        image: &ImageId,
        state: &SessionState,
        pid: Option<i32>,
    ) -> Option<SessionRecord> {
        let meta = self.meta.read().ok()?;
        let entry = meta.get(&id)?;
        Some(SessionRecord {
            id,
            image: image.clone(),
            config: entry.config.clone(),
            state: state.clone(),
            pid,
            created_at: entry.created_at,
            updated_at: Utc::now(),
        })
    }

    /// Writes one record with bounded retries. A transition is never
    /// dropped silently: final failure is logged at error level and the
    /// in-memory state remains authoritative.
    async fn persist(&self, record: &SessionRecord) {
        let mut attempt = 0u32;
        loop {
            match self.store.upsert(record).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < PERSIST_RETRY_LIMIT => {
                    attempt += 1;
                    let delay = PERSIST_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        session = %record.id,
                        attempt,
                        error = %e,
                        "session record write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        session = %record.id,
                        state = %record.state,
                        error = %e,
                        "session record write failed permanently"
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransitionSink for TransitionHub {
    async fn on_transition(
        &self,
        id: SessionId,
        image: &ImageId,
        state: &SessionState,
        pid: Option<i32>,
    ) {
        if let Some(record) = self.record_for(id, image, state, pid) {
            self.persist(&record).await;
        }
        let _ = self.events.send(SessionEvent {
            id,
            image: image.clone(),
            state: state.clone(),
            pid,
            progress: None,
        });
    }

    async fn on_progress(&self, id: SessionId, image: &ImageId, status: &RootfsStatus) {
        let _ = self.events.send(SessionEvent {
            id,
            image: image.clone(),
            state: SessionState::Preparing,
            pid: None,
            progress: Some(status.clone()),
        });
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owns the session registry and coordinates all collaborators.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    rootfs: Arc<RootfsManager>,
    bridge: Arc<dyn NativeBridge>,
    hub: Arc<TransitionHub>,
    runtime_base: PathBuf,
}

impl SessionManager {
    /// Creates a manager. Call [`SessionManager::recover`] before serving
    /// requests.
    pub fn new(
        rootfs: Arc<RootfsManager>,
        bridge: Arc<dyn NativeBridge>,
        store: Arc<dyn SessionStore>,
        runtime_base: PathBuf,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rootfs,
            bridge,
            hub: Arc::new(TransitionHub::new(store)),
            runtime_base,
        }
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            rootfs: Arc::clone(&self.rootfs),
            bridge: Arc::clone(&self.bridge),
            sink: self.hub.clone() as Arc<dyn TransitionSink>,
            runtime_base: self.runtime_base.clone(),
        }
    }

    /// Rootfs manager, for image operations and progress subscriptions.
    pub fn rootfs(&self) -> &Arc<RootfsManager> {
        &self.rootfs
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reloads persisted sessions and settles interrupted ones.
    pub async fn recover(&self) -> Result<()> {
        let records = self.hub.store.load_all().await?;
        if records.is_empty() {
            return Ok(());
        }
        info!(count = records.len(), "recovering persisted sessions");

        let mut sessions = self.sessions.write().await;
        for record in records {
            self.hub
                .register(record.id, record.config.clone(), record.created_at);

            if record.state.is_terminal() {
                let session = Arc::new(Session::restored(
                    record.id,
                    record.config,
                    self.context(),
                    record.state,
                    record.created_at,
                ));
                sessions.insert(record.id, session);
                continue;
            }

            debug!(
                session = %record.id,
                state = %record.state,
                pid = ?record.pid,
                "session interrupted by host restart"
            );
            let session = Arc::new(Session::restored(
                record.id,
                record.config,
                self.context(),
                SessionState::Recovering,
                record.created_at,
            ));
            session.settle_recovery(record.pid).await?;
            sessions.insert(record.id, session);
        }
        Ok(())
    }

    // =========================================================================
    // Registry Operations
    // =========================================================================

    /// Registers a new session in `Created`.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Arc<Session>> {
        // Image must at least be known; readiness is checked at start.
        self.rootfs.manifest().get(&config.image)?;

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            return Err(Error::SessionLimit {
                limit: MAX_SESSIONS,
            });
        }

        let id = SessionId::generate();
        let session = Arc::new(Session::new(id, config.clone(), self.context()));
        self.hub.register(id, config, session.created_at());
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);

        session.announce().await;
        info!(session = %id, image = %session.image(), "session created");
        Ok(session)
    }

    /// Looks up a session by id.
    pub async fn get_session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// All sessions, ordered by creation time (UUIDv7 order).
    pub async fn list_sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.id());
        all
    }

    /// Starts a session (see [`Session::start`]).
    pub async fn start_session(&self, id: SessionId) -> Result<()> {
        let session = self.get_session(id).await?;
        session.start().await
    }

    /// Stops a session (see [`Session::stop`]).
    pub async fn stop_session(&self, id: SessionId) -> Result<()> {
        let session = self.get_session(id).await?;
        session.stop().await
    }

    /// Attaches to a running session's I/O channel.
    pub async fn attach_session(&self, id: SessionId) -> Result<IoChannel> {
        let session = self.get_session(id).await?;
        session.attach().await
    }

    /// Runs a one-shot command inside a running session.
    pub async fn exec_in_session(&self, id: SessionId, command: &[String]) -> Result<ExecOutput> {
        let session = self.get_session(id).await?;
        session.exec(command).await
    }

    /// Removes a session and its persisted record, stopping it first if
    /// it is still live.
    pub async fn delete_session(&self, id: SessionId) -> Result<()> {
        let session = self.get_session(id).await?;
        let state = session.state();
        if !state.is_terminal() && !matches!(state, SessionState::Created) {
            session.stop().await?;
        }

        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        drop(sessions);

        self.hub.unregister(id);
        self.hub.store.delete(id).await?;
        info!(session = %id, "session deleted");
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribes to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.hub.events.subscribe()
    }

    /// Subscribes to rootfs acquisition progress.
    pub fn subscribe_rootfs(&self) -> broadcast::Receiver<RootfsProgress> {
        self.rootfs.subscribe()
    }

    /// Current state of every session, for late or lagged subscribers.
    pub async fn snapshot(&self) -> Vec<SessionEvent> {
        let sessions = self.list_sessions().await;
        let mut events = Vec::with_capacity(sessions.len());
        for session in sessions {
            events.push(SessionEvent {
                id: session.id(),
                image: session.image().clone(),
                state: session.state(),
                pid: session.pid().await,
                progress: None,
            });
        }
        events
    }

    // =========================================================================
    // Image Operations
    // =========================================================================

    /// Pre-pulls an image without starting a session.
    pub async fn pull_image(&self, image: &ImageId, cancel: &CancelFlag) -> Result<PathBuf> {
        self.rootfs.ensure_ready(image, cancel).await
    }

    /// Evicts an image, refusing while any non-terminal session uses it.
    pub async fn evict_image(&self, image: &ImageId) -> Result<()> {
        self.rootfs.evict(image, self).await
    }
}

#[async_trait]
impl ImageRefCounts for SessionManager {
    async fn active_references(&self, image: &ImageId) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.image() == image && !s.state().is_terminal())
            .count()
    }
}
