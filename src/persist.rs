//! # Session Persistence
//!
//! Durable records of session lifecycle state, consulted at startup to
//! recover from host restarts. The store is a collaborator behind a
//! trait so tests can observe every write and inject failures; the
//! production implementation is a single JSON file written atomically
//! (temp file + rename), the same protocol the rootfs store uses for
//! its markers.
//!
//! Records are small and transitions are infrequent relative to file
//! I/O, so the whole map is rewritten per transition rather than
//! journaled.

use crate::error::{Error, Result};
use crate::manifest::ImageId;
use crate::session::{SessionConfig, SessionId, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Record
// =============================================================================

/// Durable snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identity.
    pub id: SessionId,
    /// Image the session runs in (denormalized for listings).
    pub image: ImageId,
    /// Full configuration, kept so recovery can rebuild the session.
    pub config: SessionConfig,
    /// Last persisted lifecycle state.
    pub state: SessionState,
    /// Supervised pid while one exists; drives orphan cleanup after a
    /// host restart.
    pub pid: Option<i32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last persisted transition.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Store Trait
// =============================================================================

/// Persistence collaborator for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads every persisted record.
    async fn load_all(&self) -> Result<Vec<SessionRecord>>;

    /// Inserts or replaces the record for `record.id`.
    async fn upsert(&self, record: &SessionRecord) -> Result<()>;

    /// Deletes the record for `id`. Deleting a missing record is not an
    /// error.
    async fn delete(&self, id: SessionId) -> Result<()>;
}

// =============================================================================
// JSON File Store
// =============================================================================

/// File-backed store: one JSON document holding all records.
///
/// Writes go through a temp file and an atomic rename, so a crash
/// mid-write leaves the previous document intact.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the document.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens (or will create on first write) the store at `path`.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageInit {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        info!("session store at {}", path.display());
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read_document(&self) -> Result<BTreeMap<SessionId, SessionRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| Error::Serialization(format!("corrupt session store: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }

    /// Reads the document, quarantining an unparseable file instead of
    /// overwriting it: the bad document is renamed to a `.corrupt`
    /// sibling and the store starts empty, so a single corrupt write
    /// never silently discards every other record on the next upsert.
    /// I/O failures still propagate for the caller's retry policy.
    fn read_document_or_quarantine(&self) -> Result<BTreeMap<SessionId, SessionRecord>> {
        match self.read_document() {
            Ok(doc) => Ok(doc),
            Err(Error::Serialization(reason)) => {
                let quarantine = self.path.with_extension("json.corrupt");
                std::fs::rename(&self.path, &quarantine)
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                warn!(
                    path = %self.path.display(),
                    preserved = %quarantine.display(),
                    reason,
                    "session store unreadable, preserved and starting empty"
                );
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e),
        }
    }

    fn write_document(&self, doc: &BTreeMap<SessionId, SessionRecord>) -> Result<()> {
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| Error::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let _guard = self.write_lock.lock().await;
        let doc = match self.read_document_or_quarantine() {
            Ok(doc) => doc,
            // Recovery must proceed even if the document is unreadable;
            // affected sessions are simply lost.
            Err(_) => BTreeMap::new(),
        };
        Ok(doc.into_values().collect())
    }

    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document_or_quarantine()?;
        debug!(session = %record.id, state = %record.state, "persisting session record");
        doc.insert(record.id, record.clone());
        self.write_document(&doc)
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document_or_quarantine()?;
        if doc.remove(&id).is_some() {
            self.write_document(&doc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FailureReason;

    fn record(state: SessionState) -> SessionRecord {
        let image: ImageId = "ubuntu-22.04-arm64".parse().unwrap();
        let now = Utc::now();
        SessionRecord {
            id: SessionId::generate(),
            image: image.clone(),
            config: SessionConfig::shell(image),
            state,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json")).unwrap();

        let rec = record(SessionState::Created);
        store.upsert(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, rec.id);
        assert_eq!(loaded[0].state, SessionState::Created);

        store.delete(rec.id).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        // idempotent delete
        store.delete(rec.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_replaces_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json")).unwrap();

        let mut rec = record(SessionState::Created);
        store.upsert(&rec).await.unwrap();
        rec.state = SessionState::Failed {
            reason: FailureReason::Interrupted,
        };
        store.upsert(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(matches!(loaded[0].state, SessionState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_document_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(path.clone()).unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        // The bad document is preserved, not overwritten.
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_upsert_quarantines_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(path.clone()).unwrap();
        let rec = record(SessionState::Created);
        store.upsert(&rec).await.unwrap();

        let quarantine = path.with_extension("json.corrupt");
        assert!(quarantine.exists(), "corrupt document must be preserved");
        assert_eq!(
            std::fs::read_to_string(&quarantine).unwrap(),
            "{ not json",
            "quarantined content must be the original bytes"
        );

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, rec.id);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope/sessions.json")).unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
