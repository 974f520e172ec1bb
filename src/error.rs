//! Error types for the session runtime.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for session runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the session runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Transport Errors (retryable)
    // =========================================================================
    /// Network/IO failure while fetching an archive.
    #[error("transport failure for '{url}': {reason}")]
    Transport { url: String, reason: String },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Archive content does not match the expected digest.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    // =========================================================================
    // Rootfs Errors
    // =========================================================================
    /// Image identifier not present in the manifest.
    #[error("unknown image: {0}")]
    ImageUnknown(String),

    /// Extraction of a rootfs archive failed.
    #[error("failed to extract rootfs for '{image}': {reason}")]
    Extraction { image: String, reason: String },

    /// Path traversal attempt detected in an archive entry.
    #[error("path traversal detected in archive: {path}")]
    PathTraversal { path: String },

    /// Archive exceeded the compressed size limit.
    #[error("archive exceeds size limit: {size} > {limit} bytes")]
    ArchiveTooLarge { size: u64, limit: u64 },

    /// Extracted tree exceeded the rootfs size limit.
    #[error("rootfs exceeds size limit: {size} > {limit} bytes")]
    RootfsTooLarge { size: u64, limit: u64 },

    /// Image cannot be evicted while sessions reference it.
    #[error("image '{image}' is referenced by {refs} active session(s)")]
    ImageInUse { image: String, refs: usize },

    /// Store directory could not be initialized.
    #[error("failed to initialize store at {path}: {reason}")]
    StorageInit { path: PathBuf, reason: String },

    // =========================================================================
    // Bridge Errors
    // =========================================================================
    /// The native bridge could not spawn the supervised process.
    #[error("failed to spawn session process: {reason}")]
    Spawn { reason: String },

    /// The supervised process never signaled readiness.
    #[error("session init did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// The supervised process exited outside a requested stop.
    #[error("session process exited unexpectedly with code {code}")]
    UnexpectedExit { code: i32 },

    // =========================================================================
    // Session Lifecycle Errors
    // =========================================================================
    /// Session not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session id already in use.
    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    /// Registry is at capacity; delete a session before creating more.
    #[error("session limit reached ({limit})")]
    SessionLimit { limit: usize },

    /// Operation requires the session to be running.
    #[error("session '{id}' is not running")]
    NotRunning { id: String },

    /// Operation is invalid in the session's current state.
    #[error("session '{id}' is in state '{state}', cannot {operation}")]
    InvalidTransition {
        id: String,
        state: String,
        operation: String,
    },

    /// The session's I/O channel was already taken by a previous attach.
    #[error("session '{id}' already has an attached channel")]
    AlreadyAttached { id: String },

    /// Operation cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Persistence Errors (retried with backoff)
    // =========================================================================
    /// Storage collaborator failure.
    #[error("persistence failure: {0}")]
    Persistence(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal invariant violation (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the failure is transient and worth an automatic
    /// bounded retry (network/IO and persistence faults).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Persistence(_) | Error::Io(_)
        )
    }

    /// Reconstructs an equivalent error for a second observer.
    ///
    /// Used when one in-flight rootfs operation has several joined
    /// callers: each caller receives the same terminal outcome. Variants
    /// that carry non-clonable payloads degrade to `Internal` with the
    /// rendered message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Transport { url, reason } => Error::Transport {
                url: url.clone(),
                reason: reason.clone(),
            },
            Error::DigestMismatch { expected, computed } => Error::DigestMismatch {
                expected: expected.clone(),
                computed: computed.clone(),
            },
            Error::ImageUnknown(id) => Error::ImageUnknown(id.clone()),
            Error::Extraction { image, reason } => Error::Extraction {
                image: image.clone(),
                reason: reason.clone(),
            },
            Error::PathTraversal { path } => Error::PathTraversal { path: path.clone() },
            Error::ArchiveTooLarge { size, limit } => Error::ArchiveTooLarge {
                size: *size,
                limit: *limit,
            },
            Error::RootfsTooLarge { size, limit } => Error::RootfsTooLarge {
                size: *size,
                limit: *limit,
            },
            Error::Cancelled => Error::Cancelled,
            other => Error::Internal(other.to_string()),
        }
    }
}
