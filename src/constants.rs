//! # Runtime Constants
//!
//! Defines all resource limits, timeouts, and store-layout names for the
//! session runtime. These constants are the **single source of truth**
//! for security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion while allowing
//! legitimate rootfs images and workloads. Each constant includes:
//! - The bounded value and units
//! - Security rationale for the limit
//!
//! ## Cross-References
//!
//! - [`crate::rootfs`]: Uses size limits and the marker protocol names
//! - [`crate::transport`]: Uses download chunk and retry policy
//! - [`crate::bridge`]: Uses startup/shutdown timeouts
//! - [`crate::persist`]: Uses the persistence retry policy

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk and memory exhaustion from malicious or
// malformed rootfs archives. MAX_ROOTFS_SIZE is the extraction bound; the
// compressed archive is separately bounded by MAX_ARCHIVE_SIZE.
// =============================================================================

/// Maximum size of a compressed rootfs archive (4 GiB).
///
/// **Security**: Prevents disk exhaustion during download. The byte count
/// is validated as the stream is consumed, before verification.
pub const MAX_ARCHIVE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum total extracted rootfs size (8 GiB).
///
/// **Security**: The ultimate bound on disk usage from a single image,
/// enforced cumulatively during tar extraction.
///
/// Mitigates compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum number of entries in a rootfs archive.
///
/// **Security**: Prevents inode exhaustion from archives containing
/// millions of tiny files. A full desktop rootfs is well under this.
pub const MAX_ARCHIVE_ENTRIES: usize = 1_000_000;

/// Maximum rootfs manifest size (1 MiB).
///
/// **Security**: Prevents memory exhaustion from parsing malformed
/// manifests. Real manifests are a few KiB.
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Maximum number of concurrently tracked sessions.
///
/// **Security**: Bounds manager memory and the number of supervised
/// process trees on a memory-constrained host.
pub const MAX_SESSIONS: usize = 64;

// =============================================================================
// Download Policy
// =============================================================================

/// Chunk size for streaming download and hashing (64 KiB).
///
/// Cancellation flags and progress counters are checked per chunk, so this
/// also bounds cancellation latency.
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes between resumable-download checkpoints (8 MiB).
///
/// The prefix digest of the partial archive is recorded at this cadence;
/// an interruption loses at most this much verified progress.
pub const DOWNLOAD_CHECKPOINT_INTERVAL: u64 = 8 * 1024 * 1024;

/// Maximum automatic retries for transient transport failures.
///
/// Retries resume from the last checkpoint; after this many consecutive
/// failures the error is surfaced to the caller.
pub const DOWNLOAD_RETRY_LIMIT: u32 = 3;

/// Base delay for exponential download retry backoff.
pub const DOWNLOAD_RETRY_BASE: Duration = Duration::from_millis(500);

/// Maximum concurrent rootfs downloads across distinct images.
///
/// **Rationale**: Mobile-class hosts have constrained bandwidth and I/O;
/// per-image exclusivity is separate and always enforced.
pub const DOWNLOAD_POOL_SIZE: usize = 2;

// =============================================================================
// Bridge Timeouts
// =============================================================================

/// Time allowed for a spawned session init process to signal readiness.
///
/// **Security**: Prevents a wedged init from holding a session in
/// `Starting` forever. Exceeding it yields `StartupTimeout`.
pub const SESSION_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval for the readiness marker file.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL on graceful terminate.
///
/// **Rationale**: Long enough for an init to flush and exit, short enough
/// that a `stop()` never appears hung to the caller.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Bound on waiting for exit after SIGKILL.
///
/// A process group that survives SIGKILL is a host-kernel problem; the
/// bridge reports `Internal` rather than blocking forever.
pub const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one-shot `exec` commands inside a running session.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Persistence Policy
// =============================================================================

/// Maximum retries for a failed session-record write.
///
/// Lifecycle transitions are never dropped silently: each failed write is
/// retried with backoff, then logged at error level.
pub const PERSIST_RETRY_LIMIT: u32 = 3;

/// Base delay for exponential persistence retry backoff.
pub const PERSIST_RETRY_BASE: Duration = Duration::from_millis(50);

// =============================================================================
// Event Stream
// =============================================================================

/// Capacity of the lifecycle event broadcast channel.
///
/// The stream is lossy-tolerant: slow subscribers miss intermediate
/// events and re-sync from `SessionManager::snapshot`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Store Layout
// =============================================================================
//
// On-disk layout per image under the store base directory:
//
//   <store>/<image-id>/<image-id>.tar.gz        downloaded archive (cache)
//   <store>/<image-id>/<image-id>.tar.gz.part   resume checkpoint sidecar
//   <store>/<image-id>/rootfs/                  extracted tree
//   <store>/<image-id>/.extracted               Ready marker (sibling)
// =============================================================================

/// Marker file written (atomically) only after successful extraction.
///
/// Its presence is the sole authoritative Ready signal for an image. It
/// records the digest of the archive the tree was extracted from, so a
/// manifest digest bump marks the extraction stale.
pub const EXTRACTION_MARKER: &str = ".extracted";

/// Suffix of the resume checkpoint sidecar next to a partial archive.
pub const CHECKPOINT_SUFFIX: &str = ".part";

/// Subdirectory holding the extracted tree inside an image directory.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// Default store directory name under the user's home.
pub const DEFAULT_STORE_DIR: &str = ".droidbox";

// =============================================================================
// Identifier Validation
// =============================================================================

/// Valid characters for image identifiers.
///
/// **Security**: Excludes `/` and any character that could redirect the
/// per-image directory outside the store.
pub const IMAGE_ID_VALID_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";

/// Maximum image identifier length.
pub const MAX_IMAGE_ID_LEN: usize = 128;

/// Validates an image identifier for filesystem safety.
///
/// # Security
///
/// Image ids name directories under the store; this enforces a non-empty,
/// bounded, allowlist-only id with no leading dot.
#[must_use = "validation result must be checked before using the id in a path"]
pub fn validate_image_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("image id cannot be empty");
    }
    if id.len() > MAX_IMAGE_ID_LEN {
        return Err("image id exceeds maximum length");
    }
    if id.starts_with('.') {
        return Err("image id cannot start with a dot");
    }
    if !id.chars().all(|c| IMAGE_ID_VALID_CHARS.contains(c)) {
        return Err("image id contains invalid characters");
    }
    Ok(())
}
