//! # Rootfs Store and Acquisition Pipeline
//!
//! Orchestrates download → verify → extract → register for rootfs images,
//! producing ready-to-use filesystem roots for sessions.
//!
//! ## Storage Model
//!
//! Each image owns an isolated directory named by its identifier:
//!
//! ```text
//! ~/.droidbox/images/
//! └── ubuntu-22.04-arm64/
//!     ├── ubuntu-22.04-arm64.tar.gz        downloaded archive (cache)
//!     ├── ubuntu-22.04-arm64.tar.gz.part   resume checkpoint sidecar
//!     ├── rootfs/                          extracted tree
//!     └── .extracted                       Ready marker (written last)
//! ```
//!
//! ## Crash Safety
//!
//! The Ready marker is written via a temp file + rename only after a full
//! extraction, so a crash mid-extraction leaves no marker. The next
//! `ensure_ready` sees the missing marker, deletes partial output, and
//! re-extracts. The marker records the digest the extraction came from;
//! when the manifest later advertises a different digest for the image,
//! the old extraction is treated as stale and re-acquired.
//!
//! ## Resumable Downloads
//!
//! While a download streams to disk, the prefix digest of the partial
//! archive is checkpointed every [`DOWNLOAD_CHECKPOINT_INTERVAL`] bytes.
//! A later attempt re-hashes the partial file against the checkpoint; a
//! match allows a byte-range continuation, anything else restarts from
//! zero. A digest mismatch on the complete file deletes the corrupt
//! artifact so a retry cannot be poisoned by it.
//!
//! ## Concurrency
//!
//! At most one pipeline runs per image identity: the first caller leads,
//! concurrent `ensure_ready` calls for the same image join the in-flight
//! operation and observe the same terminal outcome. Distinct images
//! download concurrently up to [`DOWNLOAD_POOL_SIZE`]. Eviction takes the
//! same per-image lock as the pipeline.

use crate::constants::{
    CHECKPOINT_SUFFIX, DEFAULT_STORE_DIR, DOWNLOAD_CHECKPOINT_INTERVAL, DOWNLOAD_POOL_SIZE,
    DOWNLOAD_RETRY_BASE, DOWNLOAD_RETRY_LIMIT, EVENT_CHANNEL_CAPACITY, EXTRACTION_MARKER,
    MAX_ARCHIVE_ENTRIES, MAX_ARCHIVE_SIZE, MAX_ROOTFS_SIZE, ROOTFS_SUBDIR,
};
use crate::error::{Error, Result};
use crate::manifest::{ImageDescriptor, ImageId, RootfsManifest, RootfsStatus};
use crate::transport::DownloadTransport;
use crate::verifier::{self, StreamingVerifier};
use flate2::read::GzDecoder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tar::Archive;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation flag, checked between download chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Resume Checkpoint
// =============================================================================

/// Sidecar state recorded beside a partial archive.
///
/// `prefix_digest` is the digest over the first `bytes_fetched` bytes; a
/// resume attempt must reproduce it from the on-disk partial file before
/// a range continuation is requested.
#[derive(Debug, Serialize, Deserialize)]
struct DownloadCheckpoint {
    bytes_fetched: u64,
    prefix_digest: String,
}

// =============================================================================
// Store Layout
// =============================================================================

/// Path helper over the on-disk image store.
pub struct RootfsStore {
    base_dir: PathBuf,
}

impl RootfsStore {
    /// Creates a store at the default location (`~/.droidbox/images`).
    pub fn new() -> Result<Self> {
        let base = match dirs::home_dir() {
            Some(home) => home.join(DEFAULT_STORE_DIR).join("images"),
            None => PathBuf::from(DEFAULT_STORE_DIR).join("images"),
        };
        Self::with_path(base)
    }

    /// Creates a store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInit {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        info!("rootfs store initialized at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory owned by one image.
    pub fn image_dir(&self, id: &ImageId) -> PathBuf {
        self.base_dir.join(id.dir_name())
    }

    /// Extracted tree for an image.
    pub fn rootfs_dir(&self, id: &ImageId) -> PathBuf {
        self.image_dir(id).join(ROOTFS_SUBDIR)
    }

    /// Ready marker, a sibling of the extracted tree. Its content is the
    /// digest of the archive the tree was extracted from.
    pub fn marker_path(&self, id: &ImageId) -> PathBuf {
        self.image_dir(id).join(EXTRACTION_MARKER)
    }

    /// Digest recorded in the Ready marker, if one is present.
    pub fn marker_digest(&self, id: &ImageId) -> Option<String> {
        fs::read_to_string(self.marker_path(id))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Cached compressed archive.
    pub fn archive_path(&self, id: &ImageId) -> PathBuf {
        self.image_dir(id).join(format!("{}.tar.gz", id.dir_name()))
    }

    /// Resume checkpoint sidecar for the archive.
    pub fn checkpoint_path(&self, id: &ImageId) -> PathBuf {
        let mut name = self
            .archive_path(id)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(CHECKPOINT_SUFFIX);
        self.image_dir(id).join(name)
    }

    /// True when the extraction marker and the extracted tree are both
    /// present. The marker is the sole authoritative Ready signal.
    pub fn is_ready(&self, id: &ImageId) -> bool {
        self.marker_path(id).exists() && self.rootfs_dir(id).is_dir()
    }

    /// Total size of an image's extracted tree.
    pub fn image_size(&self, id: &ImageId) -> Result<u64> {
        let mut total = 0u64;
        Self::walk_dir(&self.rootfs_dir(id), &mut |path| {
            if let Ok(meta) = fs::symlink_metadata(path) {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        })?;
        Ok(total)
    }

    /// Image ids with a Ready extraction under this store.
    pub fn installed_images(&self) -> Result<Vec<ImageId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<ImageId>() {
                    if self.is_ready(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes cached archives and checkpoints, keeping extracted trees.
    /// Returns the number of bytes freed.
    pub fn clear_archive_cache(&self) -> Result<u64> {
        let mut freed = 0u64;
        for id in self.installed_images()? {
            for path in [self.archive_path(&id), self.checkpoint_path(&id)] {
                if let Ok(meta) = fs::metadata(&path) {
                    freed += meta.len();
                    fs::remove_file(&path)?;
                }
            }
        }
        info!("archive cache cleared, freed {freed} bytes");
        Ok(freed)
    }

    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Reference-count collaborator consulted before eviction.
///
/// Maintained by the session manager; an image with live references
/// cannot be evicted.
#[async_trait::async_trait]
pub trait ImageRefCounts: Send + Sync {
    /// Number of non-terminal sessions referencing `image`.
    async fn active_references(&self, image: &ImageId) -> usize;
}

/// Progress event published while a pipeline runs.
#[derive(Debug, Clone)]
pub struct RootfsProgress {
    /// Image the event concerns.
    pub image: ImageId,
    /// New acquisition status.
    pub status: RootfsStatus,
}

// =============================================================================
// In-flight Operation Cell
// =============================================================================

/// Shared outcome slot for joined `ensure_ready` callers.
struct OpCell {
    done_tx: watch::Sender<bool>,
    slot: Mutex<Option<Result<PathBuf>>>,
}

impl OpCell {
    fn new() -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            done_tx,
            slot: Mutex::new(None),
        })
    }

    async fn complete(&self, result: Result<PathBuf>) {
        *self.slot.lock().await = Some(result);
        let _ = self.done_tx.send(true);
    }

    async fn wait(&self) -> Result<PathBuf> {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match &*self.slot.lock().await {
            Some(Ok(path)) => Ok(path.clone()),
            Some(Err(e)) => Err(e.duplicate()),
            None => Err(Error::Internal("in-flight download abandoned".to_string())),
        }
    }
}

// =============================================================================
// Rootfs Manager
// =============================================================================

/// Orchestrates acquisition and eviction of rootfs images.
///
/// Thread-safe and designed for shared use behind an `Arc`.
pub struct RootfsManager {
    store: RootfsStore,
    manifest: RootfsManifest,
    transport: Arc<dyn DownloadTransport>,
    /// Per-image write serializer (download/extract/evict/install).
    locks: Mutex<HashMap<ImageId, Arc<Mutex<()>>>>,
    /// Join cells for in-flight `ensure_ready` pipelines.
    inflight: Mutex<HashMap<ImageId, Arc<OpCell>>>,
    /// Bounded pool for concurrent downloads across distinct images.
    download_slots: Arc<Semaphore>,
    /// Last observed status per image.
    statuses: std::sync::RwLock<HashMap<ImageId, RootfsStatus>>,
    progress_tx: broadcast::Sender<RootfsProgress>,
}

impl RootfsManager {
    /// Creates a manager over a store, manifest, and transport.
    pub fn new(
        store: RootfsStore,
        manifest: RootfsManifest,
        transport: Arc<dyn DownloadTransport>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            manifest,
            transport,
            locks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            download_slots: Arc::new(Semaphore::new(DOWNLOAD_POOL_SIZE)),
            statuses: std::sync::RwLock::new(HashMap::new()),
            progress_tx,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &RootfsStore {
        &self.store
    }

    /// Returns the manifest this manager consumes.
    pub fn manifest(&self) -> &RootfsManifest {
        &self.manifest
    }

    /// Subscribes to acquisition progress events.
    ///
    /// The stream is lossy-tolerant: re-query [`RootfsManager::status`]
    /// after a lag.
    pub fn subscribe(&self) -> broadcast::Receiver<RootfsProgress> {
        self.progress_tx.subscribe()
    }

    /// Current acquisition status of an image.
    pub fn status(&self, id: &ImageId) -> RootfsStatus {
        if let Ok(map) = self.statuses.read() {
            if let Some(status) = map.get(id) {
                return status.clone();
            }
        }
        if self.store.is_ready(id) {
            match self.manifest.get(id) {
                Ok(descriptor) if !self.marker_current(id, descriptor) => RootfsStatus::NotPresent,
                _ => RootfsStatus::Ready,
            }
        } else {
            RootfsStatus::NotPresent
        }
    }

    /// True when the Ready marker records the digest the manifest
    /// currently expects for this image. A manifest digest bump makes an
    /// existing extraction stale.
    fn marker_current(&self, id: &ImageId, descriptor: &ImageDescriptor) -> bool {
        match self.store.marker_digest(id) {
            Some(recorded) => verifier::digests_equal(&recorded, &descriptor.digest),
            None => false,
        }
    }

    fn set_status(&self, id: &ImageId, status: RootfsStatus) {
        debug!(image = %id, %status, "rootfs status");
        if let Ok(mut map) = self.statuses.write() {
            map.insert(id.clone(), status.clone());
        }
        let _ = self.progress_tx.send(RootfsProgress {
            image: id.clone(),
            status,
        });
    }

    async fn image_lock(&self, id: &ImageId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // ensure_ready
    // =========================================================================

    /// Ensures an image is downloaded, verified, and extracted, returning
    /// the path of the extracted tree.
    ///
    /// Idempotent: a Ready image returns immediately without re-fetching.
    /// Concurrent calls for the same image join the in-flight pipeline
    /// and observe its terminal outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::ImageUnknown`] if the manifest has no entry
    /// - [`Error::Transport`] after bounded retries are exhausted
    /// - [`Error::DigestMismatch`] if the archive fails verification
    ///   (the corrupt artifact is deleted first)
    /// - [`Error::Extraction`] / [`Error::PathTraversal`] on unpack
    /// - [`Error::Cancelled`] if `cancel` trips between chunks
    pub async fn ensure_ready(&self, id: &ImageId, cancel: &CancelFlag) -> Result<PathBuf> {
        let descriptor = self.manifest.get(id)?.clone();

        let cell = {
            let mut inflight = self.inflight.lock().await;
            if self.store.is_ready(id) && self.marker_current(id, &descriptor) {
                self.set_status(id, RootfsStatus::Ready);
                return Ok(self.store.rootfs_dir(id));
            }
            if let Some(cell) = inflight.get(id) {
                let cell = cell.clone();
                drop(inflight);
                debug!(image = %id, "joining in-flight acquisition");
                return cell.wait().await;
            }
            let cell = OpCell::new();
            inflight.insert(id.clone(), cell.clone());
            cell
        };

        let result = self.run_pipeline(id, &descriptor, cancel).await;
        self.inflight.lock().await.remove(id);
        let shared = match &result {
            Ok(path) => Ok(path.clone()),
            Err(e) => Err(e.duplicate()),
        };
        cell.complete(shared).await;
        result
    }

    async fn run_pipeline(
        &self,
        id: &ImageId,
        descriptor: &ImageDescriptor,
        cancel: &CancelFlag,
    ) -> Result<PathBuf> {
        let lock = self.image_lock(id).await;
        let _guard = lock.lock().await;

        if self.store.is_ready(id) {
            if self.marker_current(id, descriptor) {
                self.set_status(id, RootfsStatus::Ready);
                return Ok(self.store.rootfs_dir(id));
            }
            // Manifest digest bump: the extraction on disk came from a
            // superseded archive. Drop the marker and cached artifacts so
            // the pipeline re-acquires the new content.
            info!(image = %id, "extraction stale against manifest, re-acquiring");
            let _ = fs::remove_file(self.store.marker_path(id));
            let _ = fs::remove_file(self.store.archive_path(id));
            let _ = fs::remove_file(self.store.checkpoint_path(id));
        }

        fs::create_dir_all(self.store.image_dir(id)).map_err(|e| Error::StorageInit {
            path: self.store.image_dir(id),
            reason: e.to_string(),
        })?;

        let archive = self.store.archive_path(id);
        if !self.archive_complete(id, descriptor) {
            self.download(id, descriptor, cancel).await.map_err(|e| {
                if !matches!(e, Error::Cancelled) {
                    self.set_status(
                        id,
                        RootfsStatus::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
                e
            })?;
        }

        self.set_status(id, RootfsStatus::Verifying);
        if let Err(e) = verifier::verify_file(&archive, &descriptor.digest) {
            if matches!(e, Error::DigestMismatch { .. }) {
                warn!(image = %id, "digest mismatch, deleting corrupt archive");
                let _ = fs::remove_file(&archive);
                let _ = fs::remove_file(self.store.checkpoint_path(id));
            }
            self.set_status(
                id,
                RootfsStatus::Failed {
                    reason: e.to_string(),
                },
            );
            return Err(e);
        }

        self.set_status(id, RootfsStatus::Extracting);
        if let Err(e) = self.extract(id, &archive, &descriptor.digest) {
            self.set_status(
                id,
                RootfsStatus::Failed {
                    reason: e.to_string(),
                },
            );
            return Err(e);
        }

        self.set_status(id, RootfsStatus::Ready);
        info!(image = %id, "rootfs ready");
        Ok(self.store.rootfs_dir(id))
    }

    /// True if a cached archive is complete: advertised length reached
    /// and no resume checkpoint left behind.
    fn archive_complete(&self, id: &ImageId, descriptor: &ImageDescriptor) -> bool {
        if self.store.checkpoint_path(id).exists() {
            return false;
        }
        match fs::metadata(self.store.archive_path(id)) {
            Ok(meta) => meta.len() == descriptor.size_bytes,
            Err(_) => false,
        }
    }

    // =========================================================================
    // Download
    // =========================================================================

    async fn download(
        &self,
        id: &ImageId,
        descriptor: &ImageDescriptor,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let _permit = self
            .download_slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("download pool closed".to_string()))?;

        // Progress counts must never regress, even across a forced
        // restart-from-zero within the same call.
        let mut high_water = 0u64;
        let mut attempt = 0u32;
        loop {
            match self
                .stream_to_disk(id, descriptor, cancel, &mut high_water)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_transient() && attempt < DOWNLOAD_RETRY_LIMIT => {
                    attempt += 1;
                    let delay = DOWNLOAD_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        image = %id,
                        attempt,
                        ?delay,
                        error = %e,
                        "transient download failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One download attempt: resumes from a valid checkpoint or restarts
    /// from zero, streaming to the archive path.
    async fn stream_to_disk(
        &self,
        id: &ImageId,
        descriptor: &ImageDescriptor,
        cancel: &CancelFlag,
        high_water: &mut u64,
    ) -> Result<()> {
        let archive = self.store.archive_path(id);
        let checkpoint_path = self.store.checkpoint_path(id);

        let (mut hasher, mut offset) = self.resume_state(id)?;
        let response = self.transport.fetch(&descriptor.url, offset).await?;

        if offset > 0 && !response.resumed {
            // Server restarted the payload; the partial file is useless.
            hasher = StreamingVerifier::new();
            offset = 0;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&archive)?;
        file.set_len(offset)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(offset))?;

        let mut stream = response.stream;
        let mut fetched = offset;
        let mut last_checkpoint = offset;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                debug!(image = %id, "download cancelled at {fetched} bytes");
                self.write_checkpoint(&checkpoint_path, fetched, &hasher)?;
                return Err(Error::Cancelled);
            }
            let chunk = chunk?;
            fetched += chunk.len() as u64;
            if fetched > MAX_ARCHIVE_SIZE {
                return Err(Error::ArchiveTooLarge {
                    size: fetched,
                    limit: MAX_ARCHIVE_SIZE,
                });
            }
            file.write_all(&chunk)?;
            hasher.update(&chunk);

            *high_water = (*high_water).max(fetched);
            self.set_status(
                id,
                RootfsStatus::Downloading {
                    fetched: *high_water,
                    total: descriptor.size_bytes,
                },
            );

            if fetched - last_checkpoint >= DOWNLOAD_CHECKPOINT_INTERVAL {
                file.flush()?;
                self.write_checkpoint(&checkpoint_path, fetched, &hasher)?;
                last_checkpoint = fetched;
            }
        }
        file.flush()?;

        if fetched < descriptor.size_bytes {
            // Premature EOF without a transport error; checkpoint what we
            // have and let the retry loop resume.
            self.write_checkpoint(&checkpoint_path, fetched, &hasher)?;
            return Err(Error::Transport {
                url: descriptor.url.clone(),
                reason: format!(
                    "connection closed early at {fetched}/{} bytes",
                    descriptor.size_bytes
                ),
            });
        }

        let _ = fs::remove_file(&checkpoint_path);
        debug!(image = %id, bytes = fetched, "download complete");
        Ok(())
    }

    /// Derives the resume position from disk state.
    ///
    /// Returns a hasher pre-fed with the valid prefix and the offset to
    /// continue from; any disagreement between the partial file and its
    /// checkpoint discards both.
    fn resume_state(&self, id: &ImageId) -> Result<(StreamingVerifier, u64)> {
        let archive = self.store.archive_path(id);
        let checkpoint_path = self.store.checkpoint_path(id);

        let checkpoint: DownloadCheckpoint = match fs::read_to_string(&checkpoint_path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(cp) => cp,
                Err(_) => {
                    return self.discard_partial(id);
                }
            },
            Err(_) => {
                // No checkpoint: any partial file is unverifiable.
                return self.discard_partial(id);
            }
        };

        let file_len = match fs::metadata(&archive) {
            Ok(meta) => meta.len(),
            Err(_) => return self.discard_partial(id),
        };
        if file_len < checkpoint.bytes_fetched || checkpoint.bytes_fetched == 0 {
            return self.discard_partial(id);
        }

        // Re-hash the checkpointed prefix and compare before trusting it.
        let mut hasher = StreamingVerifier::new();
        let mut file = fs::File::open(&archive)?;
        let mut remaining = checkpoint.bytes_fetched;
        let mut buf = vec![0u8; crate::constants::DOWNLOAD_CHUNK_SIZE];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return self.discard_partial(id);
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }

        if hasher.partial_digest() != checkpoint.prefix_digest {
            warn!(image = %id, "partial archive prefix digest mismatch, restarting from zero");
            return self.discard_partial(id);
        }

        debug!(
            image = %id,
            offset = checkpoint.bytes_fetched,
            "resuming download from checkpoint"
        );
        Ok((hasher, checkpoint.bytes_fetched))
    }

    fn discard_partial(&self, id: &ImageId) -> Result<(StreamingVerifier, u64)> {
        let _ = fs::remove_file(self.store.archive_path(id));
        let _ = fs::remove_file(self.store.checkpoint_path(id));
        Ok((StreamingVerifier::new(), 0))
    }

    fn write_checkpoint(
        &self,
        path: &Path,
        bytes_fetched: u64,
        hasher: &StreamingVerifier,
    ) -> Result<()> {
        let checkpoint = DownloadCheckpoint {
            bytes_fetched,
            prefix_digest: hasher.partial_digest(),
        };
        let data =
            serde_json::to_string(&checkpoint).map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = path.with_extension("part.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    // =========================================================================
    // Extraction
    // =========================================================================

    /// Unpacks the verified archive into the image's rootfs directory and
    /// writes the Ready marker last, via temp file + rename. The marker
    /// records `digest` so later callers can detect a manifest bump.
    fn extract(&self, id: &ImageId, archive: &Path, digest: &str) -> Result<()> {
        let rootfs = self.store.rootfs_dir(id);
        if rootfs.exists() {
            // Leftover from an interrupted extraction.
            fs::remove_dir_all(&rootfs)?;
        }
        fs::create_dir_all(&rootfs)?;

        let file = fs::File::open(archive)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let mut tar = Archive::new(decoder);
        tar.set_preserve_permissions(true);

        let mut total: u64 = 0;
        let mut entries = 0usize;
        let iter = tar.entries().map_err(|e| Error::Extraction {
            image: id.to_string(),
            reason: e.to_string(),
        })?;
        for entry in iter {
            let mut entry = entry.map_err(|e| Error::Extraction {
                image: id.to_string(),
                reason: e.to_string(),
            })?;

            entries += 1;
            if entries > MAX_ARCHIVE_ENTRIES {
                let _ = fs::remove_dir_all(&rootfs);
                return Err(Error::Extraction {
                    image: id.to_string(),
                    reason: format!("archive exceeds {MAX_ARCHIVE_ENTRIES} entries"),
                });
            }

            let path = entry.path().map_err(|e| Error::Extraction {
                image: id.to_string(),
                reason: e.to_string(),
            })?;
            let path_str = path.to_string_lossy();
            // SECURITY: reject traversal and absolute paths before unpack
            if path_str.contains("..") || path_str.starts_with('/') {
                let _ = fs::remove_dir_all(&rootfs);
                return Err(Error::PathTraversal {
                    path: path_str.to_string(),
                });
            }

            total += entry.header().size().unwrap_or(0);
            if total > MAX_ROOTFS_SIZE {
                let _ = fs::remove_dir_all(&rootfs);
                return Err(Error::RootfsTooLarge {
                    size: total,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            entry.unpack_in(&rootfs).map_err(|e| Error::Extraction {
                image: id.to_string(),
                reason: e.to_string(),
            })?;
        }

        // Marker written only after full success; rename is atomic.
        let marker = self.store.marker_path(id);
        let tmp = marker.with_extension("tmp");
        fs::write(&tmp, verifier::normalize_digest(digest))?;
        fs::rename(&tmp, &marker)?;

        debug!(image = %id, entries, bytes = total, "extraction complete");
        Ok(())
    }

    // =========================================================================
    // Local Install
    // =========================================================================

    /// Verifies and extracts a locally provided archive (e.g. a bundled
    /// image shipped with the host application) without downloading.
    ///
    /// `expected_digest` of `None` skips verification, for archives
    /// trusted by provenance.
    pub async fn install_from_archive(
        &self,
        id: &ImageId,
        archive: &Path,
        expected_digest: Option<&str>,
    ) -> Result<PathBuf> {
        let lock = self.image_lock(id).await;
        let _guard = lock.lock().await;

        if self.store.is_ready(id) {
            return Ok(self.store.rootfs_dir(id));
        }

        fs::create_dir_all(self.store.image_dir(id)).map_err(|e| Error::StorageInit {
            path: self.store.image_dir(id),
            reason: e.to_string(),
        })?;

        let digest = match expected_digest {
            Some(digest) => {
                self.set_status(id, RootfsStatus::Verifying);
                if let Err(e) = verifier::verify_file(archive, digest) {
                    self.set_status(
                        id,
                        RootfsStatus::Failed {
                            reason: e.to_string(),
                        },
                    );
                    return Err(e);
                }
                digest.to_string()
            }
            // Trusted by provenance; the marker still needs the actual
            // digest so a later manifest entry can be compared against it.
            None => verifier::digest_file(archive)?,
        };

        self.set_status(id, RootfsStatus::Extracting);
        if let Err(e) = self.extract(id, archive, &digest) {
            self.set_status(
                id,
                RootfsStatus::Failed {
                    reason: e.to_string(),
                },
            );
            return Err(e);
        }

        self.set_status(id, RootfsStatus::Ready);
        info!(image = %id, "local archive installed");
        Ok(self.store.rootfs_dir(id))
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Removes an image's on-disk data.
    ///
    /// Rejected with [`Error::ImageInUse`] while any non-terminal session
    /// references the image. Never invoked automatically.
    pub async fn evict(&self, id: &ImageId, refs: &dyn ImageRefCounts) -> Result<()> {
        let lock = self.image_lock(id).await;
        let _guard = lock.lock().await;

        let active = refs.active_references(id).await;
        if active > 0 {
            return Err(Error::ImageInUse {
                image: id.to_string(),
                refs: active,
            });
        }

        let dir = self.store.image_dir(id);
        if dir.exists() {
            // Remove the marker first so a crash mid-removal cannot leave
            // a Ready-looking tree behind.
            let _ = fs::remove_file(self.store.marker_path(id));
            fs::remove_dir_all(&dir)?;
        }
        self.set_status(id, RootfsStatus::NotPresent);
        info!(image = %id, "image evicted");
        Ok(())
    }
}
