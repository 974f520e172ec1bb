//! Shared test fixtures: in-memory transport, process-free bridge, and
//! recording session store.

#![allow(dead_code)]

use async_trait::async_trait;
use droidbox::bridge::{BridgeHandle, ExecOutput, IoChannel, LaunchSpec, NativeBridge};
use droidbox::persist::{SessionRecord, SessionStore};
use droidbox::session::{SessionId, SessionState};
use droidbox::transport::{DownloadTransport, FetchResponse};
use droidbox::{Error, ImageDescriptor, ImageId, Result, RootfsManifest};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Archives
// =============================================================================

/// Builds a gzipped tar archive from `(path, contents)` pairs.
pub fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut tar = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        // Write the name field raw: `append_data`/`set_path` refuse `..`
        // components, which the traversal tests must embed.
        let name = path.as_bytes();
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, contents.as_bytes()).unwrap();
    }
    let tar_bytes = tar.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// A minimal valid rootfs archive.
pub fn sample_archive() -> Vec<u8> {
    build_archive(&[
        ("etc/os-release", "ID=testdistro\n"),
        ("bin/sh", "#!/bin/sh\n"),
    ])
}

/// A single-image manifest for `payload` served at `url`.
pub fn manifest_for(image: &ImageId, url: &str, payload: &[u8]) -> RootfsManifest {
    let mut images = BTreeMap::new();
    images.insert(
        image.clone(),
        ImageDescriptor {
            url: url.to_string(),
            digest: droidbox::verifier::digest_bytes(payload),
            size_bytes: payload.len() as u64,
        },
    );
    RootfsManifest { images }
}

pub fn test_image() -> ImageId {
    "testdistro-1.0-arm64".parse().unwrap()
}

// =============================================================================
// Mock Transport
// =============================================================================

/// In-memory transport over a fixed payload, with programmable failure
/// injection and range support.
pub struct MockTransport {
    payload: Vec<u8>,
    chunk_size: usize,
    /// Delay before each chunk, to widen concurrency windows in tests.
    chunk_delay: Option<Duration>,
    supports_range: bool,
    /// If set, the next transfer errors after serving this many bytes.
    fail_after: Mutex<Option<u64>>,
    /// Offsets of every fetch call, in order.
    pub offsets: Mutex<Vec<u64>>,
    pub fetch_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            chunk_size: 64 * 1024,
            chunk_delay: None,
            supports_range: true,
            fail_after: Mutex::new(None),
            offsets: Mutex::new(Vec::new()),
            fetch_count: AtomicUsize::new(0),
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.supports_range = false;
        self
    }

    /// Arms a one-shot failure after `bytes` of the next transfer.
    pub fn fail_after(&self, bytes: u64) {
        *self.fail_after.lock().unwrap() = Some(bytes);
    }

    pub fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadTransport for MockTransport {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().unwrap().push(offset);

        let resumed = offset > 0 && self.supports_range;
        let start = if resumed { offset as usize } else { 0 };
        let body = self.payload[start.min(self.payload.len())..].to_vec();

        let fail_after = self.fail_after.lock().unwrap().take();
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;
        let url = url.to_string();

        let mut chunks: Vec<Result<Vec<u8>>> = Vec::new();
        let mut served = 0u64;
        let mut truncated = false;
        for chunk in body.chunks(chunk_size) {
            if let Some(limit) = fail_after {
                if served >= limit {
                    chunks.push(Err(Error::Transport {
                        url: url.clone(),
                        reason: "injected failure".to_string(),
                    }));
                    truncated = true;
                    break;
                }
            }
            served += chunk.len() as u64;
            chunks.push(Ok(chunk.to_vec()));
        }
        if !truncated {
            if let Some(limit) = fail_after {
                // Limit beyond payload length still injects at the end.
                if served >= limit {
                    chunks.push(Err(Error::Transport {
                        url: url.clone(),
                        reason: "injected failure".to_string(),
                    }));
                }
            }
        }

        let total_len = Some(body.len() as u64);
        let stream = futures::stream::iter(chunks);
        let stream: futures::stream::BoxStream<'static, Result<Vec<u8>>> =
            if let Some(delay) = chunk_delay {
                use futures::StreamExt;
                stream
                    .then(move |chunk| async move {
                        tokio::time::sleep(delay).await;
                        chunk
                    })
                    .boxed()
            } else {
                use futures::StreamExt;
                stream.boxed()
            };

        Ok(FetchResponse {
            stream,
            total_len,
            resumed,
        })
    }
}

// =============================================================================
// Fake Bridge
// =============================================================================

/// How the fake bridge behaves during session startup.
#[derive(Debug, Clone, Copy)]
pub enum FakeBehavior {
    /// Spawns and becomes ready.
    Healthy,
    /// Spawn itself fails.
    SpawnFails,
    /// Spawns but never signals readiness.
    StartupTimesOut,
    /// Spawns and exits with this code before readiness.
    ExitsDuringStartup(i32),
}

/// Process-free [`NativeBridge`]: sessions are watch channels the test
/// drives directly.
pub struct FakeBridge {
    behavior: FakeBehavior,
    next_pid: AtomicI32,
    exit_senders: Mutex<HashMap<i32, watch::Sender<Option<i32>>>>,
    pub specs: Mutex<Vec<LaunchSpec>>,
    pub terminations: AtomicUsize,
    pub exec_commands: Mutex<Vec<Vec<String>>>,
}

impl FakeBridge {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            // Far above any real pid range, so stray signals hit nothing.
            next_pid: AtomicI32::new(900_000_000),
            exit_senders: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            terminations: AtomicUsize::new(0),
            exec_commands: Mutex::new(Vec::new()),
        }
    }

    /// Simulates the supervised process exiting on its own.
    pub fn send_exit(&self, pid: i32, code: i32) {
        if let Some(tx) = self.exit_senders.lock().unwrap().get(&pid) {
            let _ = tx.send(Some(code));
        }
    }

    fn silent_io() -> IoChannel {
        IoChannel {
            stdin: Box::new(tokio::io::sink()),
            stdout: Box::new(tokio::io::empty()),
            stderr: Box::new(tokio::io::empty()),
        }
    }
}

#[async_trait]
impl NativeBridge for FakeBridge {
    async fn initialize(&self, spec: &LaunchSpec) -> Result<BridgeHandle> {
        if matches!(self.behavior, FakeBehavior::SpawnFails) {
            return Err(Error::Spawn {
                reason: "injected spawn failure".to_string(),
            });
        }
        self.specs.lock().unwrap().push(spec.clone());

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        if let FakeBehavior::ExitsDuringStartup(code) = self.behavior {
            let _ = tx.send(Some(code));
        }
        self.exit_senders.lock().unwrap().insert(pid, tx);

        Ok(BridgeHandle::new(
            pid,
            rx,
            Self::silent_io(),
            spec.rootfs.clone(),
            spec.runtime_dir.clone(),
        ))
    }

    async fn wait_ready(&self, handle: &BridgeHandle) -> Result<()> {
        if let Some(code) = handle.exit_code() {
            return Err(Error::UnexpectedExit { code });
        }
        match self.behavior {
            FakeBehavior::StartupTimesOut => Err(Error::StartupTimeout {
                timeout: Duration::from_secs(30),
            }),
            _ => Ok(()),
        }
    }

    async fn terminate(&self, handle: &BridgeHandle) -> Result<i32> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = handle.exit_code() {
            return Ok(code);
        }
        self.send_exit(handle.pid(), 0);
        Ok(handle.wait_exit().await)
    }

    async fn exec(&self, _handle: &BridgeHandle, command: &[String]) -> Result<ExecOutput> {
        self.exec_commands.lock().unwrap().push(command.to_vec());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: b"ok\n".to_vec(),
            stderr: Vec::new(),
        })
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory [`SessionStore`] recording every write, with optional
/// transient failure injection.
pub struct MemoryStore {
    records: Mutex<BTreeMap<SessionId, SessionRecord>>,
    /// States in upsert order, across all sessions.
    pub upserts: Mutex<Vec<(SessionId, SessionState)>>,
    /// Number of upcoming upserts that fail with a transient error.
    pub fail_next: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            upserts: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Pre-seeds a record, as if persisted by a previous host run.
    pub fn seed(&self, record: SessionRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    pub fn states_for(&self, id: SessionId) -> Vec<SessionState> {
        self.upserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(rec_id, _)| *rec_id == id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn record(&self, id: SessionId) -> Option<SessionRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Persistence("injected write failure".to_string()));
        }
        self.upserts
            .lock()
            .unwrap()
            .push((record.id, record.state.clone()));
        self.records
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        self.records.lock().unwrap().remove(&id);
        Ok(())
    }
}
