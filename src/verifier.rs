//! # Streaming Archive Verification
//!
//! Computes and checks SHA-256 digests over archive byte streams in
//! constant memory. Used by the rootfs pipeline twice:
//!
//! - incrementally, while a download is in flight, to checkpoint the
//!   prefix digest for resumable transfers;
//! - over the complete local file, before extraction, as the integrity
//!   gate.
//!
//! ## Restartability
//!
//! A failed verification retains no state: [`StreamingVerifier`] is
//! consumed by [`StreamingVerifier::finish`], and a retry constructs a
//! fresh one. Nothing here can corrupt a subsequent attempt.

use crate::constants::DOWNLOAD_CHUNK_SIZE;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Incremental SHA-256 digest over a byte stream.
///
/// Memory use is constant relative to payload size: only the hasher state
/// and the caller's chunk buffer are held.
pub struct StreamingVerifier {
    hasher: Sha256,
    bytes_seen: u64,
}

impl StreamingVerifier {
    /// Creates a fresh verifier with no accumulated state.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_seen: 0,
        }
    }

    /// Feeds a chunk of the stream into the digest.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Digest of the bytes fed so far, without consuming the verifier.
    ///
    /// Backs the resumable-download checkpoints: the recorded prefix
    /// digest lets a later attempt prove its partial file is a byte-exact
    /// prefix before requesting a range continuation.
    pub fn partial_digest(&self) -> String {
        let clone = self.hasher.clone();
        format!("sha256:{}", hex::encode(clone.finalize()))
    }

    /// Consumes the verifier and returns the final digest.
    pub fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }

    /// Consumes the verifier and checks the digest against `expected`.
    ///
    /// Comparison is case-insensitive on the hex portion. A bare hex
    /// string is treated as `sha256:<hex>`.
    pub fn verify(self, expected: &str) -> Result<()> {
        let computed = self.finish();
        if digests_equal(&computed, expected) {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: normalize_digest(expected),
                computed,
            })
        }
    }
}

impl Default for StreamingVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes a digest string to `sha256:<lowercase hex>`.
pub fn normalize_digest(digest: &str) -> String {
    let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("sha256:{}", hash.to_ascii_lowercase())
}

/// Compares two digest strings, tolerating case and a missing prefix.
pub fn digests_equal(a: &str, b: &str) -> bool {
    normalize_digest(a) == normalize_digest(b)
}

/// Verifies a local file against an expected digest, streaming in
/// fixed-size chunks.
///
/// # Errors
///
/// - [`Error::DigestMismatch`] if the content hash differs
/// - [`Error::Io`] if the file cannot be read
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut verifier = StreamingVerifier::new();
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
    }
    verifier.verify(expected)
}

/// Computes the digest of a local file.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut verifier = StreamingVerifier::new();
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
    }
    Ok(verifier.finish())
}

/// Computes the digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
