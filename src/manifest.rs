//! # Rootfs Manifest and Image Identity
//!
//! The manifest is externally produced, read-only input mapping image
//! identifiers to download coordinates:
//!
//! ```json
//! {
//!   "images": {
//!     "ubuntu-22.04-arm64": {
//!       "url": "https://images.example.org/ubuntu-22.04-arm64.tar.gz",
//!       "digest": "sha256:ab12...",
//!       "size_bytes": 524288000
//!     }
//!   }
//! }
//! ```
//!
//! Image identity is the `(distribution, version, architecture)` tuple,
//! rendered as `distro-version-arch`. The rendered form doubles as the
//! per-image directory name in the store, so it is validated against the
//! filesystem-safe allowlist in [`crate::constants`].

use crate::constants::{validate_image_id, MAX_MANIFEST_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// Image Identity
// =============================================================================

/// Identity of a rootfs image: distribution, version, architecture.
///
/// Displayed as `distro-version-arch` (e.g. `ubuntu-22.04-arm64`). The
/// distribution component may itself contain hyphens; version and
/// architecture may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId {
    distro: String,
    version: String,
    arch: String,
}

impl ImageId {
    /// Creates an image id from its components, validating the rendered
    /// form for filesystem safety.
    pub fn new(
        distro: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            distro: distro.into(),
            version: version.into(),
            arch: arch.into(),
        };
        if id.distro.is_empty() || id.version.is_empty() || id.arch.is_empty() {
            return Err(Error::ImageUnknown(id.to_string()));
        }
        validate_image_id(&id.to_string())
            .map_err(|reason| Error::Internal(format!("invalid image id '{id}': {reason}")))?;
        Ok(id)
    }

    /// Distribution name (e.g. `ubuntu`).
    pub fn distro(&self) -> &str {
        &self.distro
    }

    /// Distribution version (e.g. `22.04`).
    pub fn version(&self) -> &str {
        &self.version
    }

    /// CPU architecture (e.g. `arm64`).
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Directory name for this image under the store.
    ///
    /// Identical to the display form; validation at construction
    /// guarantees it is a single safe path component.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.distro, self.version, self.arch)
    }
}

impl FromStr for ImageId {
    type Err = Error;

    /// Parses `distro-version-arch`. The last hyphen-separated component
    /// is the architecture, the second-to-last the version, the rest the
    /// distribution.
    fn from_str(s: &str) -> Result<Self> {
        validate_image_id(s).map_err(|reason| {
            Error::ImageUnknown(format!("{s}: {reason}"))
        })?;
        let mut parts: Vec<&str> = s.rsplitn(3, '-').collect();
        if parts.len() != 3 {
            return Err(Error::ImageUnknown(format!(
                "{s}: expected distro-version-arch"
            )));
        }
        // rsplitn yields [arch, version, distro]
        let arch = parts.remove(0);
        let version = parts.remove(0);
        let distro = parts.remove(0);
        Self::new(distro, version, arch)
    }
}

impl TryFrom<String> for ImageId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Image Descriptor
// =============================================================================

/// Download coordinates for one image: source URL, expected content
/// digest, and advertised size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Source URL of the compressed rootfs archive.
    pub url: String,
    /// Expected SHA-256 digest of the complete archive (`sha256:<hex>`).
    pub digest: String,
    /// Advertised archive size in bytes (used for progress totals).
    pub size_bytes: u64,
}

// =============================================================================
// Manifest
// =============================================================================

/// Read-only mapping of image identifiers to descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootfsManifest {
    /// Image id → descriptor. BTreeMap keeps listing order stable.
    pub images: BTreeMap<ImageId, ImageDescriptor>,
}

impl RootfsManifest {
    /// Parses a manifest from JSON.
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Loads a manifest from a JSON file, bounded by `MAX_MANIFEST_SIZE`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_MANIFEST_SIZE {
            return Err(Error::Serialization(format!(
                "manifest {} exceeds {} bytes",
                path.display(),
                MAX_MANIFEST_SIZE
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Looks up an image descriptor.
    pub fn get(&self, id: &ImageId) -> Result<&ImageDescriptor> {
        self.images
            .get(id)
            .ok_or_else(|| Error::ImageUnknown(id.to_string()))
    }

    /// Iterates over all known image ids.
    pub fn image_ids(&self) -> impl Iterator<Item = &ImageId> {
        self.images.keys()
    }
}

// =============================================================================
// Rootfs Status
// =============================================================================

/// Acquisition status of one rootfs image.
///
/// `Ready` is authoritative only together with the on-disk extraction
/// marker; the manager re-validates the marker before every use because
/// eviction can race with a new session's start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RootfsStatus {
    /// No local data for this image.
    NotPresent,
    /// Download in flight; byte counts are monotonically non-decreasing.
    Downloading { fetched: u64, total: u64 },
    /// Full archive downloaded, digest check in progress.
    Verifying,
    /// Archive verified, unpacking into the store.
    Extracting,
    /// Extracted and marker present; usable by sessions.
    Ready,
    /// Pipeline failed; a fresh `ensure_ready` call retries.
    Failed { reason: String },
}

impl std::fmt::Display for RootfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootfsStatus::NotPresent => write!(f, "not-present"),
            RootfsStatus::Downloading { fetched, total } => {
                write!(f, "downloading {fetched}/{total}")
            }
            RootfsStatus::Verifying => write!(f, "verifying"),
            RootfsStatus::Extracting => write!(f, "extracting"),
            RootfsStatus::Ready => write!(f, "ready"),
            RootfsStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
