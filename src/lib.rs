//! # droidbox
//!
//! Lightweight Linux session runtime for mobile-class hosts: downloads
//! and verifies rootfs images, extracts them into a local store, and
//! supervises unprivileged native sessions (proot process trees) inside
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SessionManager                        │
//! │   registry · recovery · event stream · image operations     │
//! └───────┬────────────────────┬───────────────────┬────────────┘
//!         │                    │                   │
//! ┌───────▼───────┐   ┌────────▼────────┐  ┌───────▼────────┐
//! │    Session    │   │  RootfsManager  │  │  TransitionHub │
//! │  state machine│   │ download·verify │  │ persist·publish│
//! └───────┬───────┘   │    ·extract     │  └───────┬────────┘
//!         │           └────────┬────────┘          │
//! ┌───────▼───────┐   ┌────────▼────────┐  ┌───────▼────────┐
//! │  NativeBridge │   │DownloadTransport│  │  SessionStore  │
//! │ (proot trees) │   │   (reqwest)     │  │  (JSON file)   │
//! └───────────────┘   └─────────────────┘  └────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Integrity**: no rootfs is extracted before its archive passes
//!   SHA-256 verification; corrupt artifacts are deleted so retries
//!   start clean.
//! - **Crash safety**: extraction completeness is signaled by a marker
//!   written atomically after success; downloads resume from verified
//!   checkpoints.
//! - **Supervision**: every session process runs in its own process
//!   group, is monitored to exit, and is killed with bounded escalation
//!   on stop. No session tree outlives its handle.
//! - **Durability**: every lifecycle transition is persisted before it
//!   is published; host restarts settle interrupted sessions instead of
//!   leaking orphans.

pub mod bridge;
pub mod constants;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod persist;
pub mod rootfs;
pub mod session;
pub mod transport;
pub mod verifier;

pub use bridge::{BridgeHandle, ExecOutput, IoChannel, LaunchSpec, NativeBridge};
pub use error::{Error, Result};
pub use manager::{SessionEvent, SessionManager};
pub use manifest::{ImageDescriptor, ImageId, RootfsManifest, RootfsStatus};
pub use persist::{JsonFileStore, SessionRecord, SessionStore};
pub use rootfs::{CancelFlag, ImageRefCounts, RootfsManager, RootfsProgress, RootfsStore};
pub use session::{FailureReason, Session, SessionConfig, SessionId, SessionState};
pub use transport::{DownloadTransport, FetchResponse, HttpTransport};
