//! # Download Transport
//!
//! Abstraction over the byte-range transfer layer used by the rootfs
//! pipeline. The trait keeps the pipeline testable (in-memory transports
//! with programmable failure points) and keeps transport-level failures
//! distinct from verification failures.
//!
//! [`HttpTransport`] is the production implementation: streaming HTTPS
//! via reqwest, with `Range` continuation for resumed transfers.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

/// One chunk of archive bytes, or a transport failure.
pub type ByteChunk = Result<Vec<u8>>;

/// An open transfer: a chunk stream plus response metadata.
pub struct FetchResponse {
    /// Chunked body; chunk sizes are transport-determined.
    pub stream: BoxStream<'static, ByteChunk>,
    /// Total payload length if the server advertised one. For a resumed
    /// transfer this counts the remaining bytes only.
    pub total_len: Option<u64>,
    /// True if the server honored the requested offset; false means the
    /// stream restarts from byte zero and any partial data must be
    /// discarded.
    pub resumed: bool,
}

/// Transport collaborator: supplies byte ranges given a URL and an
/// optional starting offset.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Opens a transfer starting at `offset` (0 = full payload).
    ///
    /// Implementations that cannot serve ranges return the full payload
    /// with `resumed: false`; the caller restarts from zero.
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse>;
}

/// HTTPS transport over reqwest with streaming bodies.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownloadTransport for HttpTransport {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| Error::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                url: url.to_string(),
                reason: format!("HTTP status {status}"),
            });
        }

        // 206 means the server honored the range; a 200 on a ranged
        // request restarts the payload from zero.
        let resumed = offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !resumed {
            warn!(url, offset, "server ignored range request, restarting from zero");
        }

        let total_len = response.content_length();
        debug!(url, offset, resumed, ?total_len, "transfer opened");

        let url_owned = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map(|b| b.to_vec()).map_err(|e| Error::Transport {
                    url: url_owned.clone(),
                    reason: e.to_string(),
                })
            })
            .boxed();

        Ok(FetchResponse {
            stream,
            total_len,
            resumed,
        })
    }
}
