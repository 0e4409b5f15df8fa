//! HTTP client for fetching original page content and images.
//!
//! Content downloads go directly to the article's host, not through the
//! upstream API, with a bounded per-request timeout and a streaming byte
//! budget: the body is accumulated chunk by chunk and the request aborts
//! as soon as it crosses the caller's limit, so an oversized resource
//! never occupies more memory or bandwidth than the budget allows.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, instrument};

use super::error::DownloadError;

/// Default HTTP connect timeout for content hosts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetch-by-URL access to content hosts.
///
/// The seam between the download queue and the network; tests drive the
/// queue with in-process implementations.
#[async_trait]
pub trait ContentClient: Send + Sync {
    /// Fetches a resource fully into memory, bounded by `max_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::TooLarge`] when the body crosses the
    /// budget, and the matching variant for timeouts, error statuses, and
    /// network failures.
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, DownloadError>;
}

/// Real HTTP implementation of [`ContentClient`].
#[derive(Debug, Clone)]
pub struct HttpContentClient {
    client: reqwest::Client,
}

impl HttpContentClient {
    /// Creates a client with the given overall per-request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }
}

#[async_trait]
impl ContentClient for HttpContentClient {
    #[instrument(skip(self), fields(url = %url, max_bytes))]
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, DownloadError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http(url, status.as_u16()));
        }

        // A Content-Length over budget fails fast without reading the body.
        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(DownloadError::too_large(url, max_bytes));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                }
            })?;
            if body.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(DownloadError::too_large(url, max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), "content fetched");
        Ok(body)
    }
}
