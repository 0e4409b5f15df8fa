//! Error types for the download queue.

use thiserror::Error;

use crate::session::StoreError;

/// Errors from fetching and persisting article content or images.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Request did not complete within the bounded timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response from the content host.
    #[error("HTTP {status} downloading {url}")]
    Http {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Network-level failure (DNS, connect, TLS).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The resource exceeded the remaining per-article byte budget.
    #[error("{url} exceeds the remaining byte budget of {limit}")]
    TooLarge {
        /// The URL of the oversized resource.
        url: String,
        /// The budget that was in effect.
        limit: u64,
    },

    /// No metadata record exists for the requested article.
    #[error("no record on disk for article {saved_id}")]
    MissingRecord {
        /// The article key.
        saved_id: String,
    },

    /// Session or article persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DownloadError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http(url: impl Into<String>, status: u16) -> Self {
        Self::Http {
            url: url.into(),
            status,
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an over-budget error.
    pub fn too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::TooLarge {
            url: url.into(),
            limit,
        }
    }
}
