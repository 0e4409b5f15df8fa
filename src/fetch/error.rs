//! Error types for the fetch orchestrator.

use thiserror::Error;

use super::api::ApiError;
use crate::session::StoreError;

/// Errors that end a fetch run.
///
/// Every variant is persisted on the fetch task record before the run
/// returns, so status queries reflect the failure even after a crash.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Session or article persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The upstream rejected the session's credentials.
    #[error("authentication failed: {message}")]
    Auth {
        /// The upstream's message, surfaced verbatim.
        message: String,
    },

    /// The upstream kept rate-limiting past the retry budget.
    #[error("rate limited by upstream, gave up after {attempts} attempts")]
    RateLimitExhausted {
        /// Attempts made against the same page.
        attempts: u32,
    },

    /// An unrecoverable listing response (bad status or shape).
    #[error("listing request failed: {0}")]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let error = FetchError::RateLimitExhausted { attempts: 5 };
        let msg = error.to_string();
        assert!(msg.contains("rate limited"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_auth_error_carries_upstream_message() {
        let error = FetchError::Auth {
            message: "token expired".to_string(),
        };
        assert!(error.to_string().contains("token expired"));
    }
}
