//! Upstream listing API client.
//!
//! The upstream bookmarking service exposes a cursor-paginated listing
//! endpoint: one POST per page carrying a sort order, page size, and the
//! opaque cursor from the previous page. Cursors must be round-tripped
//! exactly; the service can invalidate them at any time, which surfaces as
//! [`ApiError::CursorNotFound`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::session::{AuthMaterial, ItemPayload};

/// Default base URL of the upstream service.
pub const DEFAULT_API_BASE: &str = "https://api.readstash.app";

/// Listing endpoint path under the base URL.
const LIST_PATH: &str = "/v1/saves/list";

/// HTTP connect timeout for listing requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall per-request timeout for listing requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum Retry-After value honored (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Upstream error code for an invalidated pagination cursor.
const CURSOR_NOT_FOUND_CODE: &str = "cursor_not_found";

/// Listing sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    /// Most recently saved first (the default walk direction).
    NewestFirst,
    /// Oldest saved first.
    OldestFirst,
}

impl SortOrder {
    /// Returns the opposite order.
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::NewestFirst => Self::OldestFirst,
            Self::OldestFirst => Self::NewestFirst,
        }
    }
}

/// One page request against the listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// Cursor from the previous page; `None` requests the first page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Requested page size.
    pub page_size: u32,
    /// Requested sort order.
    pub sort: SortOrder,
}

/// One saved article as returned by the listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedItem {
    /// Upstream item key.
    pub saved_id: String,
    /// When the user saved the article.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Article title.
    #[serde(default)]
    pub title: String,
    /// Canonical article URL.
    #[serde(default)]
    pub url: String,
    /// Tag set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Upstream-defined nested payload.
    #[serde(default)]
    pub item: ItemPayload,
    /// Full page body, when the upstream embeds it in the listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One page of listing results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage {
    /// Items on this page.
    #[serde(default)]
    pub items: Vec<SavedItem>,
    /// Cursor for the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether a further page exists.
    #[serde(default)]
    pub has_more: bool,
    /// Upstream's estimate of the library size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Error envelope the upstream returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Errors from the listing endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credentials were rejected; terminal for the run.
    #[error("authentication failed: {message}")]
    Auth {
        /// The upstream's message, surfaced verbatim.
        message: String,
    },

    /// The upstream rate-limited the request.
    #[error("rate limited by upstream")]
    RateLimited {
        /// Parsed Retry-After delay, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// The pagination cursor was invalidated by the upstream.
    #[error("pagination cursor not found")]
    CursorNotFound,

    /// Unexpected HTTP error status.
    #[error("upstream returned HTTP {status}")]
    Http {
        /// The HTTP status code.
        status: u16,
    },

    /// Network-level failure (DNS, connect, TLS, timeout).
    #[error("network error talking to upstream: {source}")]
    Network {
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Response body did not match the expected shape.
    #[error("invalid upstream response: {message}")]
    InvalidResponse {
        /// What failed to parse.
        message: String,
    },
}

/// Cursor-paginated listing access.
///
/// The seam between the fetch loop and the network; tests drive the loop
/// with in-process implementations.
#[async_trait]
pub trait ListingClient: Send + Sync {
    /// Fetches one page of the saved-article listing.
    async fn list(&self, auth: &AuthMaterial, request: &PageRequest)
    -> Result<ListingPage, ApiError>;
}

/// Real HTTP implementation of [`ListingClient`].
#[derive(Debug, Clone)]
pub struct HttpListingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpListingClient {
    /// Creates a client against the given base URL.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{LIST_PATH}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ListingClient for HttpListingClient {
    #[instrument(skip(self, auth), fields(cursor = ?request.cursor, page_size = request.page_size))]
    async fn list(
        &self,
        auth: &AuthMaterial,
        request: &PageRequest,
    ) -> Result<ListingPage, ApiError> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&auth.token)
            .json(request);
        for (name, value) in &auth.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|source| ApiError::Network { source })?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Auth { message });
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(ApiError::RateLimited { retry_after });
        }

        if !status.is_success() {
            // A cursor invalidation arrives as an error envelope with a
            // dedicated code; everything else is an opaque HTTP failure.
            let body = response.text().await.unwrap_or_default();
            if let Ok(envelope) = serde_json::from_str::<ErrorBody>(&body) {
                if envelope.error.code == CURSOR_NOT_FOUND_CODE {
                    debug!("upstream invalidated the pagination cursor");
                    return Err(ApiError::CursorNotFound);
                }
                warn!(status = status.as_u16(), code = %envelope.error.code,
                      message = %envelope.error.message, "upstream error response");
            }
            return Err(ApiError::Http {
                status: status.as_u16(),
            });
        }

        response
            .json::<ListingPage>()
            .await
            .map_err(|e| ApiError::InvalidResponse {
                message: e.to_string(),
            })
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats: integer seconds and HTTP-date. Returns
/// `None` for unparseable values; caps excessive values at one hour.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        return match datetime.duration_since(now) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            // Date in the past: no further wait required.
            Err(_) => Some(Duration::ZERO),
        };
    }

    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== SortOrder Tests ====================

    #[test]
    fn test_sort_order_flipped() {
        assert_eq!(SortOrder::NewestFirst.flipped(), SortOrder::OldestFirst);
        assert_eq!(SortOrder::OldestFirst.flipped(), SortOrder::NewestFirst);
    }

    #[test]
    fn test_sort_order_wire_format() {
        assert_eq!(
            serde_json::to_string(&SortOrder::NewestFirst).unwrap(),
            "\"newestFirst\""
        );
    }

    // ==================== Wire Shape Tests ====================

    #[test]
    fn test_page_request_omits_missing_cursor() {
        let request = PageRequest {
            cursor: None,
            page_size: 30,
            sort: SortOrder::NewestFirst,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("cursor").is_none());
        assert_eq!(json.get("pageSize").unwrap(), 30);
    }

    #[test]
    fn test_listing_page_parses_minimal_body() {
        let page: ListingPage = serde_json::from_str("{}").unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_listing_page_parses_full_body() {
        let body = serde_json::json!({
            "items": [{
                "savedId": "save-1",
                "title": "A Title",
                "url": "https://example.com/a",
                "tags": ["rust"],
                "item": {"domain": "example.com", "wordCount": 42},
                "content": "<html></html>"
            }],
            "nextCursor": "cursor-2",
            "hasMore": true,
            "total": 120
        });
        let page: ListingPage = serde_json::from_value(body).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].saved_id, "save-1");
        assert_eq!(page.items[0].item.domain.as_deref(), Some("example.com"));
        assert_eq!(page.items[0].item.extra.get("wordCount").unwrap(), 42);
        assert_eq!(page.next_cursor.as_deref(), Some("cursor-2"));
        assert!(page.has_more);
        assert_eq!(page.total, Some(120));
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_zero() {
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let header = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed >= Duration::from_secs(55) && parsed <= Duration::from_secs(65));
    }

    // ==================== Endpoint Tests ====================

    #[test]
    fn test_endpoint_handles_trailing_slash() {
        let client = HttpListingClient::new("https://api.example.com/");
        assert_eq!(client.endpoint(), "https://api.example.com/v1/saves/list");
    }
}
