//! Shared in-process fakes for orchestrator integration tests.
//!
//! The scripted clients replay a fixed sequence (listing) or a URL-keyed
//! table (content) and record every request, so tests can assert on walk
//! order, sort flips, and call counts without a network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use readstash::session::ItemPayload;
use readstash::{
    ApiError, AuthMaterial, ContentClient, DownloadError, ListingClient, ListingPage, PageRequest,
    SavedItem,
};
use tokio::sync::{Mutex, Notify};

// ==================== listing fixtures ====================

/// One scripted listing response.
pub enum ScriptedListing {
    Page(ListingPage),
    AuthError(String),
    RateLimited(Option<std::time::Duration>),
    CursorNotFound,
    Http(u16),
}

impl ScriptedListing {
    fn realize(self) -> Result<ListingPage, ApiError> {
        match self {
            Self::Page(page) => Ok(page),
            Self::AuthError(message) => Err(ApiError::Auth { message }),
            Self::RateLimited(retry_after) => Err(ApiError::RateLimited { retry_after }),
            Self::CursorNotFound => Err(ApiError::CursorNotFound),
            Self::Http(status) => Err(ApiError::Http { status }),
        }
    }
}

/// Replays a fixed response sequence and records every request.
pub struct ScriptedListingClient {
    responses: Mutex<VecDeque<ScriptedListing>>,
    pub requests: Mutex<Vec<PageRequest>>,
    pub calls: AtomicUsize,
    /// When set, the next call blocks until [`Self::release`] is invoked.
    gate: Option<Arc<Notify>>,
}

impl ScriptedListingClient {
    pub fn new(responses: Vec<ScriptedListing>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// A client whose first call parks until released, for stop-signal tests.
    pub fn gated(responses: Vec<ScriptedListing>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let client = Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
        };
        (client, gate)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn recorded_requests(&self) -> Vec<PageRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ListingClient for ScriptedListingClient {
    async fn list(
        &self,
        _auth: &AuthMaterial,
        request: &PageRequest,
    ) -> Result<ListingPage, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        if call == 0 {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }

        let next = self.responses.lock().await.pop_front();
        match next {
            Some(scripted) => scripted.realize(),
            // Script exhausted: report an empty final page.
            None => Ok(ListingPage {
                has_more: false,
                ..ListingPage::default()
            }),
        }
    }
}

/// Builds a listing item with a deterministic id/url.
pub fn saved_item(saved_id: &str) -> SavedItem {
    SavedItem {
        saved_id: saved_id.to_string(),
        title: format!("Title of {saved_id}"),
        url: format!("https://articles.example.com/{saved_id}"),
        tags: vec!["fixture".to_string()],
        item: ItemPayload::default(),
        ..SavedItem::default()
    }
}

/// Builds a page of the given items.
pub fn page(ids: &[&str], next_cursor: Option<&str>, has_more: bool) -> ScriptedListing {
    ScriptedListing::Page(ListingPage {
        items: ids.iter().map(|id| saved_item(id)).collect(),
        next_cursor: next_cursor.map(ToString::to_string),
        has_more,
        total: None,
    })
}

// ==================== configs tuned for fast tests ====================

/// Rate limiting that never meaningfully waits.
pub fn fast_rate_config() -> readstash::RateLimitConfig {
    readstash::RateLimitConfig {
        hourly_cap: 10_000,
        fast_threshold: 9_000,
        min_delay: std::time::Duration::from_millis(1),
        slow_delay: std::time::Duration::from_millis(1),
        safety_margin: std::time::Duration::from_millis(1),
        max_boost: 20,
        window: std::time::Duration::from_secs(3600),
    }
}

/// Fetch tunables with millisecond backoffs and a low escape threshold.
pub fn fast_fetch_config() -> readstash::FetchConfig {
    readstash::FetchConfig {
        page_size: 5,
        reduced_page_size: 2,
        duplicate_page_threshold: 2,
        max_rate_limit_retries: 3,
        retry_base_delay: std::time::Duration::from_millis(1),
        retry_max_delay: std::time::Duration::from_millis(5),
    }
}

/// Download tunables with a small pool and no failure pause.
pub fn fast_download_config() -> readstash::DownloadConfig {
    readstash::DownloadConfig {
        concurrency: 3,
        per_article_cap_bytes: 1024 * 1024,
        request_timeout: std::time::Duration::from_secs(5),
        failure_pause_threshold: 100,
        failure_pause: std::time::Duration::from_millis(1),
    }
}

// ==================== content fixtures ====================

/// One scripted content response for a URL.
#[derive(Clone)]
pub enum ScriptedContent {
    Body(Vec<u8>),
    Timeout,
    Status(u16),
}

/// URL-keyed content responses; records every fetched URL in order.
pub struct ScriptedContentClient {
    responses: std::sync::Mutex<HashMap<String, ScriptedContent>>,
    fetched: std::sync::Mutex<Vec<String>>,
    /// When set, the first call parks until notified.
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl ScriptedContentClient {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(HashMap::new()),
            fetched: std::sync::Mutex::new(Vec::new()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut client = Self::new();
        client.gate = Some(Arc::clone(&gate));
        (client, gate)
    }

    pub fn script(self, url: &str, response: ScriptedContent) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
        self
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentClient for ScriptedContentClient {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, DownloadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(url.to_string());

        if call == 0 {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }

        let scripted = self.responses.lock().unwrap().get(url).cloned();
        match scripted {
            Some(ScriptedContent::Body(body)) => {
                if body.len() as u64 > max_bytes {
                    Err(DownloadError::too_large(url, max_bytes))
                } else {
                    Ok(body)
                }
            }
            Some(ScriptedContent::Timeout) => Err(DownloadError::timeout(url)),
            Some(ScriptedContent::Status(status)) => Err(DownloadError::http(url, status)),
            None => Err(DownloadError::http(url, 404)),
        }
    }
}
