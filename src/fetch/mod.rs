//! Cursor-walking fetch orchestrator.
//!
//! Walks the upstream paginated listing with an opaque cursor, writing one
//! record directory per newly discovered article. The loop is strictly
//! sequential per session: the upstream quota makes parallel listing
//! counterproductive, so throughput comes from never re-downloading what is
//! already on disk.
//!
//! # Resumability
//!
//! Every status transition and the pagination cursor are persisted before
//! control returns, and progress counts are recomputed from the article
//! directory rather than kept in memory. Killing the process mid-run and
//! starting a new run against the same session continues from the persisted
//! cursor and converges on the same on-disk set.
//!
//! # Duplicate-run escape
//!
//! The upstream cursor can drift into a region that is already fully
//! captured (e.g. after interleaved inserts), at which point every page
//! comes back with zero new items. Blind continuation would loop without
//! progress, so after a configurable number of all-duplicate pages the
//! orchestrator escalates: flip the sort order and restart, then shrink the
//! page size to skip through the duplicate stretch faster, and finally
//! revert to the original walk and push on from the last known cursor.

pub mod api;
mod error;
mod quota;

pub use api::{
    ApiError, DEFAULT_API_BASE, HttpListingClient, ListingClient, ListingPage, PageRequest,
    SavedItem, SortOrder, parse_retry_after,
};
pub use error::FetchError;
pub use quota::{ArticleLimitQuota, QuotaPolicy, UnlimitedQuota};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::ratelimit::RateLimiter;
use crate::session::{ArticleRecord, AuthMaterial, SCHEMA_VERSION, SessionStore, TaskStatus};

/// Tunables for the fetch loop.
///
/// The duplicate-escape thresholds were tuned empirically against one
/// upstream service; treat them as configuration, not behavior.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Normal listing page size.
    pub page_size: u32,
    /// Shrunken page size used to skip through duplicate stretches.
    pub reduced_page_size: u32,
    /// All-duplicate pages tolerated before the escape strategy escalates.
    pub duplicate_page_threshold: u32,
    /// In-place retries against a rate-limited page before giving up.
    pub max_rate_limit_retries: u32,
    /// Base delay for rate-limit retry backoff.
    pub retry_base_delay: Duration,
    /// Cap on the rate-limit retry backoff.
    pub retry_max_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            reduced_page_size: 10,
            duplicate_page_threshold: 3,
            max_rate_limit_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(64),
        }
    }
}

/// Maximum jitter added to retry backoff delays.
const MAX_RETRY_JITTER: Duration = Duration::from_millis(500);

/// Stages of the duplicate-run escape strategy, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeStage {
    /// Normal walk; no escape active.
    Normal,
    /// Sort order flipped, cursor restarted from the beginning.
    FlippedSort,
    /// Page size shrunk to move through the duplicate stretch faster.
    ReducedPage,
    /// Original order and size restored; continuing from the last cursor.
    Reverted,
}

/// Outcome classification for a single page request.
enum PageFailure {
    /// The cursor was invalidated; restart from the beginning.
    CursorInvalid,
    /// The run cannot continue.
    Fatal(FetchError),
}

/// The per-session fetch orchestrator.
///
/// Cheap to clone; clones share the store, limiter, and clients.
#[derive(Clone)]
pub struct Fetcher {
    store: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    client: Arc<dyn ListingClient>,
    quota: Arc<dyn QuotaPolicy>,
    config: FetchConfig,
}

impl Fetcher {
    /// Creates a fetcher over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        limiter: Arc<RateLimiter>,
        client: Arc<dyn ListingClient>,
        quota: Arc<dyn QuotaPolicy>,
        config: FetchConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            client,
            quota,
            config,
        }
    }

    /// Runs the fetch loop for a session until a terminal state.
    ///
    /// Resumes from the persisted cursor when one exists. Returns the final
    /// task status for deliberate outcomes (`Completed`, `Stopped`); loop
    /// errors are persisted on the task record and also returned.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for authentication failures, exhausted
    /// rate-limit retries, unrecoverable responses, and storage failures.
    #[instrument(skip(self))]
    pub async fn run(&self, session_id: &str) -> Result<TaskStatus, FetchError> {
        let session = self.store.load(session_id)?;
        let auth = session.auth.clone();
        let mut cursor = session.fetch_task.cursor.clone();

        self.store
            .update_fetch_task(session_id, |task| {
                task.status = TaskStatus::Running;
                task.error = None;
            })
            .await?;
        info!(resuming = cursor.is_some(), "fetch run started");

        let original_sort = SortOrder::NewestFirst;
        let mut sort = original_sort;
        let mut page_size = self.config.page_size;
        let mut duplicate_pages = 0u32;
        let mut stage = EscapeStage::Normal;
        // Cursor position before the escape strategy first engaged, used by
        // the final revert step.
        let mut pre_escape_cursor: Option<String> = None;

        loop {
            // Stop requests are advisory and polled: observed here, never
            // pre-empting an in-flight request.
            let task = self.store.load(session_id)?.fetch_task;
            if task.status == TaskStatus::Stopped {
                info!("fetch stopped by external request");
                return Ok(TaskStatus::Stopped);
            }

            let on_disk = self.store.count_articles(session_id)?;
            if let Err(reason) = self.quota.check(on_disk) {
                info!(%reason, "quota denied further fetching");
                self.store
                    .update_fetch_task(session_id, |task| {
                        task.status = TaskStatus::Stopped;
                        task.error = Some(reason.clone());
                    })
                    .await?;
                return Ok(TaskStatus::Stopped);
            }

            let request = PageRequest {
                cursor: cursor.clone(),
                page_size,
                sort,
            };
            let page = match self.request_page(session_id, &auth, &request).await {
                Ok(page) => page,
                Err(PageFailure::CursorInvalid) => {
                    warn!("cursor invalidated by upstream, restarting from the beginning");
                    cursor = None;
                    continue;
                }
                Err(PageFailure::Fatal(e)) => {
                    self.fail(session_id, &e).await?;
                    return Err(e);
                }
            };

            let new_items = self.persist_page(session_id, &page).await?;
            let count = self.store.count_articles(session_id)?;
            let last_id = page.items.last().map(|item| item.saved_id.clone());
            let next_cursor = page.next_cursor.clone();
            let total = page.total;
            self.store
                .update_fetch_task(session_id, move |task| {
                    task.count = count;
                    if let Some(total) = total {
                        task.total = total;
                    }
                    task.cursor = next_cursor.clone();
                    task.current_id = last_id.clone();
                })
                .await?;

            debug!(
                new_items,
                page_items = page.items.len(),
                count,
                has_more = page.has_more,
                "page processed"
            );

            if new_items > 0 {
                duplicate_pages = 0;
                if page_size != self.config.page_size {
                    debug!("new items found, restoring normal page size");
                    page_size = self.config.page_size;
                }
            } else if !page.items.is_empty() {
                duplicate_pages += 1;
                // Once every stage has been tried the walk just pushes on;
                // re-escalating would re-issue the same cursor forever.
                if duplicate_pages >= self.config.duplicate_page_threshold
                    && stage != EscapeStage::Reverted
                {
                    if stage == EscapeStage::Normal {
                        pre_escape_cursor = cursor.clone();
                    }
                    (stage, sort, page_size, cursor) = self.escalate(
                        stage,
                        sort,
                        original_sort,
                        cursor,
                        pre_escape_cursor.clone(),
                    );
                    duplicate_pages = 0;
                    continue;
                }
            }

            if !page.has_more {
                info!(count, "reached the end of the listing");
                self.store
                    .update_fetch_task(session_id, |task| {
                        task.status = TaskStatus::Completed;
                    })
                    .await?;
                return Ok(TaskStatus::Completed);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    // has_more without a cursor cannot advance; treat the
                    // listing as exhausted rather than re-requesting page one.
                    warn!("upstream reported more pages but no cursor, finishing");
                    self.store
                        .update_fetch_task(session_id, |task| {
                            task.status = TaskStatus::Completed;
                        })
                        .await?;
                    return Ok(TaskStatus::Completed);
                }
            }
        }
    }

    /// Issues one listing request, retrying rate-limit responses in place.
    ///
    /// The retry loop is an explicit bounded counter with exponential
    /// backoff plus jitter; a Retry-After from the upstream overrides the
    /// computed backoff.
    async fn request_page(
        &self,
        session_id: &str,
        auth: &AuthMaterial,
        request: &PageRequest,
    ) -> Result<ListingPage, PageFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if let Err(e) = self.limiter.enforce(session_id).await {
                return Err(PageFailure::Fatal(e.into()));
            }

            match self.client.list(auth, request).await {
                Ok(page) => return Ok(page),
                Err(ApiError::Auth { message }) => {
                    return Err(PageFailure::Fatal(FetchError::Auth { message }));
                }
                Err(ApiError::CursorNotFound) => return Err(PageFailure::CursorInvalid),
                Err(ApiError::RateLimited { retry_after }) => {
                    let annotate_retry_after = retry_after.map(|d| d.as_secs());
                    let annotate = self
                        .store
                        .update_fetch_task(session_id, move |task| {
                            task.rate_limited_at = Some(Utc::now());
                            task.rate_limit_retry_after = annotate_retry_after;
                        })
                        .await;
                    if let Err(e) = annotate {
                        return Err(PageFailure::Fatal(e.into()));
                    }

                    if attempt >= self.config.max_rate_limit_retries {
                        return Err(PageFailure::Fatal(FetchError::RateLimitExhausted {
                            attempts: attempt,
                        }));
                    }
                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    warn!(
                        attempt,
                        max = self.config.max_rate_limit_retries,
                        delay_ms = delay.as_millis(),
                        "rate limited by upstream, retrying page"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(PageFailure::Fatal(FetchError::Api(e))),
            }
        }
    }

    /// Writes every new item of a page to disk; returns how many were new.
    ///
    /// Existing records are skipped without a write, which is what makes
    /// re-runs idempotent and duplicate pages detectable.
    async fn persist_page(
        &self,
        session_id: &str,
        page: &ListingPage,
    ) -> Result<usize, FetchError> {
        let mut new_items = 0usize;
        for item in &page.items {
            if self.store.article_exists(session_id, &item.saved_id) {
                continue;
            }

            let record = record_from_item(item);
            self.store.write_article(session_id, record).await?;
            if let Some(content) = &item.content {
                // The embedded page body lives in its own file, not in the
                // metadata record.
                self.store
                    .write_content(session_id, &item.saved_id, content.as_bytes())?;
            }
            new_items += 1;
        }

        if new_items > 0 {
            self.store.write_listing(session_id)?;
        }
        Ok(new_items)
    }

    /// Advances the escape strategy one stage and returns the new walk state.
    fn escalate(
        &self,
        stage: EscapeStage,
        sort: SortOrder,
        original_sort: SortOrder,
        cursor: Option<String>,
        pre_escape_cursor: Option<String>,
    ) -> (EscapeStage, SortOrder, u32, Option<String>) {
        match stage {
            EscapeStage::Normal => {
                warn!("duplicate stretch detected, flipping sort order");
                (
                    EscapeStage::FlippedSort,
                    sort.flipped(),
                    self.config.page_size,
                    None,
                )
            }
            EscapeStage::FlippedSort => {
                warn!("still all duplicates, shrinking page size");
                (
                    EscapeStage::ReducedPage,
                    sort,
                    self.config.reduced_page_size,
                    cursor,
                )
            }
            EscapeStage::ReducedPage => {
                warn!("escape exhausted, reverting to the original walk");
                (
                    EscapeStage::Reverted,
                    original_sort,
                    self.config.page_size,
                    pre_escape_cursor,
                )
            }
            // The run loop stops escalating at this stage; identity keeps
            // the match exhaustive.
            EscapeStage::Reverted => (EscapeStage::Reverted, sort, self.config.page_size, cursor),
        }
    }

    /// Exponential backoff with jitter for in-place page retries.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.retry_base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * 2f64.powf(exponent);
        let capped_ms = delay_ms.min(self.config.retry_max_delay.as_millis() as f64);

        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_RETRY_JITTER.as_millis() as u64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + Duration::from_millis(jitter_ms)
    }

    /// Persists a terminal error on the fetch task, preserving the cursor.
    async fn fail(&self, session_id: &str, error: &FetchError) -> Result<(), FetchError> {
        let message = error.to_string();
        warn!(%message, "fetch run failed");
        self.store
            .update_fetch_task(session_id, move |task| {
                task.status = TaskStatus::Error;
                task.error = Some(message.clone());
            })
            .await?;
        Ok(())
    }
}

/// Builds a metadata record from a listing item.
fn record_from_item(item: &SavedItem) -> ArticleRecord {
    ArticleRecord {
        schema_version: SCHEMA_VERSION,
        saved_id: item.saved_id.clone(),
        created_at: item.created_at.unwrap_or_else(Utc::now),
        title: item.title.clone(),
        url: item.url.clone(),
        tags: item.tags.clone(),
        item: item.item.clone(),
    }
}
