//! Bounded-concurrency download queue for article content and images.
//!
//! Each session gets its own queue of `(article, status)` pairs processed
//! by a small fixed pool of workers. Ordering is first-in-first-out over
//! the caller-supplied article set: the next `pending` entry is always the
//! earliest one, so absent stops, articles download in listing order.
//!
//! Stops are advisory and polled at every scheduling decision; per-entry
//! failures never abort the rest of the queue. A consecutive-failure
//! counter detects systemic failure (content host down, connectivity loss)
//! and pauses the scheduler before it resumes.

mod client;
mod error;
mod worker;

pub use client::{ContentClient, HttpContentClient};
pub use error::DownloadError;
pub use worker::DownloadOutcome;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::session::{SessionStore, TaskStatus};

/// Tunables for the download queue.
///
/// Concurrency and the per-article cap are configuration rather than
/// architectural invariants; scale them to the deployment.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum concurrent article downloads per session.
    pub concurrency: usize,
    /// Byte budget per article across content and images.
    pub per_article_cap_bytes: u64,
    /// Overall per-request timeout against content hosts.
    pub request_timeout: Duration,
    /// Consecutive failures that trigger a cooldown pause.
    pub failure_pause_threshold: u32,
    /// Length of the cooldown pause.
    pub failure_pause: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            per_article_cap_bytes: 20 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            failure_pause_threshold: 5,
            failure_pause: Duration::from_secs(60),
        }
    }
}

/// Lifecycle of one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Waiting for a worker slot.
    Pending,
    /// A worker is fetching it.
    Downloading,
    /// Content (and images, as far as the cap allowed) are on disk.
    Completed,
    /// The entry failed; the rest of the queue is unaffected.
    Error,
}

impl EntryStatus {
    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One article in the queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The article key.
    pub saved_id: String,
    /// Current lifecycle status.
    pub status: EntryStatus,
    /// Error message, when the entry failed.
    pub error: Option<String>,
}

impl QueueEntry {
    fn pending(saved_id: &str) -> Self {
        Self {
            saved_id: saved_id.to_string(),
            status: EntryStatus::Pending,
            error: None,
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.status = EntryStatus::Error;
        self.error = Some(message.into());
    }
}

/// Result of one queue run.
#[derive(Debug, Clone)]
pub struct DownloadRun {
    /// Final task status (`Completed`, `Stopped`, or `Error`).
    pub status: TaskStatus,
    /// Per-entry outcomes in queue order.
    pub entries: Vec<QueueEntry>,
}

/// The per-session download queue runner.
///
/// Cheap to clone; clones share the store and content client.
#[derive(Clone)]
pub struct Downloader {
    store: Arc<SessionStore>,
    client: Arc<dyn ContentClient>,
    config: DownloadConfig,
}

impl Downloader {
    /// Creates a downloader over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        client: Arc<dyn ContentClient>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Runs the queue over the given article set until it drains or stops.
    ///
    /// Entries whose content file already exists are marked completed up
    /// front without a network call, making re-runs idempotent. The final
    /// task status is `Completed` when at least one entry succeeded (or the
    /// set was empty), `Error` only when every entry failed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Store`] when task state cannot be
    /// persisted; per-entry download failures are recorded on the entries,
    /// not returned.
    #[instrument(skip(self, saved_ids), fields(articles = saved_ids.len()))]
    pub async fn run(
        &self,
        session_id: &str,
        saved_ids: &[String],
    ) -> Result<DownloadRun, DownloadError> {
        let total = saved_ids.len() as u64;
        self.store
            .update_download_task(session_id, move |task| {
                task.status = TaskStatus::Running;
                task.error = None;
                task.total = total;
            })
            .await?;
        info!("download run started");

        // Seed in caller order; already-downloaded articles complete up front.
        let mut entries: Vec<QueueEntry> = saved_ids
            .iter()
            .map(|saved_id| {
                let mut entry = QueueEntry::pending(saved_id);
                if self.store.has_content(session_id, saved_id) {
                    debug!(saved_id = %saved_id, "already downloaded, completing up front");
                    entry.status = EntryStatus::Completed;
                }
                entry
            })
            .collect();
        self.persist_count(session_id, saved_ids).await?;

        let mut workers: JoinSet<(usize, Result<DownloadOutcome, DownloadError>)> = JoinSet::new();
        let mut consecutive_failures = 0u32;

        loop {
            // Re-read the persisted status at every scheduling decision; an
            // external stop marks whatever has not finished and halts.
            let task = self.store.load(session_id)?.download_task;
            if task.status == TaskStatus::Stopped {
                workers.abort_all();
                for entry in &mut entries {
                    if matches!(entry.status, EntryStatus::Pending | EntryStatus::Downloading) {
                        entry.fail("stopped by user");
                    }
                }
                info!("download stopped by external request");
                self.finish(session_id, saved_ids, TaskStatus::Stopped, None)
                    .await?;
                return Ok(DownloadRun {
                    status: TaskStatus::Stopped,
                    entries,
                });
            }

            while workers.len() < self.config.concurrency {
                let Some(index) = entries
                    .iter()
                    .position(|entry| entry.status == EntryStatus::Pending)
                else {
                    break;
                };
                entries[index].status = EntryStatus::Downloading;

                let saved_id = entries[index].saved_id.clone();
                let current = saved_id.clone();
                self.store
                    .update_download_task(session_id, move |task| {
                        task.current_id = Some(current.clone());
                    })
                    .await?;

                let store = Arc::clone(&self.store);
                let client = Arc::clone(&self.client);
                let config = self.config.clone();
                let session_id = session_id.to_string();
                workers.spawn(async move {
                    let result = worker::download_article(
                        &store,
                        client.as_ref(),
                        &config,
                        &session_id,
                        &saved_id,
                    )
                    .await;
                    (index, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break; // Queue drained.
            };

            match joined {
                Ok((index, Ok(outcome))) => {
                    debug!(
                        saved_id = %entries[index].saved_id,
                        images = outcome.images_downloaded,
                        skipped = outcome.images_skipped,
                        already = outcome.already_downloaded,
                        "entry completed"
                    );
                    entries[index].status = EntryStatus::Completed;
                    consecutive_failures = 0;
                }
                Ok((index, Err(e))) => {
                    warn!(saved_id = %entries[index].saved_id, error = %e, "entry failed");
                    entries[index].fail(e.to_string());
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.failure_pause_threshold {
                        warn!(
                            consecutive = consecutive_failures,
                            pause_secs = self.config.failure_pause.as_secs(),
                            "consecutive failures suggest a systemic problem, pausing"
                        );
                        tokio::time::sleep(self.config.failure_pause).await;
                        consecutive_failures = 0;
                    }
                }
                Err(e) => {
                    // A panicked worker loses its index; the stuck entry is
                    // resolved after the drain below.
                    warn!(error = %e, "download worker terminated abnormally");
                }
            }

            self.persist_count(session_id, saved_ids).await?;
        }

        for entry in &mut entries {
            if entry.status == EntryStatus::Downloading {
                entry.fail("worker terminated unexpectedly");
            }
        }

        let any_completed = entries
            .iter()
            .any(|entry| entry.status == EntryStatus::Completed);
        let (status, error) = if any_completed || entries.is_empty() {
            (TaskStatus::Completed, None)
        } else {
            (TaskStatus::Error, Some("all downloads failed".to_string()))
        };
        self.finish(session_id, saved_ids, status, error).await?;

        info!(status = %status, "download run finished");
        Ok(DownloadRun { status, entries })
    }

    /// Downloads a single article outside a queue run.
    ///
    /// Same idempotent behavior as a queue entry: existing content reports
    /// `already_downloaded` without a network call.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the record is missing or the content
    /// fetch fails.
    #[instrument(skip(self))]
    pub async fn download_single(
        &self,
        session_id: &str,
        saved_id: &str,
    ) -> Result<DownloadOutcome, DownloadError> {
        worker::download_article(
            &self.store,
            self.client.as_ref(),
            &self.config,
            session_id,
            saved_id,
        )
        .await
    }

    /// Persists the disk-derived progress count.
    async fn persist_count(
        &self,
        session_id: &str,
        saved_ids: &[String],
    ) -> Result<(), DownloadError> {
        let count = saved_ids
            .iter()
            .filter(|saved_id| self.store.has_content(session_id, saved_id))
            .count() as u64;
        self.store
            .update_download_task(session_id, move |task| {
                task.count = count;
            })
            .await?;
        Ok(())
    }

    /// Persists the final task state of a run.
    async fn finish(
        &self,
        session_id: &str,
        saved_ids: &[String],
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), DownloadError> {
        let count = saved_ids
            .iter()
            .filter(|saved_id| self.store.has_content(session_id, saved_id))
            .count() as u64;
        self.store
            .update_download_task(session_id, move |task| {
                task.status = status;
                task.count = count;
                task.current_id = None;
                task.error = error.clone();
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_display() {
        assert_eq!(EntryStatus::Pending.to_string(), "pending");
        assert_eq!(EntryStatus::Downloading.to_string(), "downloading");
        assert_eq!(EntryStatus::Completed.to_string(), "completed");
        assert_eq!(EntryStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_download_config_defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.concurrency, 3);
        assert!(config.per_article_cap_bytes > 0);
        assert!(config.failure_pause_threshold > 0);
    }

    #[test]
    fn test_queue_entry_fail_records_message() {
        let mut entry = QueueEntry::pending("save-1");
        entry.fail("timeout downloading https://example.com");
        assert_eq!(entry.status, EntryStatus::Error);
        assert!(entry.error.as_deref().unwrap_or("").contains("timeout"));
    }

    // Scheduler semantics (ordering, stop, concurrency, idempotent seeding)
    // are covered with in-process clients in tests/download_queue.rs.
}
