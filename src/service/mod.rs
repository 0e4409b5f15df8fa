//! Collaborator-facing operations over sessions and their tasks.
//!
//! [`ExportService`] is the surface an HTTP layer (or the CLI) calls:
//! start/stop either task, poll status, boost the rate window, delete a
//! session. Polling is the intended status mechanism - persisted state is
//! re-read on every query, which decouples the orchestrators' lifetime
//! from any caller's connection.
//!
//! The service keeps a registry of active worker tasks keyed by session,
//! but the registry is only a cache of handles for stop/cleanup; the disk
//! remains the authority on task state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::download::{ContentClient, DownloadConfig, DownloadError, DownloadOutcome, Downloader};
use crate::fetch::{FetchConfig, Fetcher, ListingClient, QuotaPolicy};
use crate::ratelimit::{RateLimitConfig, RateLimitStatus, RateLimiter};
use crate::session::{
    AuthMaterial, DownloadTask, FetchTask, Session, SessionStore, StoreError, TaskStatus,
};

/// Grouped configuration for the service's subsystems.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Rate limiter tunables.
    pub rate_limit: RateLimitConfig,
    /// Fetch loop tunables.
    pub fetch: FetchConfig,
    /// Download queue tunables.
    pub download: DownloadConfig,
}

/// Errors from service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Session persistence failed or the session is unknown.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A single-article download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Combined session status for polling collaborators.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// The session id.
    pub session_id: String,
    /// Fetch task state as last persisted.
    pub fetch: FetchTask,
    /// Download task state as last persisted.
    pub download: DownloadTask,
    /// Valid article directories on disk right now.
    pub articles_on_disk: u64,
    /// Current rate-limit window occupancy.
    pub rate_limit: RateLimitStatus,
    /// Total bytes persisted for the session.
    pub total_size_bytes: u64,
}

/// The export orchestration service for all sessions under one data root.
pub struct ExportService {
    store: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    fetcher: Fetcher,
    downloader: Downloader,
    /// Active worker handles, keyed by `"{session}/{kind}"`. A cache only.
    active: Arc<DashMap<String, JoinHandle<()>>>,
}

impl ExportService {
    /// Creates the service over the given store, clients, and quota policy.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        listing: Arc<dyn ListingClient>,
        content: Arc<dyn ContentClient>,
        quota: Arc<dyn QuotaPolicy>,
        config: ServiceConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), config.rate_limit));
        let fetcher = Fetcher::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            listing,
            quota,
            config.fetch,
        );
        let downloader = Downloader::new(Arc::clone(&store), content, config.download);
        Self {
            store,
            limiter,
            fetcher,
            downloader,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Returns the underlying session store.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Loads or creates the session for the given credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on persistence failure.
    pub fn open_session(&self, auth: &AuthMaterial) -> Result<Session, ServiceError> {
        Ok(self.store.create_or_load(auth)?)
    }

    /// Starts the fetch orchestrator for a session.
    ///
    /// Idempotent: returns `false` without side effects when a fetch worker
    /// for this session is already active.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    #[instrument(skip(self))]
    pub async fn start_fetch(&self, session_id: &str) -> Result<bool, ServiceError> {
        self.store.load(session_id)?;
        let key = registry_key(session_id, "fetch");
        if self.is_active(&key) {
            debug!("fetch already running");
            return Ok(false);
        }

        let fetcher = self.fetcher.clone();
        let active = Arc::clone(&self.active);
        let id = session_id.to_string();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            // Loop-level failures are already persisted on the task record.
            if let Err(e) = fetcher.run(&id).await {
                warn!(session = %id, error = %e, "fetch run ended with error");
            }
            active.remove(&task_key);
        });
        self.active.insert(key, handle);
        info!("fetch started");
        Ok(true)
    }

    /// Requests a running fetch to stop at its next loop iteration.
    ///
    /// Advisory and idempotent: a task that is not running is left as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    #[instrument(skip(self))]
    pub async fn stop_fetch(&self, session_id: &str) -> Result<(), ServiceError> {
        self.store
            .update_fetch_task(session_id, |task| {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Stopped;
                }
            })
            .await?;
        Ok(())
    }

    /// Starts the download queue for a session over the given article set.
    ///
    /// Only one download run may be active per session; returns `false`
    /// when one already is.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    #[instrument(skip(self, saved_ids), fields(articles = saved_ids.len()))]
    pub async fn start_download(
        &self,
        session_id: &str,
        saved_ids: Vec<String>,
    ) -> Result<bool, ServiceError> {
        self.store.load(session_id)?;
        let key = registry_key(session_id, "download");
        if self.is_active(&key) {
            debug!("download already running");
            return Ok(false);
        }

        let downloader = self.downloader.clone();
        let active = Arc::clone(&self.active);
        let id = session_id.to_string();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = downloader.run(&id, &saved_ids).await {
                warn!(session = %id, error = %e, "download run ended with error");
            }
            active.remove(&task_key);
        });
        self.active.insert(key, handle);
        info!("download started");
        Ok(true)
    }

    /// Requests a running download to stop at its next scheduling decision.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    #[instrument(skip(self))]
    pub async fn stop_download(&self, session_id: &str) -> Result<(), ServiceError> {
        self.store
            .update_download_task(session_id, |task| {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Stopped;
                }
            })
            .await?;
        Ok(())
    }

    /// Downloads one article immediately, outside a queue run.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Download`] on fetch or persistence failure.
    pub async fn download_single(
        &self,
        session_id: &str,
        saved_id: &str,
    ) -> Result<DownloadOutcome, ServiceError> {
        Ok(self.downloader.download_single(session_id, saved_id).await?)
    }

    /// Reports both tasks, on-disk counts, and rate-limit state.
    ///
    /// Always read from persisted state; safe to poll from any number of
    /// callers.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    pub fn get_status(&self, session_id: &str) -> Result<StatusReport, ServiceError> {
        let session = self.store.load(session_id)?;
        Ok(StatusReport {
            session_id: session.id.clone(),
            articles_on_disk: self.store.count_articles(session_id)?,
            rate_limit: self.limiter.status(session_id)?,
            total_size_bytes: self.store.total_size(session_id)?,
            fetch: session.fetch_task,
            download: session.download_task,
        })
    }

    /// Discards up to `count` of the session's oldest request timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the session is unknown.
    pub async fn boost(&self, session_id: &str, count: usize) -> Result<usize, ServiceError> {
        Ok(self.limiter.boost(session_id, count).await?)
    }

    /// Stops any running tasks and removes all persisted session state.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if removal fails.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ServiceError> {
        // Flip both tasks to stopped so a worker that outlives the abort
        // below exits at its next poll instead of resurrecting files.
        match self.stop_fetch(session_id).await {
            Ok(()) | Err(ServiceError::Store(StoreError::SessionNotFound(_))) => {}
            Err(e) => return Err(e),
        }
        match self.stop_download(session_id).await {
            Ok(()) | Err(ServiceError::Store(StoreError::SessionNotFound(_))) => {}
            Err(e) => return Err(e),
        }

        for kind in ["fetch", "download"] {
            if let Some((_, handle)) = self.active.remove(&registry_key(session_id, kind)) {
                handle.abort();
            }
        }

        self.store.delete(session_id)?;
        Ok(())
    }

    /// Whether a live worker is registered under the key.
    fn is_active(&self, key: &str) -> bool {
        if let Some(entry) = self.active.get(key) {
            if !entry.is_finished() {
                return true;
            }
        }
        // Drop any stale handle left by a finished worker.
        self.active.remove_if(key, |_, handle| handle.is_finished());
        false
    }
}

/// Registry key for a session's worker of the given kind.
fn registry_key(session_id: &str, kind: &str) -> String {
    format!("{session_id}/{kind}")
}
