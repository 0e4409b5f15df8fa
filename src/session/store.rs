//! Directory-backed store for sessions and article records.
//!
//! Layout per session, rooted at the store's data directory:
//!
//! ```text
//! <root>/<session-id>/session.json              session record
//! <root>/<session-id>/articles.json             aggregate id listing
//! <root>/<session-id>/articles/<saved-id>/record.json
//! <root>/<session-id>/articles/<saved-id>/content.html   (after download)
//! <root>/<session-id>/articles/<saved-id>/image-*.{ext}  (after download)
//! ```
//!
//! The directory tree is the single source of truth. Progress counters are
//! recomputed by scanning it rather than cached, so status stays correct
//! across crashes and concurrent writers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::{ArticleRecord, AuthMaterial, DownloadTask, FetchTask, RateWindow, SCHEMA_VERSION, Session};
use crate::storage::{self, StorageError};

/// File name of the per-session record.
const SESSION_FILE: &str = "session.json";

/// File name of the aggregate article id listing.
const LISTING_FILE: &str = "articles.json";

/// File name of an article's metadata record.
const RECORD_FILE: &str = "record.json";

/// File name of an article's downloaded page content.
const CONTENT_FILE: &str = "content.html";

/// Hex characters of the token hash used as the session identifier.
const SESSION_ID_LEN: usize = 16;

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No session record exists for the given id.
    #[error("unknown session: {0}")]
    SessionNotFound(String),

    /// Filesystem operation outside record persistence failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Aggregate listing of known article identifiers for fast enumeration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleListing {
    /// Record schema version.
    pub schema_version: u32,
    /// Known article ids, sorted.
    pub article_ids: Vec<String>,
    /// When the listing was last refreshed.
    pub updated_at: DateTime<Utc>,
}

/// Owns the per-session directory tree.
///
/// Cheap to clone; every clone points at the same data root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Creates a store rooted at the given data directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store's data root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derives the stable session id from a long-lived auth token.
    #[must_use]
    pub fn session_id_for_token(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        digest
            .iter()
            .take(SESSION_ID_LEN / 2)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    /// Returns the directory of a session.
    #[must_use]
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_FILE)
    }

    fn listing_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(LISTING_FILE)
    }

    /// Returns the directory holding all article subdirectories.
    #[must_use]
    pub fn articles_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("articles")
    }

    /// Returns the directory of one article.
    #[must_use]
    pub fn article_dir(&self, session_id: &str, saved_id: &str) -> PathBuf {
        self.articles_dir(session_id).join(saved_id)
    }

    fn record_path(&self, session_id: &str, saved_id: &str) -> PathBuf {
        self.article_dir(session_id, saved_id).join(RECORD_FILE)
    }

    /// Returns the path of an article's downloaded page content.
    #[must_use]
    pub fn content_path(&self, session_id: &str, saved_id: &str) -> PathBuf {
        self.article_dir(session_id, saved_id).join(CONTENT_FILE)
    }

    // ==================== session records ====================

    /// Loads a session record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] if no record exists.
    pub fn load(&self, session_id: &str) -> Result<Session, StoreError> {
        storage::read_json(&self.session_path(session_id))?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    /// Loads the session for an auth token, creating it on first use.
    ///
    /// The session id is derived from a hash of the token, so the same
    /// credential always maps to the same directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the record cannot be read or
    /// written.
    #[instrument(skip(self, auth))]
    pub fn create_or_load(&self, auth: &AuthMaterial) -> Result<Session, StoreError> {
        let id = Self::session_id_for_token(&auth.token);
        match self.load(&id) {
            Ok(mut session) => {
                // Refresh auth material in place; headers may have rotated.
                if session.auth != *auth {
                    session.auth = auth.clone();
                    session.updated_at = Utc::now();
                    self.save(&session)?;
                }
                Ok(session)
            }
            Err(StoreError::SessionNotFound(_)) => {
                info!(session = %id, "creating new session");
                let session = Session::new(id.clone(), auth.clone());
                self.save(&session)?;
                Ok(session)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a session record atomically (no merge).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] on write failure.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        storage::write_json(&self.session_path(&session.id), session)?;
        Ok(())
    }

    /// Applies a mutation to the session record under the optimistic
    /// read-modify-write discipline and returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] if the record does not exist,
    /// or [`StoreError::Storage`] on a persistent write conflict.
    pub async fn update_session<F>(&self, session_id: &str, mut apply: F) -> Result<Session, StoreError>
    where
        F: FnMut(&mut Session),
    {
        let path = self.session_path(session_id);
        let result = storage::update(&path, |session: &mut Session| {
            apply(session);
            session.updated_at = Utc::now();
        })
        .await;
        match result {
            Ok(session) => Ok(session),
            Err(StorageError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(StoreError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mutates only the fetch task sub-record.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::update_session`].
    pub async fn update_fetch_task<F>(&self, session_id: &str, mut apply: F) -> Result<FetchTask, StoreError>
    where
        F: FnMut(&mut FetchTask),
    {
        let session = self
            .update_session(session_id, |session| apply(&mut session.fetch_task))
            .await?;
        Ok(session.fetch_task)
    }

    /// Mutates only the download task sub-record.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::update_session`].
    pub async fn update_download_task<F>(
        &self,
        session_id: &str,
        mut apply: F,
    ) -> Result<DownloadTask, StoreError>
    where
        F: FnMut(&mut DownloadTask),
    {
        let session = self
            .update_session(session_id, |session| apply(&mut session.download_task))
            .await?;
        Ok(session.download_task)
    }

    /// Mutates only the persisted rate-limit window.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::update_session`].
    pub async fn update_rate_window<F>(&self, session_id: &str, mut apply: F) -> Result<RateWindow, StoreError>
    where
        F: FnMut(&mut RateWindow),
    {
        let session = self
            .update_session(session_id, |session| apply(&mut session.rate_window))
            .await?;
        Ok(session.rate_window)
    }

    // ==================== article records ====================

    /// Merge-writes an article record into its per-article directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] on write failure or persistent
    /// conflict.
    #[instrument(skip(self, record), fields(saved_id = %record.saved_id))]
    pub async fn write_article(
        &self,
        session_id: &str,
        record: ArticleRecord,
    ) -> Result<ArticleRecord, StoreError> {
        let path = self.record_path(session_id, &record.saved_id);
        Ok(storage::merge_write(&path, record).await?)
    }

    /// Reads one article record, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the record exists but is invalid.
    pub fn read_article(
        &self,
        session_id: &str,
        saved_id: &str,
    ) -> Result<Option<ArticleRecord>, StoreError> {
        Ok(storage::read_json(&self.record_path(session_id, saved_id))?)
    }

    /// Whether a valid record exists for the article.
    #[must_use]
    pub fn article_exists(&self, session_id: &str, saved_id: &str) -> bool {
        self.record_path(session_id, saved_id).is_file()
    }

    /// Whether the article's page content has been downloaded.
    #[must_use]
    pub fn has_content(&self, session_id: &str, saved_id: &str) -> bool {
        self.content_path(session_id, saved_id).is_file()
    }

    /// Writes an article's page content atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on write failure.
    pub fn write_content(&self, session_id: &str, saved_id: &str, body: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.content_path(session_id, saved_id);
        write_file_atomic(&path, body)?;
        Ok(path)
    }

    /// Writes an article image file atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on write failure.
    pub fn write_image(
        &self,
        session_id: &str,
        saved_id: &str,
        file_name: &str,
        body: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let path = self.article_dir(session_id, saved_id).join(file_name);
        write_file_atomic(&path, body)?;
        Ok(path)
    }

    /// Scans the article directory and returns all valid article ids, sorted.
    ///
    /// A directory counts as a valid article when its record file exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the scan fails.
    pub fn article_ids(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.articles_dir(session_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().join(RECORD_FILE).is_file() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Counts valid article directories on disk.
    ///
    /// This is the authoritative progress figure; it is never cached.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the scan fails.
    pub fn count_articles(&self, session_id: &str) -> Result<u64, StoreError> {
        Ok(self.article_ids(session_id)?.len() as u64)
    }

    /// Refreshes the aggregate article id listing from the directory scan.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`]/[`StoreError::Storage`] on failure.
    #[instrument(skip(self))]
    pub fn write_listing(&self, session_id: &str) -> Result<ArticleListing, StoreError> {
        let listing = ArticleListing {
            schema_version: SCHEMA_VERSION,
            article_ids: self.article_ids(session_id)?,
            updated_at: Utc::now(),
        };
        storage::write_json(&self.listing_path(session_id), &listing)?;
        debug!(articles = listing.article_ids.len(), "listing refreshed");
        Ok(listing)
    }

    /// Reads the aggregate listing, `None` before the first fetch page.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the listing exists but is invalid.
    pub fn read_listing(&self, session_id: &str) -> Result<Option<ArticleListing>, StoreError> {
        Ok(storage::read_json(&self.listing_path(session_id))?)
    }

    // ==================== session lifecycle ====================

    /// Total bytes persisted for a session (records, content, images).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the walk fails.
    pub fn total_size(&self, session_id: &str) -> Result<u64, StoreError> {
        dir_size(&self.session_dir(session_id))
    }

    /// Removes all persisted state of a session.
    ///
    /// Idempotent; deleting an unknown session is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if removal fails for another reason.
    #[instrument(skip(self))]
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(session = %session_id, "session deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }
}

/// Writes a file through a temp sibling + rename, creating parent dirs.
fn write_file_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let name = path
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
    let temp = path.with_file_name(format!(".{name}.part"));
    fs::write(&temp, body).map_err(|e| StoreError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| StoreError::io(path, e))
}

/// Recursively sums file sizes under a directory.
fn dir_size(dir: &Path) -> Result<u64, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let meta = entry.metadata().map_err(|e| StoreError::io(entry.path(), e))?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
