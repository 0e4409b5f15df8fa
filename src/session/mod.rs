//! Session and task state for export runs.
//!
//! A session is one user's export run: authentication material plus two
//! independent task state machines (fetch, download) and the persisted
//! rate-limit window. Sessions and article records live on disk under a
//! per-session directory owned by [`SessionStore`]; the structs here are
//! the typed shape of those records.
//!
//! # State machines
//!
//! Both tasks move `idle → running → {completed | stopped | error}`.
//! `stopped` is resumable: a fresh run against the same persisted cursor or
//! article set picks up where the previous one left off.

mod store;

pub use store::{ArticleListing, SessionStore, StoreError};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::MergeRecord;

/// Version tag carried by every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle status shared by fetch and download tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Never started.
    #[default]
    Idle,
    /// A run is in progress.
    Running,
    /// The run reached the end of the upstream listing or article set.
    Completed,
    /// Halted deliberately (user stop or quota exhaustion); resumable.
    Stopped,
    /// The run failed; the cursor is preserved for a later resume attempt.
    Error,
}

impl TaskStatus {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Returns true for states no loop iteration will follow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// State of the cursor-walking fetch run for a session.
///
/// `count` always reflects the number of valid article directories on disk,
/// recomputed by [`SessionStore::count_articles`], never an in-memory
/// counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTask {
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Articles on disk, recomputed from the article directory.
    pub count: u64,
    /// Upstream's estimate of the library size, when reported.
    pub total: u64,
    /// Opaque upstream pagination cursor for resumption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Last processed item key, diagnostic only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_id: Option<String>,
    /// When the upstream last rate-limited this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_at: Option<DateTime<Utc>>,
    /// Retry-After value (seconds) from the last rate-limit response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_retry_after: Option<u64>,
    /// Terminal error message, if the last run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of the content-download run for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Articles whose content file exists on disk.
    pub count: u64,
    /// Size of the article set handed to the current run.
    pub total: u64,
    /// The article presently downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_id: Option<String>,
    /// When a content host last rate-limited this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_at: Option<DateTime<Utc>>,
    /// Retry-After value (seconds) from the last rate-limit response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_retry_after: Option<u64>,
    /// Terminal error message, if the last run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The persisted sliding-window rate-limit state.
///
/// Persisted inside the session record so it is the single source of truth
/// across restarts; no in-memory copy is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    /// Request timestamps, oldest first, capped to the last hour.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Whether the limiter is in its reduced-throughput regime.
    pub slow_mode: bool,
}

/// Opaque authentication material for the upstream service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMaterial {
    /// The caller's long-lived token; also the basis of the session id.
    pub token: String,
    /// Additional headers the upstream requires, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl AuthMaterial {
    /// Creates auth material from a bare token.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            headers: BTreeMap::new(),
        }
    }
}

/// One user's export session: auth material plus the two task records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Record schema version.
    pub schema_version: u32,
    /// Stable identifier derived from a hash of the auth token.
    pub id: String,
    /// When the session was first created.
    pub created_at: DateTime<Utc>,
    /// When the session record was last written.
    pub updated_at: DateTime<Utc>,
    /// Upstream authentication material.
    pub auth: AuthMaterial,
    /// Fetch task state machine.
    #[serde(default)]
    pub fetch_task: FetchTask,
    /// Download task state machine.
    #[serde(default)]
    pub download_task: DownloadTask,
    /// Persisted rate-limit window.
    #[serde(default)]
    pub rate_window: RateWindow,
}

impl Session {
    /// Creates a fresh session with both tasks idle.
    #[must_use]
    pub fn new(id: impl Into<String>, auth: AuthMaterial) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            id: id.into(),
            created_at: now,
            updated_at: now,
            auth,
            fetch_task: FetchTask::default(),
            download_task: DownloadTask::default(),
            rate_window: RateWindow::default(),
        }
    }
}

/// A reference to one image of an article, with mirrored alternates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    /// Primary image URL.
    pub src: String,
    /// Upstream-cached mirror tried when the primary fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_src: Option<String>,
    /// Pixel width, when the upstream reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Pixel height, when the upstream reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// The upstream-defined nested payload of an article.
///
/// Fields the upstream adds later land in `extra` and survive merges, so a
/// richer query augments rather than erases previously captured data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemPayload {
    /// Image references discovered for this article.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    /// Video markers, stored verbatim.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<serde_json::Value>,
    /// Short excerpt of the article text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    /// Source domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Upstream fields without a typed counterpart.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One saved article's persisted metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleRecord {
    /// Record schema version.
    pub schema_version: u32,
    /// Upstream item key; also the article's directory name.
    pub saved_id: String,
    /// First time this article was sighted during a fetch run.
    pub created_at: DateTime<Utc>,
    /// Article title.
    pub title: String,
    /// Canonical article URL.
    pub url: String,
    /// Tag set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Upstream-defined nested payload.
    #[serde(default)]
    pub item: ItemPayload,
}

impl ArticleRecord {
    /// Creates a record for a first sighting.
    #[must_use]
    pub fn new(saved_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_id: saved_id.into(),
            created_at: Utc::now(),
            title: title.into(),
            url: url.into(),
            tags: Vec::new(),
            item: ItemPayload::default(),
        }
    }
}

impl MergeRecord for ArticleRecord {
    /// Field-level merge: non-empty incoming scalars win, tags union,
    /// payload lists are replaced when the incoming list is non-empty, and
    /// untyped extra fields merge key-wise with incoming winning.
    fn merge_from(&mut self, incoming: Self) {
        self.schema_version = self.schema_version.max(incoming.schema_version);
        // created_at keeps the first sighting.
        if !incoming.title.is_empty() {
            self.title = incoming.title;
        }
        if !incoming.url.is_empty() {
            self.url = incoming.url;
        }
        for tag in incoming.tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        if !incoming.item.images.is_empty() {
            self.item.images = incoming.item.images;
        }
        if !incoming.item.videos.is_empty() {
            self.item.videos = incoming.item.videos;
        }
        if incoming.item.excerpt.is_some() {
            self.item.excerpt = incoming.item.excerpt;
        }
        if incoming.item.domain.is_some() {
            self.item.domain = incoming.item.domain;
        }
        for (key, value) in incoming.item.extra {
            self.item.extra.insert(key, value);
        }
    }
}
