//! Readstash Core Library
//!
//! This library incrementally harvests a user's saved-article library from
//! a rate-limited upstream bookmarking service and persists each item plus
//! its original page content and images to durable per-session storage,
//! resuming safely across restarts and respecting a strict request quota.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`storage`] - Crash-safe JSON record persistence (temp file + rename)
//! - [`session`] - Session/task records and the per-session directory store
//! - [`ratelimit`] - Persisted sliding-window request pacing
//! - [`fetch`] - Cursor-walking listing orchestrator with duplicate escape
//! - [`download`] - Bounded-concurrency content/image download queue
//! - [`service`] - Collaborator surface: start/stop tasks, status, deletion
//!
//! The on-disk session directory is the single source of truth: every
//! mutator goes through the atomic persistence layer and progress counters
//! are recomputed from disk, so a crash at any point leaves accurate,
//! resumable state.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod fetch;
pub mod ratelimit;
pub mod service;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use download::{
    ContentClient, DownloadConfig, DownloadError, DownloadOutcome, DownloadRun, Downloader,
    EntryStatus, HttpContentClient, QueueEntry,
};
pub use fetch::{
    ApiError, ArticleLimitQuota, DEFAULT_API_BASE, FetchConfig, FetchError, Fetcher,
    HttpListingClient, ListingClient, ListingPage, PageRequest, QuotaPolicy, SavedItem, SortOrder,
    UnlimitedQuota,
};
pub use ratelimit::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use service::{ExportService, ServiceConfig, ServiceError, StatusReport};
pub use session::{
    ArticleRecord, AuthMaterial, DownloadTask, FetchTask, ImageRef, ItemPayload, RateWindow,
    Session, SessionStore, StoreError, TaskStatus,
};
