//! Crash-safe JSON record persistence.
//!
//! Every durable record in a session directory goes through this module.
//! Writes serialize to a temporary sibling file and rename it over the
//! target, so a reader can never observe a partially written record.
//!
//! # Concurrent writers
//!
//! Two write disciplines are provided on top of the atomic rename:
//!
//! - [`merge_write`] - re-reads any existing record, merges the incoming
//!   value into it via [`MergeRecord`], and writes the result. Used for
//!   article records, where a later, richer query must augment rather than
//!   erase previously captured fields.
//! - [`update`] - re-reads the record and applies a caller closure to it.
//!   Used for session records, where the fetch loop and download workers
//!   mutate disjoint sub-records of the same file.
//!
//! Both detect a concurrent modification by comparing the target's
//! modification time before the read and just before the rename. A detected
//! race retries the whole read-modify-write up to [`MERGE_RETRY_LIMIT`]
//! times with a small random delay, then fails loudly.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Maximum read-modify-write attempts before a concurrent-modification error.
pub const MERGE_RETRY_LIMIT: u32 = 5;

/// Upper bound for the random delay between merge retries.
const MERGE_RETRY_MAX_DELAY: Duration = Duration::from_millis(25);

/// Errors from record persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Record content is not valid JSON for the expected type.
    #[error("invalid record at {path}: {source}")]
    Json {
        /// The record path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Another writer kept modifying the record across the whole retry budget.
    #[error("record at {path} was concurrently modified {attempts} times, giving up")]
    ConcurrentModification {
        /// The contested record path.
        path: PathBuf,
        /// How many attempts were made.
        attempts: u32,
    },
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Field-level merge for records that are augmented rather than overwritten.
///
/// `merge_from` folds `incoming` into `self`. Implementations decide per
/// field; the convention is that non-empty incoming leaf values win, set-like
/// fields union, and map-like fields merge key-wise with incoming winning on
/// conflict.
pub trait MergeRecord {
    /// Folds a newer observation of the same record into this one.
    fn merge_from(&mut self, incoming: Self);
}

/// Reads a JSON record, returning `None` if the file does not exist.
///
/// # Errors
///
/// Returns [`StorageError::Io`] for filesystem failures other than
/// not-found, and [`StorageError::Json`] if the content does not parse.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::json(path, e))?;
    Ok(Some(value))
}

/// Atomically writes a JSON record (temp sibling + rename).
///
/// Creates the parent directory if missing. Last writer wins; use
/// [`merge_write`] or [`update`] when concurrent writers must not lose
/// each other's fields.
///
/// # Errors
///
/// Returns [`StorageError::Io`] or [`StorageError::Json`].
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(path, e))?;
    write_atomic(path, &data)
}

/// Merge-writes a record: read existing, fold `incoming` in, write back.
///
/// Returns the merged record as written. On a detected concurrent
/// modification the whole read-merge-write is retried with a small random
/// delay, up to [`MERGE_RETRY_LIMIT`] attempts.
///
/// # Errors
///
/// Returns [`StorageError::ConcurrentModification`] once the retry budget
/// is exhausted, or the underlying [`StorageError::Io`]/[`StorageError::Json`].
pub async fn merge_write<T>(path: &Path, incoming: T) -> Result<T, StorageError>
where
    T: MergeRecord + Serialize + DeserializeOwned + Clone,
{
    update_with(path, move |existing: Option<T>| {
        Ok(match existing {
            Some(mut base) => {
                base.merge_from(incoming.clone());
                base
            }
            None => incoming.clone(),
        })
    })
    .await
}

/// Read-modify-write with a caller-supplied transformation.
///
/// `apply` receives a fresh mutable copy of the on-disk record on every
/// attempt, so a retried race re-applies the mutation to the record the
/// winner wrote. The record must already exist.
///
/// # Errors
///
/// Returns [`StorageError::Io`] with a not-found source if the record does
/// not exist, [`StorageError::ConcurrentModification`] past the retry
/// budget, or the underlying IO/JSON error.
pub async fn update<T, F>(path: &Path, mut apply: F) -> Result<T, StorageError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T),
{
    let target = path.to_path_buf();
    update_with(path, move |existing: Option<T>| {
        let mut record = existing.ok_or_else(|| {
            StorageError::io(
                &target,
                std::io::Error::new(std::io::ErrorKind::NotFound, "record does not exist"),
            )
        })?;
        apply(&mut record);
        Ok(record)
    })
    .await
}

/// Shared retry loop for optimistic read-modify-write.
async fn update_with<T, F>(path: &Path, mut produce: F) -> Result<T, StorageError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<T, StorageError>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let observed = modified_time(path)?;
        let existing: Option<T> = read_json(path)?;
        if existing.is_none() && observed.is_some() {
            // File vanished between stat and read; treat as a race.
            if attempt >= MERGE_RETRY_LIMIT {
                return Err(StorageError::ConcurrentModification {
                    path: path.to_path_buf(),
                    attempts: attempt,
                });
            }
            retry_delay().await;
            continue;
        }

        let next = produce(existing)?;
        let data = serde_json::to_vec_pretty(&next).map_err(|e| StorageError::json(path, e))?;

        // Re-stat just before the rename; a change means another writer
        // landed after our read and our merge would erase its fields.
        if modified_time(path)? == observed {
            write_atomic(path, &data)?;
            return Ok(next);
        }

        if attempt >= MERGE_RETRY_LIMIT {
            warn!(path = %path.display(), attempts = attempt, "merge retry budget exhausted");
            return Err(StorageError::ConcurrentModification {
                path: path.to_path_buf(),
                attempts: attempt,
            });
        }

        debug!(path = %path.display(), attempt, "concurrent modification detected, retrying merge");
        retry_delay().await;
    }
}

/// Writes bytes to a temporary sibling and renames it over the target.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let temp = temp_sibling(path);
    fs::write(&temp, data).map_err(|e| StorageError::io(&temp, e))?;
    if let Err(e) = fs::rename(&temp, path) {
        // Leave no stray temp file behind on a failed rename.
        let _ = fs::remove_file(&temp);
        return Err(StorageError::io(path, e));
    }
    Ok(())
}

/// Builds a uniquely named temp path next to the target.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "record".to_string(), |n| n.to_string_lossy().into_owned());
    let nonce: u32 = rand::thread_rng().r#gen();
    path.with_file_name(format!(".{name}.tmp{nonce:08x}"))
}

/// Returns the target's modification time, or `None` if it does not exist.
fn modified_time(path: &Path) -> Result<Option<SystemTime>, StorageError> {
    match fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .map(Some)
            .map_err(|e| StorageError::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Sleeps for a small random interval between merge retries.
async fn retry_delay() {
    let delay_ms = rand::thread_rng().gen_range(1..=MERGE_RETRY_MAX_DELAY.as_millis() as u64);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        score: u32,
        labels: BTreeMap<String, String>,
    }

    impl MergeRecord for Sample {
        fn merge_from(&mut self, incoming: Self) {
            if !incoming.name.is_empty() {
                self.name = incoming.name;
            }
            self.score = incoming.score;
            for (k, v) in incoming.labels {
                self.labels.insert(k, v);
            }
        }
    }

    fn sample(name: &str, score: u32) -> Sample {
        Sample {
            name: name.to_string(),
            score,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_read_json_missing_file_returns_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let result: Option<Sample> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let value = sample("alpha", 3);
        write_json(&path, &value).unwrap();

        let back: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_write_json_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a/b/record.json");

        write_json(&path, &sample("nested", 1)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        write_json(&path, &sample("clean", 1)).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["record.json".to_string()]);
    }

    #[test]
    fn test_read_json_invalid_content_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, b"not json").unwrap();

        let result: Result<Option<Sample>, _> = read_json(&path);
        assert!(matches!(result, Err(StorageError::Json { .. })));
    }

    #[tokio::test]
    async fn test_merge_write_creates_when_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let written = merge_write(&path, sample("first", 1)).await.unwrap();
        assert_eq!(written.name, "first");

        let back: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(back.name, "first");
    }

    #[tokio::test]
    async fn test_merge_write_folds_into_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let mut first = sample("first", 1);
        first.labels.insert("kept".to_string(), "old".to_string());
        write_json(&path, &first).unwrap();

        let mut second = sample("", 2);
        second.labels.insert("added".to_string(), "new".to_string());
        let merged = merge_write(&path, second).await.unwrap();

        // Empty incoming name keeps the old one; labels merge key-wise.
        assert_eq!(merged.name, "first");
        assert_eq!(merged.score, 2);
        assert_eq!(merged.labels.get("kept").unwrap(), "old");
        assert_eq!(merged.labels.get("added").unwrap(), "new");
    }

    #[tokio::test]
    async fn test_merge_write_is_noop_on_identical_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let value = sample("same", 7);
        write_json(&path, &value).unwrap();
        let before = fs::read(&path).unwrap();

        merge_write(&path, value).await.unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_update_applies_closure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        write_json(&path, &sample("counter", 0)).unwrap();

        let updated: Sample = update(&path, |s: &mut Sample| s.score += 1).await.unwrap();
        assert_eq!(updated.score, 1);

        let updated: Sample = update(&path, |s: &mut Sample| s.score += 1).await.unwrap();
        assert_eq!(updated.score, 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_lose_no_increments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        write_json(&path, &sample("contended", 0)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    // Retries on conflict may exhaust the budget under heavy
                    // contention; loop until the increment lands.
                    loop {
                        match update(&path, |s: &mut Sample| s.score += 1).await {
                            Ok(_) => break,
                            Err(StorageError::ConcurrentModification { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_state: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(final_state.score, 20);
    }
}
