//! Per-article download work: page content plus images, under a byte cap.

use tracing::{debug, info, instrument, warn};

use super::DownloadConfig;
use super::client::ContentClient;
use super::error::DownloadError;
use crate::session::{ImageRef, SessionStore};

/// Result of downloading one article's content and images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// The content file already existed; nothing was fetched.
    pub already_downloaded: bool,
    /// Bytes of page content written.
    pub content_bytes: u64,
    /// Images written to disk.
    pub images_downloaded: usize,
    /// Images skipped because the per-article byte cap was reached.
    pub images_skipped: usize,
    /// Images that failed on every candidate URL.
    pub images_failed: usize,
}

/// Downloads one article: canonical page content, then its images.
///
/// Idempotent: an article whose content file already exists reports
/// `already_downloaded` without any network call. All file writes go
/// through a temp-file rename, so a crash never leaves a truncated file
/// that looks complete.
///
/// The per-article byte cap bounds worst-case storage: the content and
/// every image draw from one budget, and images are skipped (not failed)
/// once it runs out.
///
/// # Errors
///
/// Returns [`DownloadError`] when the article has no record on disk or the
/// page content itself cannot be fetched or written. Image failures are
/// recorded in the outcome, never propagated.
#[instrument(skip(store, client, config))]
pub(crate) async fn download_article(
    store: &SessionStore,
    client: &dyn ContentClient,
    config: &DownloadConfig,
    session_id: &str,
    saved_id: &str,
) -> Result<DownloadOutcome, DownloadError> {
    if store.has_content(session_id, saved_id) {
        debug!("content already on disk, skipping");
        return Ok(DownloadOutcome {
            already_downloaded: true,
            ..DownloadOutcome::default()
        });
    }

    let record = store
        .read_article(session_id, saved_id)?
        .ok_or_else(|| DownloadError::MissingRecord {
            saved_id: saved_id.to_string(),
        })?;

    let cap = config.per_article_cap_bytes;
    let content = client.fetch(&record.url, cap).await?;
    store.write_content(session_id, saved_id, &content)?;
    let mut spent = content.len() as u64;

    let mut outcome = DownloadOutcome {
        content_bytes: spent,
        ..DownloadOutcome::default()
    };

    for (index, image) in record.item.images.iter().enumerate() {
        if spent >= cap {
            outcome.images_skipped += record.item.images.len() - index;
            info!(
                skipped = outcome.images_skipped,
                cap, "per-article byte cap reached, skipping remaining images"
            );
            break;
        }

        let remaining = cap - spent;
        match fetch_image(client, image, remaining).await {
            ImageFetch::Downloaded { url, bytes } => {
                let file_name = image_file_name(index, &url);
                store.write_image(session_id, saved_id, &file_name, &bytes)?;
                spent += bytes.len() as u64;
                outcome.images_downloaded += 1;
            }
            ImageFetch::OverBudget => outcome.images_skipped += 1,
            ImageFetch::Failed => outcome.images_failed += 1,
        }
    }

    info!(
        content_bytes = outcome.content_bytes,
        images = outcome.images_downloaded,
        skipped = outcome.images_skipped,
        failed = outcome.images_failed,
        "article downloaded"
    );
    Ok(outcome)
}

/// Result of trying one image across its candidate URLs.
enum ImageFetch {
    /// A candidate succeeded.
    Downloaded { url: String, bytes: Vec<u8> },
    /// Every viable candidate exceeded the remaining byte budget.
    OverBudget,
    /// Every candidate failed for another reason.
    Failed,
}

/// Tries the primary URL, then any cached mirror, in order.
async fn fetch_image(client: &dyn ContentClient, image: &ImageRef, remaining: u64) -> ImageFetch {
    let mut over_budget = false;

    let candidates = std::iter::once(image.src.as_str())
        .chain(image.cached_src.as_deref())
        .filter(|url| !url.is_empty());
    for url in candidates {
        match client.fetch(url, remaining).await {
            Ok(bytes) => {
                return ImageFetch::Downloaded {
                    url: url.to_string(),
                    bytes,
                };
            }
            Err(DownloadError::TooLarge { .. }) => {
                // A mirror may serve a resized copy; keep trying.
                over_budget = true;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "image candidate failed");
            }
        }
    }

    if over_budget {
        ImageFetch::OverBudget
    } else {
        ImageFetch::Failed
    }
}

/// Derives an image file name from its position and URL extension.
fn image_file_name(index: usize, url: &str) -> String {
    let extension = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            std::path::Path::new(u.path())
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or_else(|| "jpg".to_string());
    format!("image-{index}.{extension}")
}
