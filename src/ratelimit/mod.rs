//! Per-session sliding-window rate limiting for upstream requests.
//!
//! The upstream service imposes a hard hourly request cap. Naive uniform
//! pacing either wastes early budget or bursts into a hard block near the
//! cap, so the limiter runs a two-speed policy: minimal delays while the
//! trailing-hour window is comfortably below the cap, then a long fixed
//! delay ("slow mode") that spreads the remaining budget across the hour.
//! At the cap boundary it blocks until the oldest timestamp ages out.
//!
//! The window itself lives in the session record ([`RateWindow`]), so the
//! consumed budget survives process restarts; nothing held only in memory
//! is authoritative.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use readstash::ratelimit::{RateLimitConfig, RateLimiter};
//! use readstash::session::SessionStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SessionStore::new("./data"));
//! let limiter = RateLimiter::new(Arc::clone(&store), RateLimitConfig::default());
//!
//! // Before every upstream request:
//! limiter.enforce("0123456789abcdef").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::session::{RateWindow, SessionStore, StoreError};

/// Tunables for the sliding-window limiter.
///
/// The thresholds were tuned against one upstream service; they are
/// configuration, not invariants, and a different upstream may need
/// different values.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Hard cap on requests within one trailing window.
    pub hourly_cap: usize,
    /// Window occupancy at which slow mode engages.
    pub fast_threshold: usize,
    /// Inter-request delay while below the fast threshold.
    pub min_delay: Duration,
    /// Inter-request delay in slow mode.
    pub slow_delay: Duration,
    /// Extra margin added when blocked at the cap boundary.
    pub safety_margin: Duration,
    /// Upper bound on timestamps a single boost may discard.
    pub max_boost: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_cap: 300,
            fast_threshold: 100,
            min_delay: Duration::from_secs(2),
            slow_delay: Duration::from_secs(90),
            safety_margin: Duration::from_secs(15),
            max_boost: 20,
            window: Duration::from_secs(3600),
        }
    }
}

/// Snapshot of a session's rate-limit state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Requests recorded in the trailing window.
    pub used: usize,
    /// The hard hourly cap.
    pub cap: usize,
    /// Whether the reduced-throughput regime is active.
    pub slow_mode: bool,
    /// Earliest time the next request is permitted.
    pub next_allowed_at: DateTime<Utc>,
}

/// Sliding-window limiter over the persisted per-session window.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<SessionStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Creates a limiter over the given store.
    #[must_use]
    pub fn new(store: Arc<SessionStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Returns the limiter configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until a request is permitted, then records it.
    ///
    /// Must be called immediately before every upstream request. The new
    /// timestamp and the slow-mode flag are persisted before this returns,
    /// so a crash directly after the request still counts it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the session is unknown or the window
    /// cannot be persisted.
    #[instrument(skip(self))]
    pub async fn enforce(&self, session_id: &str) -> Result<(), StoreError> {
        let mut window = self.store.load(session_id)?.rate_window;
        let now = Utc::now();
        prune(&mut window, now, &self.config);

        let wait = required_wait(&window, now, &self.config);
        if !wait.is_zero() {
            let used = window.timestamps.len();
            if used + 1 >= self.config.hourly_cap {
                info!(
                    used,
                    cap = self.config.hourly_cap,
                    wait_secs = wait.as_secs(),
                    "hourly cap reached, blocking until the window frees"
                );
            } else {
                debug!(used, wait_ms = wait.as_millis(), "pacing upstream request");
            }
            tokio::time::sleep(wait).await;
        }

        let config = self.config.clone();
        self.store
            .update_rate_window(session_id, move |window| {
                let now = Utc::now();
                prune(window, now, &config);
                window.timestamps.push(now);
                update_slow_mode(window, &config);
            })
            .await?;
        Ok(())
    }

    /// Reports the current window occupancy without recording a request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the session is unknown.
    pub fn status(&self, session_id: &str) -> Result<RateLimitStatus, StoreError> {
        let mut window = self.store.load(session_id)?.rate_window;
        let now = Utc::now();
        prune(&mut window, now, &self.config);

        let wait = required_wait(&window, now, &self.config);
        Ok(RateLimitStatus {
            used: window.timestamps.len(),
            cap: self.config.hourly_cap,
            slow_mode: effective_slow(&window, &self.config),
            next_allowed_at: now
                + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()),
        })
    }

    /// Discards up to `count` of the oldest recorded timestamps.
    ///
    /// Accelerates a fresh run after an idle stretch without raising the
    /// effective cap; the discard is bounded by the configured `max_boost`.
    /// Returns how many timestamps were discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the session is unknown or the window
    /// cannot be persisted.
    #[instrument(skip(self))]
    pub async fn boost(&self, session_id: &str, count: usize) -> Result<usize, StoreError> {
        let mut before = self.store.load(session_id)?.rate_window;
        prune(&mut before, Utc::now(), &self.config);
        let before_len = before.timestamps.len();

        let config = self.config.clone();
        let window = self
            .store
            .update_rate_window(session_id, move |window| {
                let now = Utc::now();
                prune(window, now, &config);
                let discard = count.min(config.max_boost).min(window.timestamps.len());
                window.timestamps.drain(..discard);
                update_slow_mode(window, &config);
            })
            .await?;

        let discarded = before_len.saturating_sub(window.timestamps.len());
        info!(discarded, remaining = window.timestamps.len(), "rate window boosted");
        Ok(discarded)
    }
}

/// Drops timestamps older than the window and caps the retained count.
pub(crate) fn prune(window: &mut RateWindow, now: DateTime<Utc>, config: &RateLimitConfig) {
    let horizon =
        now - chrono::Duration::from_std(config.window).unwrap_or_else(|_| chrono::Duration::zero());
    window.timestamps.retain(|ts| *ts > horizon);
    window.timestamps.sort_unstable();
    if window.timestamps.len() > config.hourly_cap {
        let excess = window.timestamps.len() - config.hourly_cap;
        window.timestamps.drain(..excess);
    }
}

/// Computes how long the next request must wait. Pure over a pruned window.
pub(crate) fn required_wait(
    window: &RateWindow,
    now: DateTime<Utc>,
    config: &RateLimitConfig,
) -> Duration {
    let used = window.timestamps.len();

    // At or one below the cap: wait for the oldest timestamp to age out.
    if used + 1 >= config.hourly_cap {
        if let Some(oldest) = window.timestamps.first() {
            let free_at = *oldest
                + chrono::Duration::from_std(config.window + config.safety_margin)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            return (free_at - now).to_std().unwrap_or(Duration::ZERO);
        }
    }

    let Some(last) = window.timestamps.last() else {
        return Duration::ZERO;
    };
    let spacing = if effective_slow(window, config) {
        config.slow_delay
    } else {
        config.min_delay
    };
    let next_at =
        *last + chrono::Duration::from_std(spacing).unwrap_or_else(|_| chrono::Duration::zero());
    (next_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Whether slow-mode pacing applies, with hysteresis.
///
/// Entry at the fast threshold; exit only once the window drains below
/// half of it, so the mode does not flap around the boundary.
fn effective_slow(window: &RateWindow, config: &RateLimitConfig) -> bool {
    let used = window.timestamps.len();
    if window.slow_mode {
        used >= config.fast_threshold / 2
    } else {
        used >= config.fast_threshold
    }
}

/// Re-evaluates and stores the persisted slow-mode flag.
fn update_slow_mode(window: &mut RateWindow, config: &RateLimitConfig) {
    window.slow_mode = effective_slow(window, config);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            hourly_cap: 10,
            fast_threshold: 4,
            min_delay: Duration::from_secs(2),
            slow_delay: Duration::from_secs(60),
            safety_margin: Duration::from_secs(5),
            max_boost: 3,
            window: Duration::from_secs(3600),
        }
    }

    fn window_at(now: DateTime<Utc>, ages_secs: &[i64]) -> RateWindow {
        RateWindow {
            timestamps: ages_secs
                .iter()
                .map(|age| now - chrono::Duration::seconds(*age))
                .collect(),
            slow_mode: false,
        }
    }

    #[test]
    fn test_prune_drops_old_timestamps() {
        let now = Utc::now();
        let mut window = window_at(now, &[4000, 3700, 1800, 60]);
        prune(&mut window, now, &config());
        assert_eq!(window.timestamps.len(), 2);
    }

    #[test]
    fn test_prune_caps_retained_count() {
        let now = Utc::now();
        let ages: Vec<i64> = (0..20).collect();
        let mut window = window_at(now, &ages);
        prune(&mut window, now, &config());
        assert_eq!(window.timestamps.len(), 10);
        // The newest timestamps survive.
        assert!(window.timestamps.iter().all(|ts| *ts > now - chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_first_request_is_immediate() {
        let now = Utc::now();
        let window = RateWindow::default();
        assert_eq!(required_wait(&window, now, &config()), Duration::ZERO);
    }

    #[test]
    fn test_fast_mode_enforces_min_delay() {
        let now = Utc::now();
        // One request, right now: wait the min delay.
        let window = window_at(now, &[0]);
        let wait = required_wait(&window, now, &config());
        assert_eq!(wait, Duration::from_secs(2));
    }

    #[test]
    fn test_fast_mode_elapsed_delay_means_no_wait() {
        let now = Utc::now();
        let window = window_at(now, &[30]);
        assert_eq!(required_wait(&window, now, &config()), Duration::ZERO);
    }

    #[test]
    fn test_slow_mode_enforces_long_delay() {
        let now = Utc::now();
        // At the fast threshold (4 of cap 10) slow pacing applies.
        let window = window_at(now, &[40, 30, 20, 0]);
        let wait = required_wait(&window, now, &config());
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[test]
    fn test_cap_boundary_blocks_until_oldest_ages_out() {
        let now = Utc::now();
        // 9 requests of cap 10: one below the cap blocks.
        let ages: Vec<i64> = (0..9).map(|i| 600 - i).collect();
        let window = window_at(now, &ages);
        let wait = required_wait(&window, now, &config());

        // Oldest is 600s old; it ages out after 3600s + 5s margin.
        let expected = Duration::from_secs(3600 + 5 - 600);
        assert_eq!(wait, expected);
    }

    #[test]
    fn test_hysteresis_slow_mode_sticks_until_half_threshold() {
        let now = Utc::now();
        let cfg = config();

        // 3 requests with the flag set: still slow (3 >= 4/2).
        let mut window = window_at(now, &[30, 20, 10]);
        window.slow_mode = true;
        assert!(effective_slow(&window, &cfg));

        // 1 request with the flag set: slow mode releases.
        let mut window = window_at(now, &[10]);
        window.slow_mode = true;
        assert!(!effective_slow(&window, &cfg));

        // 3 requests without the flag: not slow (below entry threshold).
        let window = window_at(now, &[30, 20, 10]);
        assert!(!effective_slow(&window, &cfg));
    }

    #[test]
    fn test_window_never_exceeds_cap_under_any_sequence() {
        // Simulated clock: every iteration advances time by the computed
        // wait and records a request, mimicking a tight enforce loop.
        let cfg = config();
        let mut window = RateWindow::default();
        let mut now = Utc::now();

        for _ in 0..100 {
            prune(&mut window, now, &cfg);
            let wait = required_wait(&window, now, &cfg);
            now += chrono::Duration::from_std(wait).unwrap();
            prune(&mut window, now, &cfg);
            window.timestamps.push(now);
            update_slow_mode(&mut window, &cfg);

            // Invariant: never more than the cap inside any trailing window.
            let horizon = now - chrono::Duration::from_std(cfg.window).unwrap();
            let in_window = window.timestamps.iter().filter(|ts| **ts > horizon).count();
            assert!(
                in_window <= cfg.hourly_cap,
                "cap exceeded: {in_window} > {}",
                cfg.hourly_cap
            );
        }
    }

    #[tokio::test]
    async fn test_enforce_records_and_persists() {
        use crate::session::AuthMaterial;

        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let session = store
            .create_or_load(&AuthMaterial::from_token("tok"))
            .unwrap();

        let cfg = RateLimitConfig {
            min_delay: Duration::from_millis(1),
            ..config()
        };
        let limiter = RateLimiter::new(Arc::clone(&store), cfg);

        limiter.enforce(&session.id).await.unwrap();
        limiter.enforce(&session.id).await.unwrap();

        let reloaded = store.load(&session.id).unwrap();
        assert_eq!(reloaded.rate_window.timestamps.len(), 2);
    }

    #[tokio::test]
    async fn test_boost_discards_oldest_bounded() {
        use crate::session::AuthMaterial;

        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let session = store
            .create_or_load(&AuthMaterial::from_token("tok"))
            .unwrap();

        let now = Utc::now();
        store
            .update_rate_window(&session.id, |window| {
                *window = window_at(now, &[50, 40, 30, 20, 10]);
            })
            .await
            .unwrap();

        let limiter = RateLimiter::new(Arc::clone(&store), config());
        // Ask for 10, bounded by max_boost = 3.
        limiter.boost(&session.id, 10).await.unwrap();

        let reloaded = store.load(&session.id).unwrap();
        assert_eq!(reloaded.rate_window.timestamps.len(), 2);
        // The two newest survive.
        assert!(
            reloaded
                .rate_window
                .timestamps
                .iter()
                .all(|ts| *ts > now - chrono::Duration::seconds(25))
        );
    }

    #[test]
    fn test_status_reports_next_allowed() {
        // Pure check through required_wait; the async path is covered above.
        let now = Utc::now();
        let window = window_at(now, &[0]);
        let wait = required_wait(&window, now, &config());
        assert!(wait > Duration::ZERO);
    }
}
