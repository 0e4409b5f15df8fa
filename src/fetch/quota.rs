//! Pluggable fetch quota predicates.
//!
//! The fetch loop consults a quota policy at the top of every iteration.
//! A denial stops the run deliberately (task status `stopped`, resumable),
//! carrying the policy's reason; it is not an error outcome. Collaborators
//! supply the policy, e.g. a paywall layer capping free-tier exports.

/// Decides whether a session may keep fetching.
pub trait QuotaPolicy: Send + Sync {
    /// Returns `Err(reason)` when no further fetching is allowed.
    ///
    /// `articles_on_disk` is the authoritative on-disk article count at the
    /// time of the check.
    ///
    /// # Errors
    ///
    /// The `Err` value is a human-readable denial reason, persisted on the
    /// task record.
    fn check(&self, articles_on_disk: u64) -> Result<(), String>;
}

/// Never denies.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedQuota;

impl QuotaPolicy for UnlimitedQuota {
    fn check(&self, _articles_on_disk: u64) -> Result<(), String> {
        Ok(())
    }
}

/// Denies once the on-disk article count reaches a hard limit.
#[derive(Debug, Clone, Copy)]
pub struct ArticleLimitQuota {
    /// Maximum number of articles the session may hold.
    pub limit: u64,
}

impl ArticleLimitQuota {
    /// Creates a policy with the given article limit.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl QuotaPolicy for ArticleLimitQuota {
    fn check(&self, articles_on_disk: u64) -> Result<(), String> {
        if articles_on_disk >= self.limit {
            Err(format!(
                "article limit reached ({articles_on_disk} of {} allowed)",
                self.limit
            ))
        } else {
            Ok(())
        }
    }
}
