//! Backoff policy and due-entry selection for the pending queue
//!
//! The delay for the n-th consecutive failure is
//! `min(base * 2^(n-1), max)` plus a per-path jitter of up to
//! `jitter_ratio` of that value. The jitter fraction is derived from the
//! path, so the delay stays non-decreasing in the attempt count while
//! different paths spread out.

use super::config::RetrySettings;
use paperwatch_db::{PendingEntry, StateDb};
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        StateDb::now_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Pure backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub batch_limit: u32,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            jitter_ratio: settings.jitter_ratio.clamp(0.0, 1.0),
            batch_limit: settings.batch_limit,
            max_attempts: settings.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay without jitter. Zero attempts means "due now".
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt_count - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus the path's jitter share.
    pub fn delay_for(&self, attempt_count: u32, path: &str) -> Duration {
        let capped = self.backoff(attempt_count);
        if self.jitter_ratio <= 0.0 {
            return capped;
        }
        capped.saturating_add(scale(capped, self.jitter_ratio * jitter_fraction(path)))
    }

    /// Upper bound for any delay this policy produces
    pub fn ceiling(&self) -> Duration {
        self.max_delay
            .saturating_add(scale(self.max_delay, self.jitter_ratio))
    }

    /// Whether an entry has used up its attempts (never, without a limit).
    pub fn is_stalled(&self, attempt_count: u32) -> bool {
        self.max_attempts
            .map(|limit| attempt_count >= limit)
            .unwrap_or(false)
    }
}

/// `d * factor`, saturating at `Duration::MAX`.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Stable value in [0, 1) derived from the path.
fn jitter_fraction(path: &str) -> f64 {
    let digest = Sha1::digest(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Applies a [`RetryPolicy`] against a clock and the store.
#[derive(Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("policy", &self.policy)
            .field("now", &self.clock.now_millis())
            .finish()
    }
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// When the entry should be tried again after its `attempt_count`-th failure.
    pub fn next_attempt_at(&self, attempt_count: u32, path: &str, now: i64) -> i64 {
        let delay = self.policy.delay_for(attempt_count, path);
        now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }

    /// Entries to attempt now, oldest schedule first.
    ///
    /// `force` returns every pending entry, stalled or not, regardless of schedule.
    pub async fn due(&self, db: &StateDb, force: bool) -> paperwatch_db::Result<Vec<PendingEntry>> {
        if force {
            db.all_pending(u32::MAX).await
        } else {
            db.due_pending(self.now(), self.policy.batch_limit, self.policy.max_attempts)
                .await
        }
    }
}
