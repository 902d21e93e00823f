//! Sliding-window minute limiter.
//!
//! The sliding window is approximated with two adjacent fixed minute
//! sub-windows: the current count `C` plus the previous count `P` weighted by
//! how much of the previous minute still overlaps the sliding window,
//! `C + P * (1 - elapsed_fraction)`. This avoids the fixed-window boundary
//! flaw where a client spends its full quota at 00:00:59 and again at
//! 00:01:00.
//!
//! Check-and-charge is one linearizable step: the request's position is taken
//! with `increment_and_get` first and compared after, so two simultaneous
//! requests can never both squeeze through the last slot. A denied request's
//! provisional charge is rolled back with a saturating decrement, keeping the
//! stored count equal to *admitted* requests.

use crate::account::AccountId;
use crate::clock::Clock;
use crate::store::{CounterKey, CounterStore, StoreError};
use crate::tier::TierPolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Width of one fixed sub-window.
pub const WINDOW: Duration = Duration::from_secs(60);

const WINDOW_MILLIS: u64 = 60_000;

/// How long a closed sub-window stays readable past the point where its
/// contribution has fully decayed, to absorb clock skew between instances.
pub const DEFAULT_WINDOW_GRACE: Duration = Duration::from_secs(5);

/// Index of the minute sub-window containing `now_millis`.
pub fn minute_window_id(now_millis: u64) -> u64 {
    now_millis / WINDOW_MILLIS
}

/// Fraction of the current minute sub-window that has elapsed, in `[0, 1)`.
pub fn elapsed_fraction(now_millis: u64) -> f64 {
    (now_millis % WINDOW_MILLIS) as f64 / WINDOW_MILLIS as f64
}

/// Result of one minute-window admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteOutcome {
    /// Whether the request fits under the sliding-window threshold.
    pub admitted: bool,
    /// Requests left in the window after this one; `None` for unlimited tiers.
    pub remaining: Option<u64>,
    /// How long until one more request would be admitted; set on denial only.
    pub retry_after: Option<Duration>,
    /// The sub-window holding this request's charge; `None` when nothing was
    /// charged (unlimited tiers, and denials, which are compensated here).
    pub window: Option<u64>,
}

/// Stateless sliding-window logic over a shared [`CounterStore`].
///
/// Holds no mutable state of its own, so a single limiter is safe to share
/// across any number of concurrent requests and service instances.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl SlidingWindowLimiter {
    /// Build a limiter over the given store and clock.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, grace: DEFAULT_WINDOW_GRACE }
    }

    /// Override the window grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Decide admission for one request and charge the window if admitted.
    ///
    /// Unlimited tiers short-circuit to allow with zero store operations.
    /// The boundary is strict: the request that brings the window estimate
    /// exactly to the threshold is the threshold-th request and is admitted;
    /// only one that would exceed it is denied.
    pub async fn check_and_charge(
        &self,
        account: &AccountId,
        policy: &TierPolicy,
    ) -> Result<MinuteOutcome, StoreError> {
        let Some(threshold) = policy.minute_threshold() else {
            return Ok(MinuteOutcome {
                admitted: true,
                remaining: None,
                retry_after: None,
                window: None,
            });
        };

        let now = self.clock.now_millis();
        let window = minute_window_id(now);
        let previous = match window.checked_sub(1) {
            Some(prev_window) => self
                .store
                .get(&CounterKey::minute(account.clone(), prev_window))
                .await?
                .unwrap_or(0),
            // First minute after the epoch has no predecessor.
            None => 0,
        };

        let current_key = CounterKey::minute(account.clone(), window);
        let current = self.store.increment_and_get(&current_key, self.window_ttl(now)).await?;

        let carried = previous as f64 * (1.0 - elapsed_fraction(now));
        let estimate = current as f64 + carried;

        if estimate <= threshold as f64 {
            let remaining = (threshold as f64 - estimate).floor() as u64;
            Ok(MinuteOutcome {
                admitted: true,
                remaining: Some(remaining),
                retry_after: None,
                window: Some(window),
            })
        } else {
            // Roll back the provisional charge so the stored count tracks
            // admitted requests. Best effort, never retried: a failure here
            // over-counts this window by one for its remaining lifetime.
            if let Err(error) = self.store.decrement_saturating(&current_key).await {
                tracing::warn!(key = %current_key, %error, "minute counter compensation failed");
            }
            Ok(MinuteOutcome {
                admitted: false,
                remaining: Some(0),
                retry_after: Some(retry_after(now, previous, current, threshold)),
                window: None,
            })
        }
    }

    /// Read-only estimate of the sliding window, for usage snapshots.
    pub async fn window_estimate(&self, account: &AccountId) -> Result<f64, StoreError> {
        let now = self.clock.now_millis();
        let window = minute_window_id(now);
        let current = self
            .store
            .get(&CounterKey::minute(account.clone(), window))
            .await?
            .unwrap_or(0);
        let previous = match window.checked_sub(1) {
            Some(prev_window) => self
                .store
                .get(&CounterKey::minute(account.clone(), prev_window))
                .await?
                .unwrap_or(0),
            None => 0,
        };
        Ok(current as f64 + previous as f64 * (1.0 - elapsed_fraction(now)))
    }

    /// Roll back one admitted charge in the given sub-window.
    ///
    /// Used when a later stage of admission (the monthly cap) rejects a
    /// request the window already paid for. The window comes from the
    /// admitting [`MinuteOutcome`], so the decrement lands where the charge
    /// did even if the minute has since ticked over. Best effort.
    pub async fn uncharge(&self, account: &AccountId, window: u64) {
        let key = CounterKey::minute(account.clone(), window);
        if let Err(error) = self.store.decrement_saturating(&key).await {
            tracing::warn!(key = %key, %error, "minute counter compensation failed");
        }
    }

    /// TTL for the current sub-window: it must survive its own minute plus
    /// the whole of the next one (while its contribution decays) plus grace.
    fn window_ttl(&self, now: u64) -> Duration {
        let remainder = WINDOW_MILLIS - now % WINDOW_MILLIS;
        Duration::from_millis(remainder) + WINDOW + self.grace
    }
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter").field("grace", &self.grace).finish_non_exhaustive()
    }
}

/// Time until one more request would be admitted, solved from the estimate
/// formula and rounded up to whole seconds. When the current window alone is
/// saturated, waiting to the boundary is not enough: there the saturated
/// count becomes the carried one at full weight, so the hint also covers its
/// decay down to `threshold - 1`.
fn retry_after(now: u64, previous: u64, current: u64, threshold: u64) -> Duration {
    let elapsed = now % WINDOW_MILLIS;
    let remainder = WINDOW_MILLIS - elapsed;
    let wait_millis = if previous == 0 || current > threshold {
        // The post-compensation count is what the next window will carry.
        let carried = current.saturating_sub(1);
        let allowed_carry = threshold.saturating_sub(1) as f64;
        let decay = if carried as f64 > allowed_carry {
            // Admit when carried * (1 - f) <= threshold - 1.
            let min_fraction = 1.0 - allowed_carry / carried as f64;
            (min_fraction * WINDOW_MILLIS as f64).ceil() as u64
        } else {
            0
        };
        remainder + decay
    } else {
        // Admit when previous * (1 - f) <= threshold - current.
        let allowed_carry = (threshold - current) as f64;
        let min_fraction = 1.0 - allowed_carry / previous as f64;
        let target = (min_fraction * WINDOW_MILLIS as f64).ceil() as u64;
        target.saturating_sub(elapsed).min(remainder)
    };
    Duration::from_secs(((wait_millis + 999) / 1000).max(1))
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;
    use crate::tier::TierPolicy;

    fn limiter_at(millis: u64) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::at(millis);
        let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
        (SlidingWindowLimiter::new(store, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn window_math() {
        assert_eq!(minute_window_id(0), 0);
        assert_eq!(minute_window_id(59_999), 0);
        assert_eq!(minute_window_id(60_000), 1);
        assert!((elapsed_fraction(30_000) - 0.5).abs() < 1e-9);
        assert_eq!(elapsed_fraction(120_000), 0.0);
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_denies() {
        let (limiter, _clock) = limiter_at(600_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(5, 1_000);

        for _ in 0..5 {
            let outcome = limiter.check_and_charge(&account, &policy).await.unwrap();
            assert!(outcome.admitted);
        }
        // The 6th request would exceed the limit and is the first denied.
        let denied = limiter.check_and_charge(&account, &policy).await.unwrap();
        assert!(!denied.admitted);
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
        assert_eq!(denied.remaining, Some(0));
    }

    #[tokio::test]
    async fn burst_allowance_extends_the_threshold() {
        let (limiter, _clock) = limiter_at(600_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(3, 1_000).with_burst(2);

        for _ in 0..5 {
            assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        }
        assert!(!limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn denied_requests_do_not_consume_the_window() {
        let (limiter, clock) = limiter_at(600_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(2, 1_000);

        assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        for _ in 0..10 {
            assert!(!limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        }
        // Stored count stayed at the number of admitted requests, so the next
        // window's carried contribution is 2, not 12.
        clock.advance(Duration::from_secs(60));
        assert!((limiter.window_estimate(&account).await.unwrap() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retry_after_tracks_previous_window_decay() {
        // Fill minute 10, then ask again one second into minute 11.
        let (limiter, clock) = limiter_at(10 * 60_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(10, 100_000);

        for _ in 0..10 {
            assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        }

        clock.set(11 * 60_000 + 1_000);
        let denied = limiter.check_and_charge(&account, &policy).await.unwrap();
        assert!(!denied.admitted);
        // Needs carry <= 9 of 10, i.e. 6s into the window; 5s from now.
        assert_eq!(denied.retry_after, Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn unlimited_tier_always_admits() {
        let (limiter, _clock) = limiter_at(600_000);
        let account = AccountId::from("acct-1");
        let outcome =
            limiter.check_and_charge(&account, &TierPolicy::unlimited()).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.remaining, None);
    }

    #[tokio::test]
    async fn retry_after_spans_the_boundary_when_the_window_is_saturated() {
        // Fill 10/min one second into minute 10. At the next boundary the
        // saturated window becomes the carried one at full weight, so the
        // hint must also cover its decay: 59s to the boundary plus 6s for
        // the carry of 10 to fall to 9.
        let (limiter, clock) = limiter_at(10 * 60_000 + 1_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(10, 100_000);

        for _ in 0..10 {
            assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
        }
        let denied = limiter.check_and_charge(&account, &policy).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(65)));

        // A client that honors the hint is admitted, not denied again.
        clock.advance(denied.retry_after.unwrap());
        assert!(limiter.check_and_charge(&account, &policy).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn uncharge_rolls_back_one_admission() {
        let (limiter, _clock) = limiter_at(600_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(5, 1_000);

        limiter.check_and_charge(&account, &policy).await.unwrap();
        let outcome = limiter.check_and_charge(&account, &policy).await.unwrap();
        limiter.uncharge(&account, outcome.window.unwrap()).await;
        assert!((limiter.window_estimate(&account).await.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn uncharge_hits_the_charged_window_across_a_minute_tick() {
        let (limiter, clock) = limiter_at(10 * 60_000 + 59_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(5, 1_000);

        let outcome = limiter.check_and_charge(&account, &policy).await.unwrap();
        assert!(outcome.admitted);

        // The minute ticks over before the compensation runs; the decrement
        // must still land in the window that was charged.
        clock.advance(Duration::from_secs(2));
        limiter.uncharge(&account, outcome.window.unwrap()).await;
        assert!(limiter.window_estimate(&account).await.unwrap().abs() < 1e-9);
    }
}
