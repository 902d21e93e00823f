//! Monthly quota accounting over calendar billing cycles.
//!
//! Cycles are calendar months in UTC. A cycle is identified by
//! `year * 12 + month`, so rollover is implicit: a new month means a new
//! counter key, and the old cycle's counter is simply abandoned to its TTL.
//! Counts are never migrated between cycles.

use crate::account::AccountId;
use crate::clock::Clock;
use crate::store::{CounterKey, CounterStore, StoreError};
use crate::tier::TierPolicy;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Slack added to a cycle counter's TTL so it outlives the cycle boundary by
/// a little, absorbing clock skew between instances.
pub const DEFAULT_CYCLE_GRACE: Duration = Duration::from_secs(60 * 60);

fn utc(now_millis: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(i64::try_from(now_millis).unwrap_or(i64::MAX))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Index of the billing cycle containing `now_millis`.
pub fn cycle_id(now_millis: u64) -> u64 {
    let date = utc(now_millis);
    // now_millis is unsigned, so the year is always >= 1970.
    date.year() as u64 * 12 + u64::from(date.month0())
}

/// Time from `now_millis` until the first instant of the next cycle.
pub fn until_next_cycle(now_millis: u64) -> Duration {
    let date = utc(now_millis);
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let next_start = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default();
    let next_start = u64::try_from(next_start).unwrap_or(u64::MAX);
    Duration::from_millis(next_start.saturating_sub(now_millis))
}

/// Result of charging (or preflighting) the monthly cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthOutcome {
    /// Whether the cap is (or would be) exceeded.
    pub exhausted: bool,
    /// Requests left in the cycle; `None` for unlimited tiers.
    pub remaining: Option<u64>,
}

/// Tracks cumulative usage per billing cycle against the tier's monthly cap.
///
/// Stateless: all counts live in the [`CounterStore`], so any number of
/// instances can account for the same population of accounts.
#[derive(Clone)]
pub struct QuotaAccountant {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl QuotaAccountant {
    /// Build an accountant over the given store and clock.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, grace: DEFAULT_CYCLE_GRACE }
    }

    /// Override the cycle counter grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Non-mutating check of the monthly cap.
    ///
    /// Already-exhausted accounts are spotted here with zero store writes, so
    /// a throttled account cannot burn write capacity just by retrying.
    pub async fn preflight(
        &self,
        account: &AccountId,
        policy: &TierPolicy,
    ) -> Result<MonthOutcome, StoreError> {
        let Some(cap) = policy.requests_per_month.finite() else {
            return Ok(MonthOutcome { exhausted: false, remaining: None });
        };
        let count = self.store.get(&self.cycle_key(account)).await?.unwrap_or(0);
        Ok(MonthOutcome { exhausted: count >= cap, remaining: Some(cap.saturating_sub(count)) })
    }

    /// Charge one admitted request against the cycle and re-check the cap.
    ///
    /// If the post-increment count crosses the cap (a concurrent charge won
    /// the race since preflight), the charge is compensated with a saturating
    /// decrement and the outcome reports exhausted; the stored count stays
    /// pinned at the cap while the account is throttled.
    pub async fn charge(
        &self,
        account: &AccountId,
        policy: &TierPolicy,
    ) -> Result<MonthOutcome, StoreError> {
        let Some(cap) = policy.requests_per_month.finite() else {
            return Ok(MonthOutcome { exhausted: false, remaining: None });
        };
        let now = self.clock.now_millis();
        let key = CounterKey::month(account.clone(), cycle_id(now));
        let ttl = until_next_cycle(now) + self.grace;
        let count = self.store.increment_and_get(&key, ttl).await?;
        if count > cap {
            // Best effort, never retried: a failure here over-counts the
            // cycle by one.
            if let Err(error) = self.store.decrement_saturating(&key).await {
                tracing::warn!(key = %key, %error, "cycle counter compensation failed");
            }
            Ok(MonthOutcome { exhausted: true, remaining: Some(0) })
        } else {
            Ok(MonthOutcome { exhausted: false, remaining: Some(cap - count) })
        }
    }

    /// Read-only cycle usage, for usage snapshots.
    pub async fn cycle_usage(&self, account: &AccountId) -> Result<u64, StoreError> {
        Ok(self.store.get(&self.cycle_key(account)).await?.unwrap_or(0))
    }

    fn cycle_key(&self, account: &AccountId) -> CounterKey {
        CounterKey::month(account.clone(), cycle_id(self.clock.now_millis()))
    }
}

impl fmt::Debug for QuotaAccountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaAccountant").field("grace", &self.grace).finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;

    // 2024-02-01T00:00:00Z
    const FEB_2024: u64 = 1_706_745_600_000;

    fn accountant_at(millis: u64) -> (QuotaAccountant, ManualClock) {
        let clock = ManualClock::at(millis);
        let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
        (QuotaAccountant::new(store, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn cycle_ids_change_exactly_at_month_boundaries() {
        assert_eq!(cycle_id(FEB_2024 - 1), cycle_id(FEB_2024) - 1);
        assert_eq!(cycle_id(FEB_2024), cycle_id(FEB_2024 + 28 * 24 * 3_600_000 - 1));
        // 2024 is a leap year: Feb 29 is still the same cycle.
        assert_eq!(cycle_id(FEB_2024), cycle_id(FEB_2024 + 29 * 24 * 3_600_000 - 1));
        assert_eq!(cycle_id(FEB_2024) + 1, cycle_id(FEB_2024 + 29 * 24 * 3_600_000));
    }

    #[test]
    fn december_rolls_into_january() {
        // 2024-12-31T23:59:59Z
        let dec = 1_735_689_599_000;
        assert_eq!(cycle_id(dec) + 1, cycle_id(dec + 1_000));
        assert_eq!(until_next_cycle(dec), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn charges_accumulate_until_the_cap() {
        let (accountant, _clock) = accountant_at(FEB_2024);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(1_000, 3);

        for remaining in [2u64, 1, 0] {
            let outcome = accountant.charge(&account, &policy).await.unwrap();
            assert!(!outcome.exhausted);
            assert_eq!(outcome.remaining, Some(remaining));
        }
        let outcome = accountant.charge(&account, &policy).await.unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.remaining, Some(0));

        // The compensating decrement keeps the count pinned at the cap.
        assert_eq!(accountant.cycle_usage(&account).await.unwrap(), 3);
        let preflight = accountant.preflight(&account, &policy).await.unwrap();
        assert!(preflight.exhausted);
    }

    #[tokio::test]
    async fn preflight_does_not_charge() {
        let (accountant, _clock) = accountant_at(FEB_2024);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(1_000, 10);

        for _ in 0..5 {
            assert!(!accountant.preflight(&account, &policy).await.unwrap().exhausted);
        }
        assert_eq!(accountant.cycle_usage(&account).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cap_resets_at_cycle_rollover() {
        // Last second of January 2024.
        let (accountant, clock) = accountant_at(FEB_2024 - 1_000);
        let account = AccountId::from("acct-1");
        let policy = TierPolicy::new(1_000, 2);

        accountant.charge(&account, &policy).await.unwrap();
        accountant.charge(&account, &policy).await.unwrap();
        assert!(accountant.charge(&account, &policy).await.unwrap().exhausted);

        // First second of February: a fresh cycle key, full cap again.
        clock.advance(Duration::from_secs(2));
        let outcome = accountant.charge(&account, &policy).await.unwrap();
        assert!(!outcome.exhausted);
        assert_eq!(outcome.remaining, Some(1));
    }

    #[tokio::test]
    async fn unlimited_month_skips_the_store() {
        let (accountant, _clock) = accountant_at(FEB_2024);
        let account = AccountId::from("acct-1");
        let outcome = accountant.charge(&account, &TierPolicy::unlimited()).await.unwrap();
        assert!(!outcome.exhausted);
        assert_eq!(outcome.remaining, None);
        assert_eq!(accountant.cycle_usage(&account).await.unwrap(), 0);
    }
}
