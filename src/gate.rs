//! The admission gate: the single entry point the API layer calls per request.
//!
//! Per request the gate resolves the account's tier, preflights the monthly
//! cap (read-only, so an exhausted account burns no writes), runs the
//! sliding-window check-and-charge, then charges the month. The two charges
//! are independent atomic increments, not a transaction: a crash between them
//! under-counts the month by one. That inconsistency is documented and
//! accepted — bundling them would need cross-key coordination the store does
//! not promise, and retrying risks double-charging.
//!
//! Quota is consumed on admission, not on completion of the downstream work.
//! If the surrounding request is cancelled after admission, nothing is
//! refunded; refunds would reintroduce the race conditions the provisional
//! charge protocol exists to avoid.

use crate::account::{AccountId, TierSource};
use crate::clock::{Clock, SystemClock};
use crate::config::{FailurePolicy, FailurePolicySwitch, GateConfig};
use crate::error::{GateError, StoreFailure};
use crate::limiter::SlidingWindowLimiter;
use crate::quota::QuotaAccountant;
use crate::store::{CounterStore, StoreError};
use crate::telemetry::{emit_best_effort, GateEvent, GateSink, NullSink};
use crate::tier::{Tier, TierPolicyTable};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DecisionReason {
    /// Admitted.
    Ok,
    /// Denied by the sliding minute window.
    MinuteLimitExceeded,
    /// Denied by the monthly cap, regardless of minute headroom.
    MonthQuotaExhausted,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionReason::Ok => "ok",
            DecisionReason::MinuteLimitExceeded => "minute_limit_exceeded",
            DecisionReason::MonthQuotaExhausted => "month_quota_exhausted",
        })
    }
}

/// Headroom figure for one window, suitable for `X-RateLimit-Remaining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Remaining {
    /// Exactly this many more requests fit.
    Exact(u64),
    /// No bound, or (in fail-open degraded mode) no way to know.
    Unlimited,
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Exact(n) => write!(f, "{}", n),
            Remaining::Unlimited => f.write_str("unlimited"),
        }
    }
}

fn remaining_of(value: Option<u64>) -> Remaining {
    value.map(Remaining::Exact).unwrap_or(Remaining::Unlimited)
}

/// The transient per-request verdict. Never stored.
///
/// Remaining figures report *effective* headroom: on a denial they are zero
/// on the exhausted axis, and on a month denial both are zero, because no
/// request will be admitted until the cycle rolls over.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "decision", rename_all = "snake_case"))]
pub enum AdmissionDecision {
    /// Proceed to the downstream handler; both counters are charged.
    Allowed {
        /// Headroom left in the sliding minute window.
        remaining_minute: Remaining,
        /// Headroom left in the billing cycle.
        remaining_month: Remaining,
    },
    /// Reject the request.
    Denied {
        /// Which limit denied it.
        reason: DecisionReason,
        /// Wait hint, computed from the decaying previous window; present
        /// only for minute-window denials.
        retry_after: Option<Duration>,
        /// Headroom left in the sliding minute window.
        remaining_minute: Remaining,
        /// Headroom left in the billing cycle.
        remaining_month: Remaining,
    },
}

impl AdmissionDecision {
    /// Check if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }

    /// The machine-readable reason; [`DecisionReason::Ok`] when allowed.
    pub fn reason(&self) -> DecisionReason {
        match self {
            AdmissionDecision::Allowed { .. } => DecisionReason::Ok,
            AdmissionDecision::Denied { reason, .. } => *reason,
        }
    }

    /// Wait hint for a `Retry-After` header, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionDecision::Allowed { .. } => None,
            AdmissionDecision::Denied { retry_after, .. } => *retry_after,
        }
    }

    /// Minute-window headroom.
    pub fn remaining_minute(&self) -> Remaining {
        match self {
            AdmissionDecision::Allowed { remaining_minute, .. }
            | AdmissionDecision::Denied { remaining_minute, .. } => *remaining_minute,
        }
    }

    /// Billing-cycle headroom.
    pub fn remaining_month(&self) -> Remaining {
        match self {
            AdmissionDecision::Allowed { remaining_month, .. }
            | AdmissionDecision::Denied { remaining_month, .. } => *remaining_month,
        }
    }
}

/// Read-only usage figures for dashboards and `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsageSnapshot {
    /// Current sliding-window estimate, rounded up.
    pub minute_estimate: u64,
    /// Admitted requests so far this billing cycle.
    pub month_count: u64,
    /// Headroom left in the sliding minute window.
    pub remaining_minute: Remaining,
    /// Headroom left in the billing cycle.
    pub remaining_month: Remaining,
}

/// Composes the sliding-window limiter and the quota accountant into one
/// allow/deny decision per request.
///
/// Stateless across requests; all counters live in the [`CounterStore`], so
/// one gate per process (or many) is fine. Build with
/// [`AdmissionGate::builder`].
#[derive(Clone)]
pub struct AdmissionGate<S = NullSink> {
    limiter: SlidingWindowLimiter,
    quota: QuotaAccountant,
    tiers: Arc<TierPolicyTable>,
    tier_source: Arc<dyn TierSource>,
    config: GateConfig,
    failure_policy: FailurePolicySwitch,
    sink: S,
}

impl AdmissionGate<NullSink> {
    /// Start building a gate over the given store, policy table, and tier
    /// source.
    pub fn builder(
        store: Arc<dyn CounterStore>,
        tiers: TierPolicyTable,
        tier_source: Arc<dyn TierSource>,
    ) -> AdmissionGateBuilder<NullSink> {
        AdmissionGateBuilder {
            store,
            tiers,
            tier_source,
            clock: Arc::new(SystemClock),
            config: GateConfig::default(),
            sink: NullSink,
        }
    }
}

impl<S> AdmissionGate<S>
where
    S: GateSink,
    S::Future: Send + 'static,
{
    /// Decide admission for one request.
    ///
    /// `Ok(decision)` covers both allowed and rate-limited outcomes; `Err` is
    /// reserved for conditions where the gate could not decide (unknown tier,
    /// tier lookup failure, store outage under fail-closed), so callers can
    /// tell "try again later" apart from "you are rate-limited".
    pub async fn admit(&self, account: &AccountId) -> Result<AdmissionDecision, GateError> {
        let tier = match self.tier_source.get_tier(account).await {
            Ok(tier) => tier,
            Err(source) => {
                tracing::warn!(%account, error = %source, "tier lookup failed");
                return Err(GateError::AccountLookupFailed { account: account.clone(), source });
            }
        };
        let policy = match self.tiers.lookup(tier) {
            Ok(policy) => policy,
            Err(error) => {
                tracing::error!(%account, %tier, "tier has no policy table entry");
                return Err(error);
            }
        };

        // Read-only monthly preflight: an exhausted account is turned away
        // without burning minute-window writes.
        let preflight = match self.timed(self.quota.preflight(account, &policy)).await {
            Ok(outcome) => outcome,
            Err(failure) => return self.degraded(account, failure).await,
        };
        if preflight.exhausted {
            return Ok(self
                .deny(account, tier, DecisionReason::MonthQuotaExhausted, None)
                .await);
        }

        let minute = match self.timed(self.limiter.check_and_charge(account, &policy)).await {
            Ok(outcome) => outcome,
            Err(failure) => return self.degraded(account, failure).await,
        };
        if !minute.admitted {
            let decision = AdmissionDecision::Denied {
                reason: DecisionReason::MinuteLimitExceeded,
                retry_after: minute.retry_after,
                remaining_minute: Remaining::Exact(0),
                remaining_month: remaining_of(preflight.remaining),
            };
            self.emit_denied(account, tier, &decision).await;
            return Ok(decision);
        }

        // The minute window is charged; now charge the month. A store
        // failure from here on leaves the minute charge in place — the
        // documented under/over-count, not compensated.
        let month = match self.timed(self.quota.charge(account, &policy)).await {
            Ok(outcome) => outcome,
            Err(failure) => return self.degraded(account, failure).await,
        };
        if month.exhausted {
            // The cap was crossed between preflight and charge; give the
            // minute slot back so the window tracks admitted requests. The
            // outcome carries the charged window, so a minute tick between
            // the two steps cannot strand the charge.
            if let Some(window) = minute.window {
                self.limiter.uncharge(account, window).await;
            }
            return Ok(self
                .deny(account, tier, DecisionReason::MonthQuotaExhausted, None)
                .await);
        }

        let decision = AdmissionDecision::Allowed {
            remaining_minute: remaining_of(minute.remaining),
            remaining_month: remaining_of(month.remaining),
        };
        tracing::debug!(%account, %tier, "request admitted");
        emit_best_effort(
            self.sink.clone(),
            GateEvent::Admitted {
                account: account.clone(),
                tier,
                remaining_minute: decision.remaining_minute(),
                remaining_month: decision.remaining_month(),
            },
        )
        .await;
        Ok(decision)
    }

    /// Read-only usage snapshot; performs only `get` operations.
    pub async fn usage(&self, account: &AccountId) -> Result<UsageSnapshot, GateError> {
        let tier = match self.tier_source.get_tier(account).await {
            Ok(tier) => tier,
            Err(source) => {
                return Err(GateError::AccountLookupFailed { account: account.clone(), source })
            }
        };
        let policy = self.tiers.lookup(tier)?;

        let estimate = self
            .timed(self.limiter.window_estimate(account))
            .await
            .map_err(|source| GateError::CounterStoreUnavailable { source })?;
        let month_count = self
            .timed(self.quota.cycle_usage(account))
            .await
            .map_err(|source| GateError::CounterStoreUnavailable { source })?;

        let minute_estimate = estimate.ceil() as u64;
        let remaining_minute = match policy.minute_threshold() {
            Some(threshold) => Remaining::Exact(threshold.saturating_sub(minute_estimate)),
            None => Remaining::Unlimited,
        };
        let remaining_month = match policy.requests_per_month.finite() {
            Some(cap) => Remaining::Exact(cap.saturating_sub(month_count)),
            None => Remaining::Unlimited,
        };
        Ok(UsageSnapshot { minute_estimate, month_count, remaining_minute, remaining_month })
    }

    /// Handle to the runtime failure-policy switch.
    pub fn failure_policy(&self) -> FailurePolicySwitch {
        self.failure_policy.clone()
    }

    /// The gate's static configuration.
    pub fn config(&self) -> GateConfig {
        self.config
    }

    async fn timed<T, F>(&self, op: F) -> Result<T, StoreFailure>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(StoreFailure::Backend(error)),
            Err(_) => Err(StoreFailure::Timeout { timeout: self.config.store_timeout }),
        }
    }

    async fn degraded(
        &self,
        account: &AccountId,
        failure: StoreFailure,
    ) -> Result<AdmissionDecision, GateError> {
        match self.failure_policy.get() {
            FailurePolicy::FailClosed => {
                tracing::warn!(%account, error = %failure, "counter store unavailable; failing closed");
                emit_best_effort(self.sink.clone(), GateEvent::StoreUnavailable { fail_open: false })
                    .await;
                Err(GateError::CounterStoreUnavailable { source: failure })
            }
            FailurePolicy::FailOpen => {
                tracing::warn!(%account, error = %failure, "counter store unavailable; failing open");
                emit_best_effort(self.sink.clone(), GateEvent::StoreUnavailable { fail_open: true })
                    .await;
                // Headroom is unknowable without the store.
                Ok(AdmissionDecision::Allowed {
                    remaining_minute: Remaining::Unlimited,
                    remaining_month: Remaining::Unlimited,
                })
            }
        }
    }

    async fn deny(
        &self,
        account: &AccountId,
        tier: Tier,
        reason: DecisionReason,
        retry_after: Option<Duration>,
    ) -> AdmissionDecision {
        let decision = AdmissionDecision::Denied {
            reason,
            retry_after,
            remaining_minute: Remaining::Exact(0),
            remaining_month: Remaining::Exact(0),
        };
        self.emit_denied(account, tier, &decision).await;
        decision
    }

    async fn emit_denied(&self, account: &AccountId, tier: Tier, decision: &AdmissionDecision) {
        tracing::debug!(%account, %tier, reason = %decision.reason(), "request denied");
        emit_best_effort(
            self.sink.clone(),
            GateEvent::Denied {
                account: account.clone(),
                tier,
                reason: decision.reason(),
                retry_after: decision.retry_after(),
            },
        )
        .await;
    }
}

impl<S> fmt::Debug for AdmissionGate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Builder for [`AdmissionGate`].
pub struct AdmissionGateBuilder<S = NullSink> {
    store: Arc<dyn CounterStore>,
    tiers: TierPolicyTable,
    tier_source: Arc<dyn TierSource>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
    sink: S,
}

impl<S> AdmissionGateBuilder<S>
where
    S: GateSink,
    S::Future: Send + 'static,
{
    /// Override the clock; tests inject [`ManualClock`](crate::clock::ManualClock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the gate configuration.
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a telemetry sink.
    pub fn sink<S2>(self, sink: S2) -> AdmissionGateBuilder<S2>
    where
        S2: GateSink,
        S2::Future: Send + 'static,
    {
        AdmissionGateBuilder {
            store: self.store,
            tiers: self.tiers,
            tier_source: self.tier_source,
            clock: self.clock,
            config: self.config,
            sink,
        }
    }

    /// Assemble the gate.
    pub fn build(self) -> AdmissionGate<S> {
        let limiter = SlidingWindowLimiter::new(self.store.clone(), self.clock.clone())
            .with_grace(self.config.window_grace);
        let quota = QuotaAccountant::new(self.store, self.clock);
        tracing::info!(
            store_timeout = ?self.config.store_timeout,
            failure_policy = %self.config.failure_policy,
            "admission gate ready"
        );
        AdmissionGate {
            limiter,
            quota,
            tiers: Arc::new(self.tiers),
            tier_source: self.tier_source,
            config: self.config,
            failure_policy: FailurePolicySwitch::new(self.config.failure_policy),
            sink: self.sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_accessors() {
        let allowed = AdmissionDecision::Allowed {
            remaining_minute: Remaining::Exact(3),
            remaining_month: Remaining::Unlimited,
        };
        assert!(allowed.is_allowed());
        assert_eq!(allowed.reason(), DecisionReason::Ok);
        assert_eq!(allowed.retry_after(), None);
        assert_eq!(allowed.remaining_minute(), Remaining::Exact(3));

        let denied = AdmissionDecision::Denied {
            reason: DecisionReason::MinuteLimitExceeded,
            retry_after: Some(Duration::from_secs(7)),
            remaining_minute: Remaining::Exact(0),
            remaining_month: Remaining::Exact(42),
        };
        assert!(!denied.is_allowed());
        assert_eq!(denied.reason(), DecisionReason::MinuteLimitExceeded);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(denied.remaining_month(), Remaining::Exact(42));
    }

    #[test]
    fn reasons_render_machine_readable_names() {
        assert_eq!(DecisionReason::Ok.to_string(), "ok");
        assert_eq!(DecisionReason::MinuteLimitExceeded.to_string(), "minute_limit_exceeded");
        assert_eq!(DecisionReason::MonthQuotaExhausted.to_string(), "month_quota_exhausted");
        assert_eq!(Remaining::Exact(5).to_string(), "5");
        assert_eq!(Remaining::Unlimited.to_string(), "unlimited");
    }
}
