use crate::account::AccountId;
use crate::gate::{DecisionReason, Remaining};
use crate::tier::Tier;
use std::fmt;
use std::time::Duration;

/// Events emitted by the admission gate.
///
/// One event is emitted per decision, plus degradation events when the
/// counter store misbehaves. Events describe what happened; they carry no
/// control-flow significance and emission is always best effort.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum GateEvent {
    /// A request was admitted and charged against both windows.
    Admitted {
        /// The admitted account.
        account: AccountId,
        /// Its tier at admission time.
        tier: Tier,
        /// Headroom left in the sliding minute window.
        remaining_minute: Remaining,
        /// Headroom left in the billing cycle.
        remaining_month: Remaining,
    },
    /// A request was denied.
    Denied {
        /// The denied account.
        account: AccountId,
        /// Its tier at denial time.
        tier: Tier,
        /// Which limit denied it.
        reason: DecisionReason,
        /// Wait hint, present for minute-window denials.
        retry_after: Option<Duration>,
    },
    /// A counter store round-trip timed out or errored.
    StoreUnavailable {
        /// Whether the gate admitted the request anyway (fail-open) or
        /// surfaced an error (fail-closed).
        fail_open: bool,
    },
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateEvent::Admitted { account, tier, remaining_minute, remaining_month } => {
                write!(
                    f,
                    "Admitted({}, {}, minute={}, month={})",
                    account, tier, remaining_minute, remaining_month
                )
            }
            GateEvent::Denied { account, tier, reason, retry_after } => match retry_after {
                Some(wait) => {
                    write!(f, "Denied({}, {}, {}, retry_after={:?})", account, tier, reason, wait)
                }
                None => write!(f, "Denied({}, {}, {})", account, tier, reason),
            },
            GateEvent::StoreUnavailable { fail_open } => {
                write!(f, "StoreUnavailable(fail_open={})", fail_open)
            }
        }
    }
}
