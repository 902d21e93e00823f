//! Convenient re-exports for common Turnstile types.
pub use crate::{
    account::{AccountId, StaticTierSource, TierSource},
    clock::{ManualClock, SystemClock},
    config::{FailurePolicy, GateConfig},
    error::GateError,
    gate::{AdmissionDecision, AdmissionGate, DecisionReason, Remaining},
    middleware::AdmissionLayer,
    store::{CounterStore, InMemoryCounterStore},
    tier::{Limit, Tier, TierPolicy, TierPolicyTable},
};
