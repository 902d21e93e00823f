#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Tiered rate limiting and quota enforcement for async Rust: a sliding-window
//! minute limiter, a calendar-month quota accountant, and an admission gate
//! that composes the two into a single allow/deny decision per request.
//!
//! ## Features
//!
//! - **Sliding windows** over two adjacent minute sub-windows, immune to the
//!   fixed-window boundary burst
//! - **Tiered policies** (Free/Starter/Pro/Enterprise) with burst allowances
//!   and unlimited sentinels
//! - **Monthly caps** on calendar billing cycles with implicit rollover
//! - **Pluggable counter storage** behind an atomic increment-and-expire
//!   contract; in-memory included, remote backends drop in
//! - **Fail-open / fail-closed** store-outage policy, switchable at runtime
//! - **Tower middleware** and telemetry sinks for integration
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GateError> {
//!     let store = Arc::new(InMemoryCounterStore::new());
//!     let tiers = TierPolicyTable::saas_defaults();
//!     let accounts = Arc::new(StaticTierSource::uniform(Tier::Free));
//!
//!     let gate = AdmissionGate::builder(store, tiers, accounts).build();
//!
//!     let decision = gate.admit(&AccountId::from("acct-1")).await?;
//!     assert!(decision.is_allowed());
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod quota;
pub mod store;
pub mod telemetry;
pub mod tier;

// Re-exports
pub use account::{AccountId, StaticTierSource, TierSource, TierSourceError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, FailurePolicySwitch, GateConfig};
pub use error::{GateError, StoreFailure};
pub use gate::{
    AdmissionDecision, AdmissionGate, AdmissionGateBuilder, DecisionReason, Remaining,
    UsageSnapshot,
};
pub use limiter::SlidingWindowLimiter;
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionService, ExtractAccount};
pub use quota::QuotaAccountant;
pub use store::{CounterKey, CounterStore, InMemoryCounterStore, StoreError, WindowKind};
pub use tier::{Limit, Tier, TierPolicy, TierPolicyTable};
