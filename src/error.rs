//! Error taxonomy for the admission gate.

use crate::account::{AccountId, TierSourceError};
use crate::tier::Tier;
use std::time::Duration;

/// Errors surfaced by [`AdmissionGate`](crate::gate::AdmissionGate).
///
/// Each variant is distinguishable so callers can tell "you are rate-limited"
/// (which is an [`AdmissionDecision`](crate::gate::AdmissionDecision), never an
/// error) apart from "the gate could not decide".
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The tier policy table carries no entry for the account's tier.
    ///
    /// This is a configuration/data inconsistency: the request is denied and
    /// the condition is logged for operator attention. The gate never defaults
    /// to another tier silently.
    #[error("no policy configured for tier `{tier}`")]
    UnknownTier {
        /// The tier that had no table entry.
        tier: Tier,
    },

    /// The tier lookup collaborator failed.
    #[error("tier lookup failed for account `{account}`")]
    AccountLookupFailed {
        /// Account whose tier could not be resolved.
        account: AccountId,
        /// The underlying collaborator error.
        #[source]
        source: TierSourceError,
    },

    /// The counter store timed out or errored and the gate is fail-closed.
    #[error("counter store unavailable")]
    CounterStoreUnavailable {
        /// What went wrong talking to the store.
        #[source]
        source: StoreFailure,
    },
}

/// Why a counter store round-trip failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreFailure {
    /// The store did not answer within the configured `store_timeout`.
    #[error("store call exceeded timeout of {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The store returned an error.
    #[error("{0}")]
    Backend(crate::store::StoreError),
}

impl GateError {
    /// Check if this error is an unknown-tier configuration problem.
    pub fn is_unknown_tier(&self) -> bool {
        matches!(self, Self::UnknownTier { .. })
    }

    /// Check if this error came from the tier lookup collaborator.
    pub fn is_account_lookup_failed(&self) -> bool {
        matches!(self, Self::AccountLookupFailed { .. })
    }

    /// Check if this error is a counter store outage.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::CounterStoreUnavailable { .. })
    }

    /// Check if this error is a counter store timeout specifically.
    pub fn is_store_timeout(&self) -> bool {
        matches!(
            self,
            Self::CounterStoreUnavailable { source: StoreFailure::Timeout { .. } }
        )
    }
}
