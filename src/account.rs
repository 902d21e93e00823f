//! Account identity and the external tier lookup collaborator.

use crate::tier::Tier;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier for a caller holding an API key.
///
/// Counter keys embed the account id, so counters for different accounts are
/// disjoint by construction and one account's traffic can never influence
/// another's admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct AccountId(String);

impl AccountId {
    /// Borrow the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Errors from the tier lookup collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TierSourceError {
    /// The account is not known to the source.
    #[error("account `{account}` is not known to the tier source")]
    NotFound {
        /// The unknown account.
        account: AccountId,
    },
    /// The backing account/billing system was unreachable or errored.
    #[error("{0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Resolves an account to its current tier.
///
/// Supplied by an external account/billing system; the gate treats it as a
/// black box. A failure here surfaces as
/// [`GateError::AccountLookupFailed`](crate::error::GateError) — the gate
/// never guesses a default tier.
#[async_trait]
pub trait TierSource: Send + Sync {
    /// Resolve the account's active tier.
    async fn get_tier(&self, account: &AccountId) -> Result<Tier, TierSourceError>;
}

/// In-memory tier source for tests and single-tenant deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticTierSource {
    tiers: HashMap<AccountId, Tier>,
    fallback: Option<Tier>,
}

impl StaticTierSource {
    /// An empty source; every lookup fails with `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that answers the same tier for every account.
    ///
    /// The fallback is explicit configuration, not a silent default applied
    /// on lookup failure.
    pub fn uniform(tier: Tier) -> Self {
        Self { tiers: HashMap::new(), fallback: Some(tier) }
    }

    /// Register an account's tier.
    pub fn with(mut self, account: impl Into<AccountId>, tier: Tier) -> Self {
        self.tiers.insert(account.into(), tier);
        self
    }
}

#[async_trait]
impl TierSource for StaticTierSource {
    async fn get_tier(&self, account: &AccountId) -> Result<Tier, TierSourceError> {
        self.tiers
            .get(account)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| TierSourceError::NotFound { account: account.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_resolves_registered_accounts() {
        let source = StaticTierSource::new()
            .with("acct-1", Tier::Pro)
            .with("acct-2", Tier::Free);
        assert_eq!(source.get_tier(&AccountId::from("acct-1")).await.unwrap(), Tier::Pro);
        assert_eq!(source.get_tier(&AccountId::from("acct-2")).await.unwrap(), Tier::Free);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found_not_defaulted() {
        let source = StaticTierSource::new().with("acct-1", Tier::Pro);
        let err = source.get_tier(&AccountId::from("ghost")).await.unwrap_err();
        assert!(matches!(err, TierSourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn uniform_source_answers_everything() {
        let source = StaticTierSource::uniform(Tier::Starter);
        assert_eq!(
            source.get_tier(&AccountId::from("anyone")).await.unwrap(),
            Tier::Starter
        );
    }
}
