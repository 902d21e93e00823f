//! Account tiers and the static policy table that maps them to quotas.
//!
//! The table is loaded once at startup and read-only afterwards; no request
//! path mutates it. The limiter and accountant never match on [`Tier`]
//! directly — they consume only the [`TierPolicy`] the table hands back, so
//! adding a tier is a table change, not a limiter change.

use crate::error::GateError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A named quota class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Tier {
    /// Anonymous / trial accounts.
    Free,
    /// Entry-level paid accounts.
    Starter,
    /// Professional accounts.
    Pro,
    /// Contract accounts; typically unlimited.
    Enterprise,
}

impl Tier {
    /// All known tiers, in ascending order of generosity.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise];

    /// Stable lowercase name, used in config files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized tier name.
///
/// Parsing fails loudly at config-load time; an unknown name is never
/// silently mapped to a default tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTierError {
    name: String,
}

impl fmt::Display for ParseTierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized tier name `{}`", self.name)
    }
}

impl std::error::Error for ParseTierError {}

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTierError { name: s.to_owned() })
    }
}

/// A quota bound: a finite count or the unlimited sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// At most this many requests per window.
    Finite(u64),
    /// No bound; the limiter short-circuits without touching the store.
    Unlimited,
}

impl Limit {
    /// Check if this is the unlimited sentinel.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// The finite bound, if any.
    pub fn finite(&self) -> Option<u64> {
        match self {
            Limit::Finite(n) => Some(*n),
            Limit::Unlimited => None,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Finite(n) => write!(f, "{}", n),
            Limit::Unlimited => f.write_str("unlimited"),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Limit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Finite(n) => serializer.serialize_u64(*n),
            Limit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Limit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Limit::Finite(n)),
            Raw::Name(s) if s.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            Raw::Name(s) => Err(serde::de::Error::custom(format!(
                "expected a count or \"unlimited\", got `{}`",
                s
            ))),
        }
    }
}

/// Quota parameters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TierPolicy {
    /// Steady-state cap on the sliding minute window.
    pub requests_per_minute: Limit,
    /// Cap on the calendar-month billing cycle.
    pub requests_per_month: Limit,
    /// Extra requests permitted above the steady rate within the window.
    ///
    /// Treated as a permanent addition to the sliding-window threshold, not a
    /// refilling bucket.
    #[cfg_attr(feature = "serde", serde(default))]
    pub burst_allowance: u64,
}

impl TierPolicy {
    /// A policy with finite minute and month caps and no burst.
    pub fn new(requests_per_minute: u64, requests_per_month: u64) -> Self {
        Self {
            requests_per_minute: Limit::Finite(requests_per_minute),
            requests_per_month: Limit::Finite(requests_per_month),
            burst_allowance: 0,
        }
    }

    /// A fully unlimited policy.
    pub fn unlimited() -> Self {
        Self {
            requests_per_minute: Limit::Unlimited,
            requests_per_month: Limit::Unlimited,
            burst_allowance: 0,
        }
    }

    /// Add a burst allowance on top of the steady minute rate.
    pub fn with_burst(mut self, burst_allowance: u64) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }

    /// Effective sliding-window threshold: steady rate plus burst.
    ///
    /// `None` when the minute limit is unlimited.
    pub fn minute_threshold(&self) -> Option<u64> {
        self.requests_per_minute.finite().map(|n| n.saturating_add(self.burst_allowance))
    }
}

/// Validation errors raised when building a [`TierPolicyTable`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyTableError {
    /// The builder was given no entries at all.
    #[error("tier policy table has no entries")]
    Empty,
    /// A finite minute limit of zero with no burst admits nothing, ever.
    #[error("tier `{tier}` has a zero minute limit and no burst allowance")]
    ZeroMinuteLimit {
        /// The offending tier.
        tier: Tier,
    },
}

/// Immutable mapping from tier to quota parameters.
///
/// Built once at startup via [`TierPolicyTable::builder`], a preset, or
/// (feature `serde`) [`TierPolicyTable::from_json_str`].
#[derive(Debug, Clone)]
pub struct TierPolicyTable {
    entries: HashMap<Tier, TierPolicy>,
}

impl TierPolicyTable {
    /// Start building a table entry by entry.
    pub fn builder() -> TierPolicyTableBuilder {
        TierPolicyTableBuilder { entries: HashMap::new() }
    }

    /// A reasonable default ladder for a SaaS deployment.
    ///
    /// Free: 20/min (burst 5), 5k/month. Starter: 120/min (burst 20),
    /// 100k/month. Pro: 600/min (burst 100), 1M/month. Enterprise: unlimited.
    pub fn saas_defaults() -> Self {
        let mut entries = HashMap::new();
        entries.insert(Tier::Free, TierPolicy::new(20, 5_000).with_burst(5));
        entries.insert(Tier::Starter, TierPolicy::new(120, 100_000).with_burst(20));
        entries.insert(Tier::Pro, TierPolicy::new(600, 1_000_000).with_burst(100));
        entries.insert(Tier::Enterprise, TierPolicy::unlimited());
        Self { entries }
    }

    /// Look up the policy for a tier.
    ///
    /// Pure read over static data. Fails with [`GateError::UnknownTier`] when
    /// the table carries no entry for the tier.
    pub fn lookup(&self, tier: Tier) -> Result<TierPolicy, GateError> {
        self.entries.get(&tier).copied().ok_or(GateError::UnknownTier { tier })
    }

    /// Tiers the table has entries for.
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.entries.keys().copied()
    }

    /// Load and validate a table from JSON.
    ///
    /// The expected shape maps tier names to policies:
    ///
    /// ```json
    /// { "free": { "requests_per_minute": 20, "requests_per_month": 5000, "burst_allowance": 5 },
    ///   "enterprise": { "requests_per_minute": "unlimited", "requests_per_month": "unlimited" } }
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, PolicyLoadError> {
        let raw: HashMap<Tier, TierPolicy> =
            serde_json::from_str(json).map_err(PolicyLoadError::Parse)?;
        let mut builder = Self::builder();
        for (tier, policy) in raw {
            builder = builder.tier(tier, policy);
        }
        builder.build().map_err(PolicyLoadError::Invalid)
    }
}

/// Errors loading a policy table from JSON (feature `serde`).
#[cfg(feature = "serde")]
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    /// The JSON did not parse into tier/policy pairs.
    #[error("tier policy table failed to parse")]
    Parse(#[source] serde_json::Error),
    /// The parsed table failed validation.
    #[error("tier policy table is invalid")]
    Invalid(#[source] PolicyTableError),
}

/// Builder for [`TierPolicyTable`].
#[derive(Debug, Default)]
pub struct TierPolicyTableBuilder {
    entries: HashMap<Tier, TierPolicy>,
}

impl TierPolicyTableBuilder {
    /// Set the policy for a tier, replacing any previous entry.
    pub fn tier(mut self, tier: Tier, policy: TierPolicy) -> Self {
        self.entries.insert(tier, policy);
        self
    }

    /// Validate and freeze the table.
    pub fn build(self) -> Result<TierPolicyTable, PolicyTableError> {
        if self.entries.is_empty() {
            return Err(PolicyTableError::Empty);
        }
        for (tier, policy) in &self.entries {
            if policy.requests_per_minute == Limit::Finite(0) && policy.burst_allowance == 0 {
                return Err(PolicyTableError::ZeroMinuteLimit { tier: *tier });
            }
        }
        Ok(TierPolicyTable { entries: self.entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_names_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert_eq!("PRO".parse::<Tier>().unwrap(), Tier::Pro);
        assert!("platinum".parse::<Tier>().is_err());
    }

    #[test]
    fn lookup_is_pure() {
        let table = TierPolicyTable::saas_defaults();
        let first = table.lookup(Tier::Starter).unwrap();
        let second = table.lookup(Tier::Starter).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn lookup_fails_loudly_for_missing_entry() {
        let table = TierPolicyTable::builder()
            .tier(Tier::Free, TierPolicy::new(10, 100))
            .build()
            .unwrap();
        let err = table.lookup(Tier::Enterprise).unwrap_err();
        assert!(err.is_unknown_tier());
    }

    #[test]
    fn builder_rejects_empty_table() {
        assert_eq!(TierPolicyTable::builder().build().unwrap_err(), PolicyTableError::Empty);
    }

    #[test]
    fn builder_rejects_zero_minute_limit_without_burst() {
        let err = TierPolicyTable::builder()
            .tier(Tier::Free, TierPolicy::new(0, 100))
            .build()
            .unwrap_err();
        assert_eq!(err, PolicyTableError::ZeroMinuteLimit { tier: Tier::Free });

        // Zero steady rate with a burst is "burst only" and permitted.
        assert!(TierPolicyTable::builder()
            .tier(Tier::Free, TierPolicy::new(0, 100).with_burst(3))
            .build()
            .is_ok());
    }

    #[test]
    fn minute_threshold_adds_burst() {
        let policy = TierPolicy::new(10, 1_000).with_burst(4);
        assert_eq!(policy.minute_threshold(), Some(14));
        assert_eq!(TierPolicy::unlimited().minute_threshold(), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_table_parses_counts_and_unlimited() {
        let table = TierPolicyTable::from_json_str(
            r#"{
                "free": { "requests_per_minute": 20, "requests_per_month": 5000, "burst_allowance": 5 },
                "enterprise": { "requests_per_minute": "unlimited", "requests_per_month": "unlimited" }
            }"#,
        )
        .unwrap();
        assert_eq!(
            table.lookup(Tier::Free).unwrap().requests_per_minute,
            Limit::Finite(20)
        );
        assert!(table
            .lookup(Tier::Enterprise)
            .unwrap()
            .requests_per_minute
            .is_unlimited());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_table_rejects_unknown_tier_name() {
        let err = TierPolicyTable::from_json_str(
            r#"{ "platinum": { "requests_per_minute": 1, "requests_per_month": 1 } }"#,
        );
        assert!(matches!(err, Err(PolicyLoadError::Parse(_))));
    }
}
