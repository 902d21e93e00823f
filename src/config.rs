//! Gate configuration and the runtime failure-policy switch.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "policy-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "policy-rwlock"))]
use arc_swap::ArcSwap;

use crate::limiter::DEFAULT_WINDOW_GRACE;

/// What the gate does when the counter store is unreachable.
///
/// This is the one documented knob for store outages; there are no per-call
/// heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailurePolicy {
    /// Deny every request while the store is down. The default; correct
    /// deployments should not admit traffic they cannot count.
    #[default]
    FailClosed,
    /// Admit requests uncounted while the store is down, logging the
    /// degradation. Opt-in for availability-sensitive deployments.
    FailOpen,
}

impl FailurePolicy {
    /// Stable snake_case name, used in config files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailClosed => "fail_closed",
            FailurePolicy::FailOpen => "fail_open",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized failure policy name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailurePolicyError {
    name: String,
}

impl fmt::Display for ParseFailurePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized failure policy `{}` (expected fail_closed or fail_open)", self.name)
    }
}

impl std::error::Error for ParseFailurePolicyError {}

impl FromStr for FailurePolicy {
    type Err = ParseFailurePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_closed" => Ok(FailurePolicy::FailClosed),
            "fail_open" => Ok(FailurePolicy::FailOpen),
            other => Err(ParseFailurePolicyError { name: other.to_owned() }),
        }
    }
}

/// Shared handle to the active [`FailurePolicy`].
///
/// Reads sit on the per-request hot path, so the default backend is an
/// `ArcSwap` (lock-free loads); feature `policy-rwlock` swaps in an `RwLock`
/// for builds that want to avoid the extra dependency. Operators flip the
/// policy during a store incident without restarting; the tier policy table
/// is unaffected.
#[derive(Debug)]
pub struct FailurePolicySwitch {
    #[cfg(not(feature = "policy-rwlock"))]
    inner: Arc<ArcSwap<FailurePolicy>>,
    #[cfg(feature = "policy-rwlock")]
    inner: Arc<RwLock<FailurePolicy>>,
}

impl Clone for FailurePolicySwitch {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl FailurePolicySwitch {
    /// Create a switch starting at the given policy.
    pub fn new(policy: FailurePolicy) -> Self {
        #[cfg(not(feature = "policy-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(policy)) }
        }
        #[cfg(feature = "policy-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(policy)) }
        }
    }

    /// The active policy.
    pub fn get(&self) -> FailurePolicy {
        #[cfg(not(feature = "policy-rwlock"))]
        {
            **self.inner.load()
        }
        #[cfg(feature = "policy-rwlock")]
        {
            *self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Replace the active policy. Takes effect on the next admission.
    pub fn set(&self, policy: FailurePolicy) {
        let previous = self.get();
        if previous != policy {
            tracing::info!(from = %previous, to = %policy, "failure policy changed");
        }
        #[cfg(not(feature = "policy-rwlock"))]
        {
            self.inner.store(Arc::new(policy));
        }
        #[cfg(feature = "policy-rwlock")]
        {
            *self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner) = policy;
        }
    }
}

impl Default for FailurePolicySwitch {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}

/// Tunables for [`AdmissionGate`](crate::gate::AdmissionGate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Upper bound on any counter store round-trip. On elapse the failure
    /// policy governs the outcome; the gate never hangs a request on the
    /// store.
    pub store_timeout: Duration,
    /// How long a closed minute sub-window stays readable past full decay.
    pub window_grace: Duration,
    /// Initial failure policy; runtime changes go through the switch.
    pub failure_policy: FailurePolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(1),
            window_grace: DEFAULT_WINDOW_GRACE,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl GateConfig {
    /// Load a config from JSON. Durations are milliseconds; missing fields
    /// keep their defaults.
    ///
    /// ```json
    /// { "store_timeout_ms": 250, "window_grace_ms": 5000, "failure_policy": "fail_open" }
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        #[derive(serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            store_timeout_ms: Option<u64>,
            window_grace_ms: Option<u64>,
            failure_policy: Option<FailurePolicy>,
        }
        let raw: Raw = serde_json::from_str(json)?;
        let defaults = Self::default();
        Ok(Self {
            store_timeout: raw
                .store_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            window_grace: raw
                .window_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.window_grace),
            failure_policy: raw.failure_policy.unwrap_or(defaults.failure_policy),
        })
    }
}
