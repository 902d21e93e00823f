//! Counter storage: the one place shared mutable state lives.
//!
//! Everything above the store (limiter, accountant, gate) is stateless logic,
//! so the whole concurrency discipline of the crate reduces to one rule: the
//! store's `increment_and_get` must be atomic per key. With that, admission is
//! safe under arbitrary concurrency — across tasks and, with a shared remote
//! backend, across processes — without any per-account locks.

use crate::account::AccountId;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryCounterStore;

/// Boxed error type for store backends.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Which counter family a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WindowKind {
    /// A fixed minute sub-window of the sliding limiter.
    Minute,
    /// A calendar-month billing cycle.
    Month,
}

impl WindowKind {
    /// Short stable tag used in the wire form of a key.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            WindowKind::Minute => "min",
            WindowKind::Month => "mon",
        }
    }
}

/// Key addressing one counter: `(account, window kind, window id)`.
///
/// The `Display` form (`"<account>:min:<id>"`) is stable and intended as the
/// key string for remote backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterKey {
    /// Owning account; keys for different accounts are disjoint.
    pub account: AccountId,
    /// Counter family.
    pub kind: WindowKind,
    /// Minute index or billing-cycle index, depending on `kind`.
    pub window_id: u64,
}

impl CounterKey {
    /// Key for a minute sub-window.
    pub fn minute(account: AccountId, window_id: u64) -> Self {
        Self { account, kind: WindowKind::Minute, window_id }
    }

    /// Key for a billing cycle.
    pub fn month(account: AccountId, window_id: u64) -> Self {
        Self { account, kind: WindowKind::Month, window_id }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.account, self.kind.wire_tag(), self.window_id)
    }
}

/// Shared counter namespace with atomic increment-and-expire semantics.
///
/// Implementations must make [`increment_and_get`](CounterStore::increment_and_get)
/// linearizable per key: two simultaneous requests for the same account must
/// never both observe a count that admits them when only one fits under the
/// limit. The in-process [`InMemoryCounterStore`] satisfies this with a mutex;
/// a remote backend would use its native atomic increment.
///
/// Callers bound every round-trip with a timeout; on elapse the gate's
/// fail-open/fail-closed policy decides the outcome, so implementations are
/// free to block on I/O.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter by 1 and return the post-increment
    /// value. A newly created counter gets expiry `ttl`; an existing
    /// counter's expiry is left untouched.
    async fn increment_and_get(&self, key: &CounterKey, ttl: Duration) -> Result<u64, StoreError>;

    /// Non-mutating read. `None` when the key is absent or expired.
    async fn get(&self, key: &CounterKey) -> Result<Option<u64>, StoreError>;

    /// Administrative write, used for cycle rollover tooling and tests.
    async fn set_with_ttl(
        &self,
        key: &CounterKey,
        value: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Administrative delete.
    async fn delete(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Atomically decrement the counter by 1, saturating at zero.
    ///
    /// Absent or expired keys are a no-op. Used exclusively to compensate a
    /// provisional charge when the request it paid for is denied, so stored
    /// counts track *admitted* requests.
    async fn decrement_saturating(&self, key: &CounterKey) -> Result<(), StoreError>;
}
