#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use turnstile::store::{CounterKey, CounterStore, InMemoryCounterStore, StoreError, WindowKind};
use turnstile::{AccountId, ManualClock, Tier, TierPolicy, TierPolicyTable};

// 2024-02-15T12:00:30Z: mid-month, mid-minute, nowhere near a boundary.
pub const MID_FEB_2024: u64 = 1_707_998_430_000;

pub fn table(minute: u64, month: u64) -> TierPolicyTable {
    TierPolicyTable::builder()
        .tier(Tier::Free, TierPolicy::new(minute, month))
        .tier(Tier::Enterprise, TierPolicy::unlimited())
        .build()
        .unwrap()
}

pub fn account() -> AccountId {
    AccountId::from("acct-1")
}

/// Store wrapper that counts operations per window kind, for the "unlimited
/// tiers never touch the store" property.
#[derive(Clone)]
pub struct InstrumentedStore {
    inner: InMemoryCounterStore,
    minute_ops: Arc<AtomicUsize>,
    month_ops: Arc<AtomicUsize>,
}

impl InstrumentedStore {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: InMemoryCounterStore::with_clock(Arc::new(clock)),
            minute_ops: Arc::new(AtomicUsize::new(0)),
            month_ops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn minute_ops(&self) -> usize {
        self.minute_ops.load(Ordering::SeqCst)
    }

    pub fn month_ops(&self) -> usize {
        self.month_ops.load(Ordering::SeqCst)
    }

    pub fn total_ops(&self) -> usize {
        self.minute_ops() + self.month_ops()
    }

    fn record(&self, key: &CounterKey) {
        match key.kind {
            WindowKind::Minute => self.minute_ops.fetch_add(1, Ordering::SeqCst),
            WindowKind::Month => self.month_ops.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[async_trait]
impl CounterStore for InstrumentedStore {
    async fn increment_and_get(&self, key: &CounterKey, ttl: Duration) -> Result<u64, StoreError> {
        self.record(key);
        self.inner.increment_and_get(key, ttl).await
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<u64>, StoreError> {
        self.record(key);
        self.inner.get(key).await
    }

    async fn set_with_ttl(
        &self,
        key: &CounterKey,
        value: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.record(key);
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.record(key);
        self.inner.delete(key).await
    }

    async fn decrement_saturating(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.record(key);
        self.inner.decrement_saturating(key).await
    }
}

/// Store whose every operation fails, for failure-policy tests.
#[derive(Clone, Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment_and_get(
        &self,
        _key: &CounterKey,
        _ttl: Duration,
    ) -> Result<u64, StoreError> {
        Err("store offline".into())
    }

    async fn get(&self, _key: &CounterKey) -> Result<Option<u64>, StoreError> {
        Err("store offline".into())
    }

    async fn set_with_ttl(
        &self,
        _key: &CounterKey,
        _value: u64,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Err("store offline".into())
    }

    async fn delete(&self, _key: &CounterKey) -> Result<(), StoreError> {
        Err("store offline".into())
    }

    async fn decrement_saturating(&self, _key: &CounterKey) -> Result<(), StoreError> {
        Err("store offline".into())
    }
}

/// Store whose every operation hangs forever, for timeout tests.
#[derive(Clone, Debug, Default)]
pub struct StallingStore;

#[async_trait]
impl CounterStore for StallingStore {
    async fn increment_and_get(&self, _key: &CounterKey, _ttl: Duration) -> Result<u64, StoreError> {
        futures::future::pending().await
    }

    async fn get(&self, _key: &CounterKey) -> Result<Option<u64>, StoreError> {
        futures::future::pending().await
    }

    async fn set_with_ttl(
        &self,
        _key: &CounterKey,
        _value: u64,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        futures::future::pending().await
    }

    async fn delete(&self, _key: &CounterKey) -> Result<(), StoreError> {
        futures::future::pending().await
    }

    async fn decrement_saturating(&self, _key: &CounterKey) -> Result<(), StoreError> {
        futures::future::pending().await
    }
}
