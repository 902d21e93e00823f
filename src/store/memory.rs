//! In-process counter store for single-instance deployments and tests.

use super::{CounterKey, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "loom")]
use loom::sync::Mutex;
#[cfg(not(feature = "loom"))]
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    /// Epoch millis after which the entry is treated as absent.
    expires_at: u64,
}

impl Entry {
    fn live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// The mutex-guarded map. All operations take the lock once, so every
/// operation is atomic per key (indeed totally ordered across keys).
///
/// Kept synchronous and separate from the async trait wrapper so the
/// interleaving-sensitive part can be model-checked under `loom`.
struct Shared {
    entries: Mutex<HashMap<CounterKey, Entry>>,
}

impl Shared {
    fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    #[cfg(not(feature = "loom"))]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CounterKey, Entry>> {
        // A panic while holding the lock leaves only counter values behind;
        // recover the map rather than poisoning every later request.
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[cfg(feature = "loom")]
    fn lock(&self) -> loom::sync::MutexGuard<'_, HashMap<CounterKey, Entry>> {
        self.entries.lock().unwrap()
    }

    fn increment(&self, key: &CounterKey, now: u64, ttl_millis: u64) -> u64 {
        let mut map = self.lock();
        match map.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.value = entry.value.saturating_add(1);
                entry.value
            }
            _ => {
                // Absent or expired: a fresh counter with a fresh expiry.
                map.insert(
                    key.clone(),
                    Entry { value: 1, expires_at: now.saturating_add(ttl_millis) },
                );
                1
            }
        }
    }

    fn read(&self, key: &CounterKey, now: u64) -> Option<u64> {
        self.lock().get(key).filter(|entry| entry.live(now)).map(|entry| entry.value)
    }

    fn put(&self, key: &CounterKey, value: u64, now: u64, ttl_millis: u64) {
        self.lock()
            .insert(key.clone(), Entry { value, expires_at: now.saturating_add(ttl_millis) });
    }

    fn remove(&self, key: &CounterKey) {
        self.lock().remove(key);
    }

    fn decrement(&self, key: &CounterKey, now: u64) {
        if let Some(entry) = self.lock().get_mut(key) {
            if entry.live(now) {
                entry.value = entry.value.saturating_sub(1);
            }
        }
    }

    fn purge(&self, now: u64) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, entry| entry.live(now));
        before - map.len()
    }
}

/// [`CounterStore`] backed by a mutex-guarded in-process map.
///
/// Expired entries are ignored lazily on access; call
/// [`purge_expired`](InMemoryCounterStore::purge_expired) periodically if the
/// key population is large and churns.
#[derive(Clone)]
pub struct InMemoryCounterStore {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    /// A store running on the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A store running on the given clock; used with
    /// [`ManualClock`](crate::clock::ManualClock) in tests.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { shared: Arc::new(Shared::new()), clock }
    }

    /// Drop expired entries and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge(self.clock.now_millis())
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    /// Check if the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCounterStore").finish_non_exhaustive()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_get(&self, key: &CounterKey, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.shared.increment(key, self.clock.now_millis(), ttl_millis(ttl)))
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<u64>, StoreError> {
        Ok(self.shared.read(key, self.clock.now_millis()))
    }

    async fn set_with_ttl(
        &self,
        key: &CounterKey,
        value: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.shared.put(key, value, self.clock.now_millis(), ttl_millis(ttl));
        Ok(())
    }

    async fn delete(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.shared.remove(key);
        Ok(())
    }

    async fn decrement_saturating(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.shared.decrement(key, self.clock.now_millis());
        Ok(())
    }
}
