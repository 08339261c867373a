//! Counter store for nudge counters
//!
//! Models the shared key-value cache that holds `nudge_count:{user}:{stuck}`
//! entries. Any backend works as long as increments on one key are serialized;
//! the in-process implementation uses a single mutex-guarded map and lets
//! entries expire after a quiet period, like a cache TTL would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::CounterKey;

/// Counter entries untouched for this long read as zero.
pub const DEFAULT_COUNTER_TTL_SECS: i64 = 86_400;

/// Map size at which `increment` first sweeps out expired entries
const PURGE_FLOOR: usize = 1_024;

/// Error type for counter store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Counter backend error: {0}")]
    Backend(String),
}

/// Result type for counter store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a counter store
pub type SharedCounterStore = Arc<dyn CounterStore>;

/// Atomic per-key counter storage
pub trait CounterStore: Send + Sync {
    /// Increment the counter and return the new value.
    fn increment(&self, key: &CounterKey, now: DateTime<Utc>) -> StoreResult<u32>;

    /// Current value (zero when absent or expired).
    fn get(&self, key: &CounterKey, now: DateTime<Utc>) -> StoreResult<u32>;

    /// Drop the counter. Returns the value it held.
    fn reset(&self, key: &CounterKey) -> StoreResult<u32>;

    /// Remove expired entries. Backends with native expiry keep the default.
    fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CounterEntry {
    count: u32,
    updated_at: DateTime<Utc>,
}

struct CounterMap {
    entries: HashMap<CounterKey, CounterEntry>,
    /// Size that triggers the next sweep inside `increment`
    next_purge: usize,
}

/// In-process counter store with entry TTL
pub struct InMemoryCounterStore {
    inner: Mutex<CounterMap>,
    ttl: Duration,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_COUNTER_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CounterMap {
                entries: HashMap::new(),
                next_purge: PURGE_FLOOR,
            }),
            ttl,
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedCounterStore {
        Arc::new(self)
    }

    fn is_live(&self, entry: &CounterEntry, now: DateTime<Utc>) -> bool {
        now - entry.updated_at <= self.ttl
    }

    fn sweep(&self, map: &mut CounterMap, now: DateTime<Utc>) -> usize {
        let before = map.entries.len();
        map.entries.retain(|_, e| now - e.updated_at <= self.ttl);
        map.next_purge = (map.entries.len() * 2).max(PURGE_FLOOR);
        before - map.entries.len()
    }

    /// Keys held, expired ones included until they are purged.
    pub fn tracked_keys(&self) -> StoreResult<usize> {
        let map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.entries.len())
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(&self, key: &CounterKey, now: DateTime<Utc>) -> StoreResult<u32> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        if map.entries.len() >= map.next_purge {
            self.sweep(&mut map, now);
        }
        let live = map.entries.get(key).filter(|e| self.is_live(e, now)).copied();
        let count = live.map(|e| e.count).unwrap_or(0).saturating_add(1);
        map.entries.insert(
            key.clone(),
            CounterEntry {
                count,
                updated_at: now,
            },
        );
        Ok(count)
    }

    fn get(&self, key: &CounterKey, now: DateTime<Utc>) -> StoreResult<u32> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        match map.entries.get(key).copied() {
            Some(entry) if self.is_live(&entry, now) => Ok(entry.count),
            Some(_) => {
                map.entries.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    fn reset(&self, key: &CounterKey) -> StoreResult<u32> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.entries.remove(key).map(|e| e.count).unwrap_or(0))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(self.sweep(&mut map, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_increment_is_sequential() {
        let store = InMemoryCounterStore::new();
        let key = CounterKey::new("u1", "invite_team");
        let now = Utc::now();
        let values: Vec<u32> = (0..5).map(|_| store.increment(&key, now).unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.get(&key, now).unwrap(), 5);
    }

    #[test]
    fn test_reset_clears_counter() {
        let store = InMemoryCounterStore::new();
        let key = CounterKey::new("u1", "invite_team");
        let now = Utc::now();
        store.increment(&key, now).unwrap();
        store.increment(&key, now).unwrap();
        assert_eq!(store.reset(&key).unwrap(), 2);
        assert_eq!(store.get(&key, now).unwrap(), 0);
        assert_eq!(store.increment(&key, now).unwrap(), 1);
    }

    #[test]
    fn test_expired_counter_restarts() {
        let store = InMemoryCounterStore::with_ttl(Duration::seconds(60));
        let key = CounterKey::new("u1", "invite_team");
        let t0 = Utc::now();
        store.increment(&key, t0).unwrap();
        store.increment(&key, t0).unwrap();
        let later = t0 + Duration::seconds(61);
        assert_eq!(store.get(&key, later).unwrap(), 0);
        assert_eq!(store.increment(&key, later).unwrap(), 1);
    }

    #[test]
    fn test_expired_entries_are_purged() {
        let store = InMemoryCounterStore::with_ttl(Duration::seconds(60));
        let t0 = Utc::now();
        for i in 0..10 {
            store
                .increment(&CounterKey::new(format!("user-{i}"), "invite_team"), t0)
                .unwrap();
        }
        let later = t0 + Duration::seconds(61);
        let fresh = CounterKey::new("user-0", "create_project");
        store.increment(&fresh, later).unwrap();

        // reading an expired key drops it
        assert_eq!(store.get(&CounterKey::new("user-1", "invite_team"), later).unwrap(), 0);
        assert_eq!(store.tracked_keys().unwrap(), 10);

        assert_eq!(store.purge_expired(later).unwrap(), 9);
        assert_eq!(store.tracked_keys().unwrap(), 1);
        assert_eq!(store.get(&fresh, later).unwrap(), 1);
    }

    #[test]
    fn test_increment_sweeps_expired_entries_when_large() {
        let store = InMemoryCounterStore::with_ttl(Duration::seconds(60));
        let t0 = Utc::now();
        for i in 0..PURGE_FLOOR {
            store
                .increment(&CounterKey::new(format!("user-{i}"), "invite_team"), t0)
                .unwrap();
        }
        let later = t0 + Duration::seconds(61);
        store
            .increment(&CounterKey::new("late", "invite_team"), later)
            .unwrap();
        assert_eq!(store.tracked_keys().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_increments_on_distinct_keys() {
        let store = Arc::new(InMemoryCounterStore::new());
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let key = CounterKey::new(format!("user-{i}"), "invite_team");
                    (0..100)
                        .map(|_| store.increment(&key, now).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            let seen = handle.join().unwrap();
            assert_eq!(seen, (1..=100).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_concurrent_increments_on_one_key_lose_nothing() {
        let store = Arc::new(InMemoryCounterStore::new());
        let key = CounterKey::new("u1", "invite_team");
        let now = Utc::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        store.increment(&key, now).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get(&key, now).unwrap(), 200);
    }
}
