//! Keyed in-memory registry with time-to-live eviction.
//!
//! Holds the per-call streaming sessions and the rate limiter's windows.
//! Every access is a short map operation that never spans an `.await`, so a
//! synchronous mutex is used. Entries expire `ttl` after their last write;
//! expired entries are invisible to readers and removed by [`TtlRegistry::sweep`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Cloneable handle; clones share the same map.
pub struct TtlRegistry<K, V> {
    entries: Arc<Mutex<HashMap<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K, V> Clone for TtlRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            ttl: self.ttl,
        }
    }
}

impl<K, V> TtlRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("registry lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces `key`, restarting its TTL.
    pub fn put(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(key, Entry { value, expires_at });
    }

    /// Removes `key`, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let entry = self.lock().remove(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.value)
    }

    /// Atomically replaces the value for `key` with `f(current)` and restarts
    /// its TTL. `current` is `None` when the key is absent or expired.
    pub fn update<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce(Option<V>) -> V,
    {
        let mut entries = self.lock();
        let now = Instant::now();
        let current = entries
            .remove(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value);
        let value = f(current);
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        value
    }

    /// Restarts the TTL of a live entry. Returns whether one existed.
    pub fn touch(&self, key: &K) -> bool {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    /// Drops expired entries and returns their values.
    pub fn sweep(&self) -> Vec<V> {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| entry.value))
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
