//! In-memory TTL cache with fresh and stale reads.
//!
//! Expired entries are kept so they can still be served as a degraded
//! fallback through [`TtlCache::get_any`]. Memory is bounded two ways:
//! `purge` drops entries that expired longer ago than the stale horizon, and
//! inserts beyond `max_entries` evict the entry with the earliest expiry.

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    max_entries: usize,
    clock: SharedClock,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    /// Returns the value only while `now <= expires_at`.
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| now <= entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    /// Returns the value regardless of expiry.
    pub fn get_any(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).map(|entry| entry.value.clone())
    }

    /// Overwrites unconditionally. A non-positive `ttl` expires immediately.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now();
        let expires_at = if ttl <= Duration::zero() {
            now
        } else {
            now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                debug!("ttl cache full ({} entries), evicted earliest expiry", self.max_entries);
            }
        }
        entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Drops entries that expired more than `stale_horizon` ago. Returns how many were removed.
    pub fn purge(&self, stale_horizon: Duration) -> usize {
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(stale_horizon).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
