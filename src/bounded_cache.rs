//! Bounded caches with TTL and max-size eviction.
//!
//! `BoundedHashCache` drops duplicate watcher deliveries of the same request
//! or message id. `BoundedPendingCache` tracks this relay's own in-flight
//! claim submissions so a slow transaction is polled instead of resent.
//!
//! A dedup entry is a 32-byte key plus timestamp and sequence, so the
//! default 50k entries stay under 4 MB.

use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};

const DEFAULT_DEDUP_CACHE_SIZE: usize = 50_000;
const DEFAULT_IN_FLIGHT_CACHE_SIZE: usize = 10_000;
const DEFAULT_DEDUP_TTL_SECS: u64 = 3_600;

pub struct CacheConfig {
    pub dedup_size: usize,
    pub in_flight_size: usize,
    pub ttl_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            dedup_size: env_or("DEDUP_CACHE_SIZE", DEFAULT_DEDUP_CACHE_SIZE),
            in_flight_size: env_or("IN_FLIGHT_CACHE_SIZE", DEFAULT_IN_FLIGHT_CACHE_SIZE),
            ttl_secs: env_or("DEDUP_CACHE_TTL_SECS", DEFAULT_DEDUP_TTL_SECS),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dedup_size: DEFAULT_DEDUP_CACHE_SIZE,
            in_flight_size: DEFAULT_IN_FLIGHT_CACHE_SIZE,
            ttl_secs: DEFAULT_DEDUP_TTL_SECS,
        }
    }
}

/// Map of 32-byte ids to values, bounded by entry age and count.
///
/// Expired entries are swept on insert; when still full, the oldest goes.
pub struct BoundedPendingCache<T> {
    entries: HashMap<[u8; 32], Entry<T>>,
    capacity: usize,
    ttl: Duration,
    next_seq: u64,
}

struct Entry<T> {
    value: T,
    at: Instant,
    /// Insertion order; `Instant`s can tie
    seq: u64,
}

impl<T> BoundedPendingCache<T> {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl: Duration::from_secs(ttl_secs),
            next_seq: 0,
        }
    }

    fn live(&self, at: Instant) -> bool {
        at.elapsed() < self.ttl
    }

    pub fn get(&self, id: &[u8; 32]) -> Option<&T> {
        match self.entries.get(id) {
            Some(entry) if self.live(entry.at) => Some(&entry.value),
            _ => None,
        }
    }

    pub fn contains_key(&self, id: &[u8; 32]) -> bool {
        self.get(id).is_some()
    }

    fn make_room(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.at.elapsed() < ttl);
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn insert(&mut self, id: [u8; 32], value: T) {
        if !self.entries.contains_key(&id) {
            self.make_room();
        }
        self.next_seq += 1;
        let entry = Entry {
            value,
            at: Instant::now(),
            seq: self.next_seq,
        };
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: &[u8; 32]) -> Option<T> {
        self.entries.remove(id).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Seen-set of 32-byte ids used for watcher dedup
pub struct BoundedHashCache(BoundedPendingCache<()>);

impl BoundedHashCache {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self(BoundedPendingCache::new(capacity, ttl_secs))
    }

    pub fn contains_key(&self, id: &[u8; 32]) -> bool {
        self.0.contains_key(id)
    }

    pub fn insert(&mut self, id: [u8; 32]) {
        self.0.insert(id, ());
    }

    /// Record an id; false if it was already seen within the TTL
    pub fn check_and_insert(&mut self, id: [u8; 32]) -> bool {
        if self.contains_key(&id) {
            return false;
        }
        self.insert(id);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_cache_dedups() {
        let mut cache = BoundedHashCache::new(10, 3600);
        assert!(cache.check_and_insert([1u8; 32]));
        assert!(!cache.check_and_insert([1u8; 32]));
        assert!(cache.check_and_insert([2u8; 32]));
    }

    #[test]
    fn test_hash_cache_evicts_oldest() {
        let mut cache = BoundedHashCache::new(3, 3600);
        cache.insert([1u8; 32]);
        cache.insert([2u8; 32]);
        cache.insert([3u8; 32]);
        cache.insert([4u8; 32]);
        assert!(!cache.contains_key(&[1u8; 32]));
        assert!(cache.contains_key(&[4u8; 32]));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let mut cache = BoundedHashCache::new(10, 0);
        cache.insert([1u8; 32]);
        assert!(!cache.contains_key(&[1u8; 32]));
    }

    #[test]
    fn test_pending_cache_insert_get_remove() {
        let mut cache = BoundedPendingCache::new(2, 3600);
        cache.insert([1u8; 32], "a");
        cache.insert([2u8; 32], "b");
        cache.insert([3u8; 32], "c");
        assert!(cache.get(&[1u8; 32]).is_none());
        assert_eq!(cache.get(&[3u8; 32]), Some(&"c"));
        assert_eq!(cache.remove(&[3u8; 32]), Some("c"));
        assert_eq!(cache.len(), 1);
    }
}
