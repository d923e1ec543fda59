//! The resolver's process-wide answer cache: per `(name, type)`, either a
//! positive set of records with a shared expiry or a negative (NXDOMAIN)
//! marker. Reads are lock-free-ish (a short read-lock); writes replace a
//! single entry atomically under a write-lock, matching the "read-mostly,
//! atomic replacement" requirement.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::dns::wire::ResourceRecord;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    name: String,
    qtype: u16,
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Positive { records: Vec<ResourceRecord>, expires_at: Instant },
    Negative { expires_at: Instant },
}

impl CacheEntry {
    fn expires_at(&self) -> Instant {
        match self {
            CacheEntry::Positive { expires_at, .. } => *expires_at,
            CacheEntry::Negative { expires_at } => *expires_at,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Positive(Vec<ResourceRecord>),
    Negative,
    Miss,
}

/// Negative answers are cached for a fixed floor even when the upstream
/// didn't supply an SOA-derived negative TTL, so a flaky NXDOMAIN doesn't
/// get re-queried on every message.
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

pub struct Cache {
    capacity: usize,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Cache {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, name: &str, qtype: u16) -> CacheLookup {
        let key = CacheKey { name: name.to_ascii_lowercase(), qtype };
        let entries = self.entries.read().expect("dns cache lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.expires_at() > Instant::now() => match entry {
                CacheEntry::Positive { records, .. } => CacheLookup::Positive(records.clone()),
                CacheEntry::Negative { .. } => CacheLookup::Negative,
            },
            _ => CacheLookup::Miss,
        }
    }

    pub fn store_positive(&self, name: &str, qtype: u16, records: Vec<ResourceRecord>, ttl: Duration) {
        let key = CacheKey { name: name.to_ascii_lowercase(), qtype };
        let expires_at = Instant::now() + ttl;
        self.insert(key, CacheEntry::Positive { records, expires_at });
    }

    pub fn store_negative(&self, name: &str, qtype: u16) {
        let key = CacheKey { name: name.to_ascii_lowercase(), qtype };
        let expires_at = Instant::now() + NEGATIVE_TTL;
        self.insert(key, CacheEntry::Negative { expires_at });
    }

    fn insert(&self, key: CacheKey, entry: CacheEntry) {
        let mut entries = self.entries.write().expect("dns cache lock poisoned");
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, v| v.expires_at() > Instant::now());
            if entries.len() >= self.capacity {
                if let Some(stale_key) = entries.keys().next().cloned() {
                    entries.remove(&stale_key);
                }
            }
        }
        entries.insert(key, entry);
    }
}

/// Derives a cache TTL from a set of records: the minimum TTL among them, or
/// a 0-second TTL (effectively uncached) if the set is empty.
pub fn min_ttl(records: &[ResourceRecord]) -> Duration {
    records.iter().map(|r| r.ttl).min().map(|secs| Duration::from_secs(secs as u64)).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
