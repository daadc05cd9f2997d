//! Query result cache with item, byte and age limits.

use crate::memory::size::sample_indices;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Size assumed for results that cannot be measured
pub const FALLBACK_RESULT_BYTES: usize = 10 * 1024;

const RESULT_SAMPLES: usize = 10;

/// Approximate in-memory size of a query result.
///
/// Strings count two bytes per byte, arrays extrapolate from a sample of their
/// elements, and everything else is measured by its JSON encoding.
pub fn estimate_result_bytes(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len() * 2,
        Value::Array(items) if items.is_empty() => 0,
        Value::Array(items) => {
            let indices: Vec<usize> = sample_indices(items.len(), RESULT_SAMPLES).collect();
            let sampled: usize = indices.iter().map(|&i| estimate_result_bytes(&items[i])).sum();
            sampled / indices.len() * items.len()
        }
        other => serde_json::to_string(other)
            .map(|json| json.len() * 2)
            .unwrap_or(FALLBACK_RESULT_BYTES),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted: Instant,
    last_access: Instant,
    bytes: usize,
}

/// Outcome of [`QueryCache::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    Stored { evicted: usize },
    /// The value alone exceeds the byte ceiling
    TooLarge,
}

/// Cache keyed by `method:serialized-args`.
///
/// Entries expire by age since insertion and are evicted least-recently-used first
/// when the item or byte ceiling is exceeded.
#[derive(Debug)]
pub struct QueryCache {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    max_items: usize,
    max_bytes: usize,
}

impl QueryCache {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            total_bytes: 0,
            max_items,
            max_bytes,
        }
    }

    /// Cache key for a method call; `None` when the arguments cannot be serialized.
    pub fn key_for<A: serde::Serialize + ?Sized>(method: &str, args: &A) -> Option<String> {
        serde_json::to_string(args)
            .ok()
            .map(|json| format!("{method}:{json}"))
    }

    /// Look up a value. With a `ttl`, entries older than it are removed and reported
    /// as a miss.
    pub fn get(&mut self, key: &str, ttl: Option<Duration>) -> Option<Value> {
        let expired = match (self.entries.get(key), ttl) {
            (None, _) => return None,
            (Some(entry), Some(ttl)) => entry.inserted.elapsed() > ttl,
            (Some(_), None) => false,
        };
        if expired {
            self.remove(key);
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: Value, bytes: usize) -> CacheInsert {
        if bytes > self.max_bytes {
            return CacheInsert::TooLarge;
        }

        self.remove(&key);
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: now,
                last_access: now,
                bytes,
            },
        );
        self.total_bytes += bytes;

        let mut evicted = 0;
        if self.entries.len() > self.max_items && self.evict_oldest() {
            evicted += 1;
        }
        while self.total_bytes > self.max_bytes && self.evict_oldest() {
            evicted += 1;
        }
        CacheInsert::Stored { evicted }
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => self.remove(&key),
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    /// Remove entries older than `ttl`, returning how many were removed.
    pub fn purge_expired(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        self.total_bytes = self.entries.values().map(|e| e.bytes).sum();
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        self.total_bytes = 0;
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}
