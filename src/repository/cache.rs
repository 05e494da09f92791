//! Key/value cache with per-entry expiry

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::lock;

/// Cached value with the instants it was stored and goes stale.
/// Entries are replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`. A stale entry is dropped on the way.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: Value, ttl: Duration) {
        let stored_at = Instant::now();
        let entry = CacheEntry {
            value,
            stored_at,
            expires_at: stored_at + ttl,
        };
        lock(&self.entries).insert(key.to_string(), entry);
    }

    /// Remove the entry for `key`; returns whether one existed
    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
