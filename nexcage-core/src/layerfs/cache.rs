//! Bounded LRU metadata cache for the layer store.
//!
//! A pure accelerator: cold lookups always fall back to the main store, so
//! correctness never depends on what's resident here. No crate in the
//! dependency stack offers an LRU this small is worth pulling in for, so
//! it's a hand-rolled `HashMap` + access-order `VecDeque`.

use std::collections::{HashMap, VecDeque};

/// Hot subset of a [`super::Layer`]'s fields, kept for fast repeated lookups.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Layer media type.
    pub media_type: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Whether the layer has passed `validate_layer`.
    pub validated: bool,
    /// Monotonic access counter at last touch, used to maintain LRU order.
    pub last_access: u64,
    /// Number of times this entry has been looked up.
    pub access_count: u64,
}

/// A strict-LRU cache keyed by layer digest.
#[derive(Debug)]
pub struct MetadataCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    clock: u64,
}

impl MetadataCache {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
        }
    }

    /// Returns the cached entry for `digest`, bumping its recency, or
    /// `None` on a cache miss (callers fall back to the main store).
    pub fn get(&mut self, digest: &str) -> Option<CacheEntry> {
        if !self.entries.contains_key(digest) {
            return None;
        }
        self.touch(digest);
        let entry = self.entries.get_mut(digest)?;
        entry.access_count += 1;
        entry.last_access = self.clock;
        Some(entry.clone())
    }

    /// Inserts or refreshes `digest`'s cached metadata, evicting the
    /// least-recently-used entry if at capacity.
    pub fn put(&mut self, digest: String, media_type: String, size: u64, validated: bool) {
        if self.capacity == 0 {
            return;
        }
        self.clock += 1;
        if !self.entries.contains_key(&digest) {
            if self.entries.len() >= self.capacity {
                self.evict_lru();
            }
            self.order.push_back(digest.clone());
        } else {
            self.touch(&digest);
        }
        self.entries.insert(
            digest,
            CacheEntry {
                media_type,
                size,
                validated,
                last_access: self.clock,
                access_count: self.entries.values().map(|e| e.access_count).max().unwrap_or(0),
            },
        );
    }

    /// Removes `digest` from the cache, if present.
    pub fn invalidate(&mut self, digest: &str) {
        self.entries.remove(digest);
        self.order.retain(|d| d != digest);
    }

    /// Number of entries currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, digest: &str) {
        if let Some(pos) = self.order.iter().position(|d| d == digest) {
            let item = self.order.remove(pos).unwrap_or_default();
            self.order.push_back(item);
        }
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = MetadataCache::new(2);
        cache.put("a".into(), "t".into(), 1, false);
        cache.put("b".into(), "t".into(), 1, false);
        cache.get("a"); // bump a's recency above b
        cache.put("c".into(), "t".into(), 1, false); // evicts b
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn miss_on_unknown_digest() {
        let mut cache = MetadataCache::new(4);
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut cache = MetadataCache::new(4);
        cache.put("a".into(), "t".into(), 1, false);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
