//! Per-traversal request cache.
//!
//! Memoizes resolved `(type, id)` lookups so a resource referenced from
//! several places in the graph is fetched at most once. The cache lives for
//! one top-level traversal and is discarded with it; sharing a cache across
//! unrelated traversals is an error.
//!
//! Reads and writes never suspend: the map sits behind a plain mutex held
//! only for the lookup itself.

use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;

use fhirgraph_core::BundleEntry;

/// One memoized lookup. `bundle_entry` is `None` for negative entries:
/// not-found ids and scope-denied types that should not be refetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resource_type: String,
    pub resource_id: String,
    pub status: u16,
    pub bundle_entry: Option<BundleEntry>,
    pub last_modified: Option<OffsetDateTime>,
    pub etag: Option<String>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: usize,
    misses: usize,
}

/// Thread-safe `(type, id) -> CacheEntry` memo with hit/miss counters.
#[derive(Debug, Default)]
pub struct RequestCache {
    inner: Mutex<CacheInner>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(resource_type: &str, resource_id: &str) -> String {
        format!("{resource_type}/{resource_id}")
    }

    /// Look up a cached entry, counting a hit or a miss.
    pub fn get(&self, resource_type: &str, resource_id: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.get(&Self::key(resource_type, resource_id)) {
            Some(entry) => {
                let entry = entry.clone();
                inner.hits += 1;
                Some(entry)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert an entry. The first write wins: a second `add` for the same
    /// key is a no-op and returns `false`.
    pub fn add(&self, entry: CacheEntry) -> bool {
        let key = Self::key(&entry.resource_type, &entry.resource_id);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.entries.contains_key(&key) {
            return false;
        }
        inner.entries.insert(key, entry);
        true
    }

    /// Memoize a lookup that produced no resource (not-found, scope-denied).
    pub fn add_negative(&self, resource_type: &str, resource_id: &str, status: u16) -> bool {
        self.add(CacheEntry {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            status,
            bundle_entry: None,
            last_modified: None,
            etag: None,
        })
    }

    /// Empty the cache and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn hits(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").hits
    }

    pub fn misses(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").misses
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every positive bundle entry in the cache, for final assembly.
    /// Insertion order is not guaranteed; the assembler orders output itself.
    pub fn bundle_entries(&self) -> Vec<BundleEntry> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .values()
            .filter_map(|e| e.bundle_entry.clone())
            .collect()
    }
}
