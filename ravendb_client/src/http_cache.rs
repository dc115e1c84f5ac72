//! Response cache keyed by request fingerprint.
//!
//! Items are stamped with the generation that was current when they were stored. Bumping the
//! generation invalidates every stored item at once without touching the map; callers decide
//! whether an item is usable by comparing generations.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Change vector stored for fingerprints whose last response was a 404.
pub const NOT_FOUND_CHANGE_VECTOR: &str = "404 response";

/// Fixed per-item overhead added to the payload length when weighing the cache.
const ITEM_OVERHEAD: usize = 20;

/// A read snapshot of one cache entry.
#[derive(Debug, Clone)]
pub struct HttpCacheItem {
    pub change_vector: Option<String>,
    pub payload: Option<Arc<str>>,
    pub last_server_update: Instant,
    pub generation: u64,
}

impl HttpCacheItem {
    fn weight(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or_default() + ITEM_OVERHEAD
    }

    pub fn is_not_found(&self) -> bool {
        self.change_vector.as_deref() == Some(NOT_FOUND_CHANGE_VECTOR)
    }

    pub fn age(&self) -> Duration {
        self.last_server_update.elapsed()
    }
}

/// What the request executor needs from the cache before sending a request.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub item: HttpCacheItem,
    /// The item predates the last generation bump and must be revalidated with the server.
    pub might_have_been_modified: bool,
}

#[derive(Debug, Default)]
struct Entries {
    items: HashMap<String, HttpCacheItem>,
    total_weight: usize,
}

#[derive(Debug)]
pub struct HttpCache {
    entries: Mutex<Entries>,
    max_size: usize,
    generation: AtomicU64,
}

impl HttpCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_size,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every stored item.
    pub fn bump_generation(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(generation, "Bumped http cache generation");
        generation
    }

    /// Whether `item` was stored under the current generation.
    pub fn is_current(&self, item: &HttpCacheItem) -> bool {
        item.generation == self.generation()
    }

    pub fn get(&self, fingerprint: &str) -> Option<HttpCacheItem> {
        self.entries.lock().items.get(fingerprint).cloned()
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<CachedResponse> {
        let item = self.get(fingerprint)?;
        Some(CachedResponse {
            might_have_been_modified: !self.is_current(&item),
            item,
        })
    }

    /// Stores `payload` for `fingerprint` under the current generation.
    pub fn set(&self, fingerprint: &str, change_vector: Option<String>, payload: Option<&str>) {
        let item = HttpCacheItem {
            change_vector,
            payload: payload.map(Arc::from),
            last_server_update: Instant::now(),
            generation: self.generation(),
        };
        self.insert(fingerprint, item);
    }

    pub fn set_not_found(&self, fingerprint: &str) {
        self.set(fingerprint, Some(NOT_FOUND_CHANGE_VECTOR.to_string()), None);
    }

    /// The server answered 304 for `fingerprint`: the item is fresh again.
    pub fn not_modified(&self, fingerprint: &str) {
        let generation = self.generation();
        if let Some(item) = self.entries.lock().items.get_mut(fingerprint) {
            item.last_server_update = Instant::now();
            item.generation = generation;
        }
    }

    pub fn number_of_items(&self) -> usize {
        self.entries.lock().items.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.items.clear();
        entries.total_weight = 0;
    }

    fn insert(&self, fingerprint: &str, item: HttpCacheItem) {
        let weight = item.weight();
        if weight > self.max_size {
            tracing::trace!(fingerprint, weight, "Response too large to cache");
            self.entries.lock().remove(fingerprint);
            return;
        }

        let current_generation = self.generation();
        let mut entries = self.entries.lock();
        entries.remove(fingerprint);
        entries.total_weight += weight;
        entries.items.insert(fingerprint.to_string(), item);

        if entries.total_weight > self.max_size {
            entries.evict(self.max_size, current_generation, fingerprint);
        }
    }
}

impl Entries {
    fn remove(&mut self, fingerprint: &str) {
        if let Some(previous) = self.items.remove(fingerprint) {
            self.total_weight -= previous.weight();
        }
    }

    // Stale generations go first, then the least recently refreshed items.
    fn evict(&mut self, max_size: usize, current_generation: u64, keep: &str) {
        let mut candidates = self
            .items
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, item)| {
                (
                    item.generation == current_generation,
                    item.last_server_update,
                    key.clone(),
                )
            })
            .collect::<Vec<_>>();
        candidates.sort();

        let mut evicted = 0;
        for (_, _, key) in candidates {
            if self.total_weight <= max_size {
                break;
            }
            self.remove(&key);
            evicted += 1;
        }
        tracing::debug!(evicted, "Evicted items from http cache");
    }
}
