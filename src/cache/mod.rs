use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Anything storable in the artifact cache declares its retained size so the
/// byte budget can be enforced.
pub trait CacheArtifact: Send + Sync {
    fn byte_size(&self) -> usize;
}

/// Fingerprint of a cached computation, produced by the query layer from the
/// normalised query string and parameters.
pub type Fingerprint = u64;

pub fn fingerprint_of(parts: &[&str]) -> Fingerprint {
    // FNV-1a, enough for cache keying.
    let mut hash: u64 = 0xcbf29ce484222325;
    for part in parts {
        for byte in part.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash ^= 0x1f;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub entry_count: usize,
    pub byte_size: usize,
    pub byte_budget: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// LRU over `Arc`-shared artifacts with a byte budget: inserting past the
/// budget evicts from the cold end until the new entry fits.
pub struct ArtifactCache<V: CacheArtifact> {
    entries: Mutex<LruCache<Fingerprint, Arc<V>>>,
    byte_budget: usize,
    byte_size: Mutex<usize>,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl<V: CacheArtifact> ArtifactCache<V> {
    pub fn new(byte_budget: usize) -> Self {
        ArtifactCache {
            entries: Mutex::new(LruCache::unbounded()),
            byte_budget,
            byte_size: Mutex::new(0),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<V>> {
        let mut entries = self.entries.lock();
        match entries.get(&fingerprint) {
            Some(value) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(value))
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, fingerprint: Fingerprint, value: Arc<V>) {
        let added = value.byte_size();
        if added > self.byte_budget {
            // Oversized artifacts are never cached.
            return;
        }
        let mut entries = self.entries.lock();
        let mut bytes = self.byte_size.lock();
        if let Some(old) = entries.pop(&fingerprint) {
            *bytes -= old.byte_size();
        }
        while *bytes + added > self.byte_budget {
            match entries.pop_lru() {
                Some((_, evicted)) => *bytes -= evicted.byte_size(),
                None => break,
            }
        }
        *bytes += added;
        entries.put(fingerprint, value);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        *self.byte_size.lock() = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            entry_count: self.entries.lock().len(),
            byte_size: *self.byte_size.lock(),
            byte_budget: self.byte_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blob(Vec<u8>);

    impl CacheArtifact for Blob {
        fn byte_size(&self) -> usize {
            self.0.len()
        }
    }

    #[test]
    fn hit_and_miss_counting() {
        let cache: ArtifactCache<Blob> = ArtifactCache::new(1024);
        let key = fingerprint_of(&["coffee", "10"]);
        assert!(cache.get(key).is_none());
        cache.put(key, Arc::new(Blob(vec![0; 100])));
        assert!(cache.get(key).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.byte_size, 100);
    }

    #[test]
    fn byte_budget_evicts_lru() {
        let cache: ArtifactCache<Blob> = ArtifactCache::new(250);
        let a = fingerprint_of(&["a"]);
        let b = fingerprint_of(&["b"]);
        let c = fingerprint_of(&["c"]);
        cache.put(a, Arc::new(Blob(vec![0; 100])));
        cache.put(b, Arc::new(Blob(vec![0; 100])));
        // Touch `a` so `b` is the cold entry.
        cache.get(a);
        cache.put(c, Arc::new(Blob(vec![0; 100])));

        assert!(cache.get(a).is_some());
        assert!(cache.get(b).is_none());
        assert!(cache.get(c).is_some());
        assert!(cache.stats().byte_size <= 250);
    }

    #[test]
    fn oversized_artifact_is_not_cached() {
        let cache: ArtifactCache<Blob> = ArtifactCache::new(50);
        let key = fingerprint_of(&["big"]);
        cache.put(key, Arc::new(Blob(vec![0; 100])));
        assert!(cache.get(key).is_none());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn replacing_entry_adjusts_bytes() {
        let cache: ArtifactCache<Blob> = ArtifactCache::new(300);
        let key = fingerprint_of(&["k"]);
        cache.put(key, Arc::new(Blob(vec![0; 200])));
        cache.put(key, Arc::new(Blob(vec![0; 50])));
        assert_eq!(cache.stats().byte_size, 50);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn distinct_fingerprints() {
        assert_ne!(fingerprint_of(&["a", "b"]), fingerprint_of(&["ab"]));
        assert_eq!(fingerprint_of(&["a", "b"]), fingerprint_of(&["a", "b"]));
    }
}
