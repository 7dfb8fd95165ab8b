use std::num::NonZeroUsize;

use anyhow::{Result, anyhow};
use lru::LruCache;
use parking_lot::Mutex;

use crate::crypto::Hash;

/// Hashes of blocks the import path has already finished with.
///
/// Bounded, with least-recently-inserted eviction. An evicted hash may be processed again; the chain engine tolerates
/// that. Lookups do not refresh recency.
#[derive(Debug)]
pub struct DedupCache {
    seen: Mutex<LruCache<Hash, ()>>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or_else(|| anyhow!("dedup capacity must be non-zero"))?;
        Ok(Self {
            seen: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.seen.lock().contains(hash)
    }

    pub fn insert(&self, hash: Hash) {
        self.seen.lock().put(hash, ());
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::DedupCache;
    use crate::crypto::Hash;

    fn hash(n: u64) -> Hash {
        Hash::compute([n.to_be_bytes()])
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(DedupCache::new(0).is_err());
    }

    #[test]
    fn evicts_oldest() {
        let cache = DedupCache::new(2).unwrap();
        assert!(cache.is_empty());
        cache.insert(hash(1));
        cache.insert(hash(2));
        // Lookups must not refresh 1, so it is still the oldest.
        assert!(cache.contains(&hash(1)));
        cache.insert(hash(3));

        assert!(!cache.contains(&hash(1)));
        assert!(cache.contains(&hash(2)));
        assert!(cache.contains(&hash(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_refreshes() {
        let cache = DedupCache::new(2).unwrap();
        cache.insert(hash(1));
        cache.insert(hash(2));
        cache.insert(hash(1));
        cache.insert(hash(3));

        assert!(cache.contains(&hash(1)));
        assert!(!cache.contains(&hash(2)));
    }
}
