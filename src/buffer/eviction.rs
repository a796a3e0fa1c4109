//! Eviction bookkeeping for the page cache.
//!
//! Tracks the last-touch order of cached pages with monotonic stamps.
//! The cache asks for candidates coldest-first when it needs a free frame;
//! pinned frames are skipped by the caller.

use crate::buffer::CacheKey;
use std::collections::HashMap;

/// Last-touch ordering over cached pages
#[derive(Debug, Default)]
pub struct EvictionQueue {
    stamps: HashMap<CacheKey, u64>,
    clock: u64,
}

impl EvictionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access, making the page the warmest
    pub fn touch(&mut self, key: CacheKey) {
        self.clock += 1;
        self.stamps.insert(key, self.clock);
    }

    /// Forget a page
    pub fn remove(&mut self, key: CacheKey) {
        self.stamps.remove(&key);
    }

    /// All tracked pages, coldest first
    pub fn coldest_first(&self) -> Vec<CacheKey> {
        let mut entries: Vec<(CacheKey, u64)> =
            self.stamps.iter().map(|(k, s)| (*k, *s)).collect();
        entries.sort_by_key(|(_, stamp)| *stamp);
        entries.into_iter().map(|(k, _)| k).collect()
    }

    /// Number of tracked pages
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, PageId};

    fn key(p: u32) -> CacheKey {
        (FileId(1), PageId::new(p))
    }

    #[test]
    fn test_coldest_ordering() {
        let mut q = EvictionQueue::new();
        q.touch(key(1));
        q.touch(key(2));
        q.touch(key(3));
        assert_eq!(q.coldest_first(), vec![key(1), key(2), key(3)]);

        // Re-touching warms a page up.
        q.touch(key(1));
        assert_eq!(q.coldest_first(), vec![key(2), key(3), key(1)]);
    }

    #[test]
    fn test_remove() {
        let mut q = EvictionQueue::new();
        q.touch(key(1));
        q.touch(key(2));
        q.remove(key(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.coldest_first(), vec![key(2)]);
    }
}
