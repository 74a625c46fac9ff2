//! A byte-budgeted LRU cache for data tiles.
//!
//! Entries are keyed by the textual fingerprint `<uri> "+" <offset>`. The
//! cache never holds more than its byte budget: inserting evicts
//! least-recently-used entries until the new total fits, and a payload larger
//! than the whole budget is rejected silently. A miss is an ordinary outcome,
//! not an error.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::StorageError;

struct Entry {
    data: Bytes,
    stamp: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // Recency index: stamp -> key. Stamps are unique and monotonic, so the
    // first entry is always the least recently used.
    recency: BTreeMap<u64, String>,
    size: u64,
    clock: u64,
}

impl Inner {
    fn promote(&mut self, key: &str) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.stamp);
            entry.stamp = stamp;
            self.recency.insert(stamp, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.stamp);
            self.size -= entry.data.len() as u64;
        }
    }

    fn evict_lru(&mut self) {
        if let Some((&stamp, _)) = self.recency.iter().next() {
            let key = self.recency.remove(&stamp).unwrap_or_default();
            if let Some(entry) = self.entries.remove(&key) {
                self.size -= entry.data.len() as u64;
            }
        }
    }
}

/// The process-wide tile cache.
#[derive(Default)]
pub struct TileCache {
    max_size: u64,
    inner: Mutex<Inner>,
}

impl TileCache {
    /// Create a cache with a byte budget of `max_size`.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The byte budget.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The combined size of all live entries.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Read `nbytes` starting at `skip` from the entry at `key` into `out`.
    ///
    /// On a hit, `out` is replaced with the requested bytes, the entry is
    /// promoted to most recently used, and `Ok(true)` is returned. On a miss,
    /// `Ok(false)`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidArgument`] if the requested range lies
    /// outside the cached object.
    pub fn read(
        &self,
        key: &str,
        out: &mut Vec<u8>,
        skip: u64,
        nbytes: u64,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(key) else {
            return Ok(false);
        };
        let start = usize::try_from(skip)
            .map_err(|_| StorageError::InvalidArgument("cache read offset".to_string()))?;
        let len = usize::try_from(nbytes)
            .map_err(|_| StorageError::InvalidArgument("cache read length".to_string()))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= entry.data.len())
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!("cache read past object end for {key}"))
            })?;
        out.clear();
        out.extend_from_slice(&entry.data[start..end]);
        inner.promote(key);
        Ok(true)
    }

    /// Insert `data` at `key`, evicting least-recently-used entries until the
    /// total size fits the budget.
    ///
    /// A payload larger than the whole budget is rejected silently. An
    /// existing entry is replaced only if `overwrite` is set; otherwise the
    /// insert is a no-op.
    pub fn insert(&self, key: &str, data: Bytes, overwrite: bool) {
        let nbytes = data.len() as u64;
        if nbytes > self.max_size {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(key) {
            if !overwrite {
                return;
            }
            inner.remove(key);
        }
        while inner.size + nbytes > self.max_size {
            inner.evict_lru();
        }
        inner.clock += 1;
        let stamp = inner.clock;
        inner.recency.insert(stamp, key.to_string());
        inner.size += nbytes;
        inner.entries.insert(key.to_string(), Entry { data, stamp });
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(cache: &TileCache, key: &str, nbytes: u64) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        cache.read(key, &mut out, 0, nbytes).unwrap().then_some(out)
    }

    #[test]
    fn cache_hit_and_miss() {
        let cache = TileCache::new(64);
        cache.insert("u+0", Bytes::from_static(b"0123456789"), false);
        assert_eq!(read_all(&cache, "u+0", 10).unwrap(), b"0123456789");

        let mut out = Vec::new();
        assert!(cache.read("u+0", &mut out, 4, 3).unwrap());
        assert_eq!(out, b"456");
        assert!(!cache.read("absent", &mut out, 0, 1).unwrap());
        assert!(cache.read("u+0", &mut out, 8, 4).is_err());
    }

    #[test]
    fn cache_budget_never_exceeded() {
        let cache = TileCache::new(10);
        cache.insert("a", Bytes::from(vec![0; 4]), false);
        cache.insert("b", Bytes::from(vec![0; 4]), false);
        assert_eq!(cache.size(), 8);
        cache.insert("c", Bytes::from(vec![0; 4]), false);
        assert!(cache.size() <= 10);
        // "a" was least recently used.
        assert!(read_all(&cache, "a", 4).is_none());
        assert!(read_all(&cache, "b", 4).is_some());
        assert!(read_all(&cache, "c", 4).is_some());
    }

    #[test]
    fn cache_lru_promotion() {
        let cache = TileCache::new(10);
        cache.insert("a", Bytes::from(vec![0; 4]), false);
        cache.insert("b", Bytes::from(vec![0; 4]), false);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(read_all(&cache, "a", 4).is_some());
        cache.insert("c", Bytes::from(vec![0; 4]), false);
        assert!(read_all(&cache, "a", 4).is_some());
        assert!(read_all(&cache, "b", 4).is_none());
    }

    #[test]
    fn cache_rejects_oversized_silently() {
        let cache = TileCache::new(4);
        cache.insert("big", Bytes::from(vec![0; 8]), false);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn cache_overwrite_flag() {
        let cache = TileCache::new(64);
        cache.insert("k", Bytes::from_static(b"old"), false);
        cache.insert("k", Bytes::from_static(b"newer"), false);
        assert_eq!(read_all(&cache, "k", 3).unwrap(), b"old");
        cache.insert("k", Bytes::from_static(b"newer"), true);
        assert_eq!(read_all(&cache, "k", 5).unwrap(), b"newer");
    }
}
