//! Metadata caches.
//!
//! Three fixed-capacity LRU maps sit in front of the catalog manager:
//! inode → entry, inode → path and MD5(path) → entry (which also stores
//! negative results). The remount protocol pauses and drops them during
//! drain-out so no reader can observe a mix of old and new revisions.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use lru::LruCache;

use cvmfs_types::{DirectoryEntry, Md5Digest, RepoPath};

/// Cache capacities are rounded down to a multiple of 64 (and at least 64).
fn rounded_capacity(entries: usize) -> NonZeroUsize {
    let rounded = entries & !63;
    NonZeroUsize::new(rounded.max(64)).unwrap()
}

/// A pausable fixed-capacity LRU map.
pub struct MetaCache<K: Eq + Hash, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
    paused: AtomicBool,
}

impl<K: Eq + Hash, V: Clone> MetaCache<K, V> {
    pub fn new(entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(rounded_capacity(entries))),
            paused: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock().unwrap().put(key, value);
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn forget(&self, key: &K) {
        self.inner.lock().unwrap().pop(key);
    }

    /// Reject new inserts (lookups keep working).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn drop_all(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rough per-entry footprints used to split the memcache budget.
const MD5_ENTRY_SIZE: usize = 300;
const INODE_ENTRY_SIZE: usize = 300;
const PATH_ENTRY_SIZE: usize = 150;

/// The three metadata caches, sized from one memory budget. The MD5
/// cache gets seven shares: path lookups dominate and it also carries the
/// negative entries.
pub struct MetaCaches {
    pub inode_cache: MetaCache<u64, DirectoryEntry>,
    pub path_cache: MetaCache<u64, RepoPath>,
    pub md5_cache: MetaCache<Md5Digest, DirectoryEntry>,
}

impl MetaCaches {
    pub fn new(memcache_bytes: u64) -> Self {
        let unit = 7 * MD5_ENTRY_SIZE + INODE_ENTRY_SIZE + PATH_ENTRY_SIZE;
        let units = (memcache_bytes as usize / unit).max(64);
        Self {
            inode_cache: MetaCache::new(units),
            path_cache: MetaCache::new(units),
            md5_cache: MetaCache::new(units * 7),
        }
    }

    pub fn pause(&self) {
        self.inode_cache.pause();
        self.path_cache.pause();
        self.md5_cache.pause();
    }

    pub fn resume(&self) {
        self.inode_cache.resume();
        self.path_cache.resume();
        self.md5_cache.resume();
    }

    pub fn drop_all(&self) {
        self.inode_cache.drop_all();
        self.path_cache.drop_all();
        self.md5_cache.drop_all();
    }

    /// Invalidate what is keyed by `inode`, called when the kernel's last
    /// reference to it is forgotten.
    pub fn forget_inode(&self, inode: u64) {
        self.inode_cache.forget(&inode);
        self.path_cache.forget(&inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(rounded_capacity(100).get(), 64);
        assert_eq!(rounded_capacity(128).get(), 128);
        assert_eq!(rounded_capacity(10).get(), 64);
    }

    #[test]
    fn test_insert_lookup_evict() {
        let cache: MetaCache<u64, String> = MetaCache::new(64);
        for n in 0..70 {
            cache.insert(n, format!("value{n}"));
        }
        // Oldest entries evicted at capacity 64.
        assert!(cache.lookup(&0).is_none());
        assert_eq!(cache.lookup(&69).unwrap(), "value69");
        assert_eq!(cache.len(), 64);
    }

    #[test]
    fn test_paused_cache_rejects_inserts() {
        let cache: MetaCache<u64, u64> = MetaCache::new(64);
        cache.pause();
        cache.insert(1, 1);
        assert!(cache.lookup(&1).is_none());
        cache.resume();
        cache.insert(1, 1);
        assert_eq!(cache.lookup(&1), Some(1));
    }

    #[test]
    fn test_drop_all_clears() {
        let cache: MetaCache<u64, u64> = MetaCache::new(64);
        cache.insert(1, 1);
        cache.drop_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forget_inode_invalidates_both_inode_keyed_caches() {
        let caches = MetaCaches::new(1 << 20);
        let entry = DirectoryEntry::negative();
        caches.inode_cache.insert(300, entry);
        caches
            .path_cache
            .insert(300, RepoPath::new("/a").unwrap());
        caches.forget_inode(300);
        assert!(caches.inode_cache.lookup(&300).is_none());
        assert!(caches.path_cache.lookup(&300).is_none());
    }
}
