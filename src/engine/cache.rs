//! STRATA - LRU Caches
//! A capacity-bounded least-recently-used map, used both for disk blocks
//! (through [`CachedBlockStore`]) and for recently read entries.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;

use super::block::{BlockStore, SharedBlockStore};

/// Least-recently-used map with a fixed capacity.
///
/// Recency is a monotonically increasing tick; `order` maps ticks back to
/// keys so the oldest entry is always the first one in the BTreeMap.
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn touch(&mut self, key: &K) {
        self.tick += 1;
        if let Some((_, stamp)) = self.entries.get_mut(key) {
            self.order.remove(stamp);
            *stamp = self.tick;
            self.order.insert(self.tick, key.clone());
        }
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|(v, _)| v)
    }

    /// Insert or replace `key`, evicting the least recently used entry if full.
    pub fn put(&mut self, key: K, value: V) {
        if let Some((slot, _)) = self.entries.get_mut(&key) {
            *slot = value;
            self.touch(&key);
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(key, (value, self.tick));
    }

    /// Drop `key` if cached.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    /// Keep only the entries whose key satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let order = &mut self.order;
        self.entries.retain(|key, (_, stamp)| {
            let kept = keep(key);
            if !kept {
                order.remove(stamp);
            }
            kept
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Write-through block cache in front of another [`BlockStore`].
///
/// Keyed by `(path, block)`. A hit never touches the inner store, so a file
/// mutated behind the cache's back can be served stale; every engine path
/// writes through this wrapper. The cache lock is separate from the store's.
pub struct CachedBlockStore {
    inner: SharedBlockStore,
    cache: Mutex<LruCache<(PathBuf, u64), Vec<u8>>>,
}

impl CachedBlockStore {
    pub fn new(inner: SharedBlockStore, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn remember(&self, path: &Path, block: u64, data: Vec<u8>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put((path.to_path_buf(), block), data);
    }

    fn forget_under(&self, prefix: &Path) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(path, _)| !path.starts_with(prefix));
    }

    fn padded(&self, data: &[u8]) -> Vec<u8> {
        let mut block = data.to_vec();
        block.resize(self.inner.block_size(), 0);
        block
    }

    /// Number of cached blocks.
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl BlockStore for CachedBlockStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_block(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(data) = cache.get(&(path.to_path_buf(), block)) {
                return Ok(Some(data.clone()));
            }
        }
        let data = self.inner.read_block(path, block)?;
        if let Some(data) = &data {
            self.remember(path, block, data.clone());
        }
        Ok(data)
    }

    /// Goes to the inner store and replaces the cached copy with what it
    /// found there.
    fn read_block_direct(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
        let data = self.inner.read_block_direct(path, block)?;
        match &data {
            Some(data) => self.remember(path, block, data.clone()),
            None => {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.remove(&(path.to_path_buf(), block));
            }
        }
        Ok(data)
    }

    fn write_block(&self, path: &Path, block: u64, data: &[u8]) -> Result<()> {
        self.inner.write_block(path, block, data)?;
        self.remember(path, block, self.padded(data));
        Ok(())
    }

    fn append_block(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let block = self.inner.append_block(path, data)?;
        self.remember(path, block, self.padded(data));
        Ok(block)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let start = self.inner.append(path, data)?;
        let block_size = self.inner.block_size();
        for (i, chunk) in data.chunks(block_size).enumerate() {
            self.remember(path, start + i as u64, self.padded(chunk));
        }
        Ok(start)
    }

    fn block_count(&self, path: &Path) -> Result<u64> {
        self.inner.block_count(path)
    }

    fn sync(&self, path: &Path) -> Result<()> {
        self.inner.sync(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.forget_under(path);
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, dir: &Path) -> Result<()> {
        self.forget_under(dir);
        self.inner.remove_dir(dir)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.forget_under(from);
        self.forget_under(to);
        self.inner.rename(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::MemoryBlockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1)); // a is now most recent
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_replace_and_remove() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 10);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.remove(&"a"), Some(10));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_retain() {
        let mut cache = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i * 10);
        }
        cache.retain(|k| k % 2 == 0);
        assert_eq!(cache.len(), 2);
        cache.put(10, 100);
        cache.put(11, 110);
        // the two survivors plus two new keys fit exactly
        assert_eq!(cache.get(&0), Some(&0));
        assert_eq!(cache.get(&2), Some(&20));
    }

    /// Counts reads reaching the inner store.
    struct CountingStore {
        inner: MemoryBlockStore,
        reads: AtomicUsize,
    }

    impl BlockStore for CountingStore {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }
        fn read_block(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read_block(path, block)
        }
        fn write_block(&self, path: &Path, block: u64, data: &[u8]) -> Result<()> {
            self.inner.write_block(path, block, data)
        }
        fn append_block(&self, path: &Path, data: &[u8]) -> Result<u64> {
            self.inner.append_block(path, data)
        }
        fn append(&self, path: &Path, data: &[u8]) -> Result<u64> {
            self.inner.append(path, data)
        }
        fn block_count(&self, path: &Path) -> Result<u64> {
            self.inner.block_count(path)
        }
        fn sync(&self, path: &Path) -> Result<()> {
            self.inner.sync(path)
        }
        fn remove_file(&self, path: &Path) -> Result<()> {
            self.inner.remove_file(path)
        }
        fn remove_dir(&self, dir: &Path) -> Result<()> {
            self.inner.remove_dir(dir)
        }
        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.rename(from, to)
        }
    }

    #[test]
    fn test_cache_hit_bypasses_store() {
        let counting = Arc::new(CountingStore {
            inner: MemoryBlockStore::new(64),
            reads: AtomicUsize::new(0),
        });
        let cached = CachedBlockStore::new(counting.clone(), 8);
        let path = Path::new("/c/file.db");

        // write-through populates the cache
        cached.append(path, &[3u8; 100]).unwrap();
        let block = cached.read_block(path, 1).unwrap().unwrap();
        assert_eq!(&block[..36], &[3u8; 36]);
        assert_eq!(counting.reads.load(Ordering::Relaxed), 0);

        // after removal the next read must reach the store
        cached.remove_file(path).unwrap();
        assert_eq!(cached.cached_blocks(), 0);
        assert!(cached.read_block(path, 0).is_err());
        assert_eq!(counting.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cache_miss_then_hit() {
        let counting = Arc::new(CountingStore {
            inner: MemoryBlockStore::new(64),
            reads: AtomicUsize::new(0),
        });
        let path = Path::new("/c/other.db");
        counting.inner.append_block(path, b"cold").unwrap();

        let cached = CachedBlockStore::new(counting.clone(), 8);
        cached.read_block(path, 0).unwrap();
        cached.read_block(path, 0).unwrap();
        assert_eq!(counting.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_direct_read_sees_changes_behind_the_cache() {
        let counting = Arc::new(CountingStore {
            inner: MemoryBlockStore::new(64),
            reads: AtomicUsize::new(0),
        });
        let cached = CachedBlockStore::new(counting.clone(), 8);
        let path = Path::new("/c/direct.db");
        cached.append_block(path, b"original").unwrap();

        // mutate the inner store without going through the cache
        counting.inner.write_block(path, 0, b"changed").unwrap();
        assert_eq!(&cached.read_block(path, 0).unwrap().unwrap()[..8], b"original");
        assert_eq!(counting.reads.load(Ordering::Relaxed), 0);

        let direct = cached.read_block_direct(path, 0).unwrap().unwrap();
        assert_eq!(&direct[..7], b"changed");
        assert_eq!(counting.reads.load(Ordering::Relaxed), 1);
        // the cached copy now matches the store
        assert_eq!(&cached.read_block(path, 0).unwrap().unwrap()[..7], b"changed");
        assert!(cached.read_block_direct(path, 5).unwrap().is_none());
    }
}
