//! STRATA - Concurrent Engine Wrapper
//! Thread-safe wrapper around the Strata engine using Arc + RwLock.
//!
//! ## Concurrency Model
//! - **Read operations** (`get`, scans, `len`) acquire a **read lock** (shared)
//! - **Write operations** (`put`, `delete`, `flush`, `compact`) acquire a **write lock** (exclusive)
//! - Multiple concurrent readers allowed, writers block all
//!
//! A poisoned lock is recovered rather than propagated; the engine's
//! on-disk state is always consistent at operation boundaries.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::error::Result;
use crate::types::{Key, Value};

use super::metrics::EngineMetrics;
use super::sstable::TableRef;
use super::Strata;

/// Thread-safe wrapper around the Strata storage engine.
///
/// ## Example
/// ```no_run
/// use strata::engine::concurrent::ConcurrentStrata;
/// use strata::config::Config;
/// use std::thread;
///
/// let engine = ConcurrentStrata::open(Config::default()).unwrap();
///
/// // Clone for multiple threads
/// let engine_clone = engine.clone();
///
/// // Thread 1: Write
/// thread::spawn(move || {
///     engine_clone.put(b"key".to_vec(), b"value".to_vec()).unwrap();
/// });
///
/// // Thread 2: Read
/// let result = engine.get(b"key").unwrap();
/// ```
#[derive(Clone)]
pub struct ConcurrentStrata {
    inner: Arc<RwLock<Strata>>,
}

impl ConcurrentStrata {
    /// Open or create a concurrent Strata storage engine.
    pub fn open(config: Config) -> Result<Self> {
        let engine = Strata::open(config)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(engine)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Strata> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Strata> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a key-value pair (write lock).
    pub fn put(&self, key: Key, value: Value) -> Result<()> {
        self.write().put(key, value)
    }

    /// Get a value by key (read lock).
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.read().get(key)
    }

    /// Delete a key (write lock).
    pub fn delete(&self, key: Key) -> Result<()> {
        self.write().delete(key)
    }

    /// Scan all key-value pairs (read lock).
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.read().scan()
    }

    /// Paginated range scan over `start <= key < end` (read lock).
    pub fn range_scan(
        &self,
        start: &[u8],
        end: &[u8],
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(Key, Value)>> {
        self.read().range_scan(start, end, page, page_size)
    }

    /// Paginated prefix scan (read lock).
    pub fn prefix_scan(&self, prefix: &[u8], page: usize, page_size: usize) -> Result<Vec<(Key, Value)>> {
        self.read().prefix_scan(prefix, page, page_size)
    }

    /// Flush every memtable (write lock).
    pub fn flush(&self) -> Result<()> {
        self.write().flush()
    }

    /// Run compaction until quiet (write lock).
    pub fn compact(&self) -> Result<usize> {
        self.write().compact()
    }

    /// Tables per level (read lock).
    pub fn levels(&self) -> Vec<Vec<TableRef>> {
        self.read().levels()
    }

    /// Get number of live keys (read lock).
    pub fn len(&self) -> Result<usize> {
        self.read().len()
    }

    /// Check if engine is empty (read lock).
    pub fn is_empty(&self) -> Result<bool> {
        self.read().is_empty()
    }

    /// Get MemTable size in bytes (read lock).
    pub fn memtable_size(&self) -> usize {
        self.read().memtable_size()
    }

    /// Run `f` against the engine metrics inside the read lock.
    pub fn with_metrics<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&EngineMetrics) -> R,
    {
        let engine = self.read();
        f(engine.metrics())
    }
}
