//! STRATA - Storage Engine Module
//! Top-level module for the LSM-Tree storage engine components.

pub mod block;
pub mod bloom;
pub mod cache;
pub mod compaction;
pub mod concurrent;
pub mod iter;
pub mod levels;
pub mod memtable;
pub mod merkle;
pub mod metrics;
pub mod skiplist;
pub mod sstable;
pub mod wal;

use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::types::{is_internal_key, now_micros, Entry, Key, Value};

use self::block::{FileBlockManager, SharedBlockStore};
use self::cache::{CachedBlockStore, LruCache};
use self::compaction::{compact_until_quiet, strategy_for, CompactionStrategy};
use self::iter::{EntryIter, MergeIterator, PrefixIter, RangeIter};
use self::levels::LevelSet;
use self::memtable::{MemTable, MemTableRing};
use self::metrics::EngineMetrics;
use self::sstable::{SSTableBuilder, TableOptions, TableRef};
use self::wal::WriteAheadLog;

/// Key bounds of a scan.
#[derive(Clone, Copy)]
enum Bounds<'k> {
    All,
    /// `start <= key < end`
    Range(&'k [u8], &'k [u8]),
    Prefix(&'k [u8]),
}

/// The core Strata storage engine.
/// Coordinates the memtables, the WAL, and the SSTable levels
/// to provide a durable key-value store based on LSM-Tree architecture.
pub struct Strata {
    /// Generations of in-memory sorted buffers; the newest takes writes.
    memtables: MemTableRing,
    /// Write-ahead log for crash recovery.
    wal: WriteAheadLog,
    /// On-disk tables, level by level.
    levels: LevelSet,
    /// Block store used by SSTables (cached).
    store: SharedBlockStore,
    /// Recently read or flushed entries, tombstones included.
    read_cache: Mutex<LruCache<Key, Entry>>,
    compaction: Box<dyn CompactionStrategy + Send + Sync>,
    table_options: TableOptions,
    /// Timestamps handed out are strictly increasing.
    last_timestamp: i64,
    metrics: EngineMetrics,
    /// Engine configuration.
    config: Config,
}

impl Strata {
    /// Open or create a Strata storage engine at the configured path.
    ///
    /// The configuration is validated before anything touches the disk.
    /// Opening replays any interrupted compaction and the WAL.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let raw: SharedBlockStore = Arc::new(FileBlockManager::new(config.block_size));
        let store: SharedBlockStore = Arc::new(CachedBlockStore::new(
            raw.clone(),
            config.block_cache_capacity,
        ));
        let levels = LevelSet::open(store.clone(), config.sstable_path(), config.max_level as u32)?;
        let wal = WriteAheadLog::open(
            config.wal_path(),
            raw,
            config.wal_segment_size,
            config.sync_writes,
        )?;
        let memtables = MemTableRing::new(
            config.memtable_count,
            config.memtable_capacity,
            config.memtable_structure,
            config.skiplist_max_height,
            1,
        );

        let mut engine = Self {
            memtables,
            wal,
            last_timestamp: levels.max_timestamp().unwrap_or(0),
            levels,
            store,
            read_cache: Mutex::new(LruCache::new(config.read_cache_capacity)),
            compaction: strategy_for(&config),
            table_options: TableOptions::from_config(&config),
            metrics: EngineMetrics::new(),
            config,
        };
        let recovered = engine.recover()?;

        log::info!(
            "Strata engine opened at {:?} ({} entries recovered, {} tables, {} compaction)",
            engine.config.data_dir,
            recovered,
            engine.levels.table_count(),
            engine.compaction.name()
        );
        Ok(engine)
    }

    /// Rebuild the memtables from the WAL.
    ///
    /// Memtables that fill up during replay are flushed; in that case the
    /// surviving buffered entries are re-logged into fresh segments and every
    /// replayed segment is dropped.
    fn recover(&mut self) -> Result<usize> {
        let entries = self.wal.read_records().map_err(|e| match e {
            StrataError::Corruption(msg) => StrataError::RecoveryFailed(msg),
            other => other,
        })?;
        if entries.is_empty() {
            return Ok(0);
        }

        let replayed = entries.len();
        let mut flushed = 0usize;
        for entry in entries {
            self.last_timestamp = self.last_timestamp.max(entry.timestamp);
            self.memtables.active_mut().update(
                entry.key,
                entry.value,
                entry.timestamp,
                entry.tombstone,
            );
            if self.memtables.active().is_full() {
                if let Some(full) = self.memtables.advance(1) {
                    self.write_memtable(full)?;
                    flushed += 1;
                }
            }
        }

        if flushed > 0 {
            let last_replayed = self.wal.active_segment();
            self.wal.rotate()?;
            let buffered: Vec<Entry> = self
                .memtables
                .newest_first()
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .flat_map(|table| table.iter())
                .collect();
            for entry in &buffered {
                self.wal.append(entry)?;
            }
            let removed = self.wal.remove_segments_up_to(last_replayed)?;
            self.memtables.rebase_wal(removed);
            self.maybe_compact()?;
        }

        self.metrics.record_recovery();
        log::info!(
            "WAL replay: {} records, {} memtable(s) flushed during recovery",
            replayed,
            flushed
        );
        Ok(replayed)
    }

    fn next_timestamp(&mut self) -> i64 {
        let timestamp = now_micros().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        timestamp
    }

    /// Insert a key-value pair into the storage engine.
    /// The write path: WAL (disk) -> MemTable (memory).
    /// This ensures durability: if the process crashes after
    /// WAL write but before MemTable update, the WAL recovery
    /// will replay the operation on next startup.
    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        let (key_len, value_len) = (key.len(), value.len());
        let timestamp = self.next_timestamp();
        self.write(Entry::put(key, value, timestamp))?;
        self.metrics.record_put(key_len, value_len);
        Ok(())
    }

    /// Delete a key from the storage engine.
    /// Writes a tombstone to both WAL and MemTable.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        let timestamp = self.next_timestamp();
        self.write(Entry::delete(key, timestamp))?;
        self.metrics.record_delete();
        Ok(())
    }

    fn write(&mut self, entry: Entry) -> Result<()> {
        // Step 1: Write to WAL first (durability)
        self.wal.append(&entry)?;
        self.read_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entry.key);
        // Step 2: Write to MemTable (fast reads)
        self.memtables.active_mut().update(
            entry.key,
            entry.value,
            entry.timestamp,
            entry.tombstone,
        );
        if self.memtables.active().is_full() {
            self.rotate_memtable()?;
        }
        Ok(())
    }

    /// Start a new memtable generation in a new WAL segment, flushing the
    /// oldest generation if the ring was already full.
    fn rotate_memtable(&mut self) -> Result<()> {
        self.wal.rotate()?;
        if let Some(full) = self.memtables.advance(self.wal.active_segment()) {
            self.write_memtable(full)?;
            self.truncate_wal()?;
            self.maybe_compact()?;
        }
        Ok(())
    }

    /// Persist one memtable as a new level-1 table and promote its
    /// entries into the read cache.
    fn write_memtable(&mut self, table: MemTable) -> Result<()> {
        if table.is_empty() {
            return Ok(());
        }
        let table_ref = TableRef::new(1, self.levels.next_generation(1)?);
        let mut builder = SSTableBuilder::new(
            self.store.clone(),
            self.levels.root(),
            table_ref,
            self.table_options.clone(),
            table.len(),
        )?;
        for entry in table.iter() {
            builder.add(&entry)?;
        }
        if let Some(pending) = builder.finish()? {
            let sstable = pending.commit()?;
            self.levels.insert(sstable);
        }

        let mut cache = self.read_cache.lock().unwrap_or_else(|e| e.into_inner());
        for entry in table.iter() {
            cache.put(entry.key.clone(), entry);
        }
        drop(cache);

        self.metrics.record_flush();
        log::info!(
            "Flushed memtable ({} entries, {} bytes) to {}",
            table.len(),
            table.size(),
            table_ref
        );
        Ok(())
    }

    /// Drop WAL segments older than the oldest buffered write.
    fn truncate_wal(&mut self) -> Result<()> {
        let mark = self.memtables.oldest_wal_start().saturating_sub(1);
        if mark == 0 {
            return Ok(());
        }
        let removed = self.wal.remove_segments_up_to(mark)?;
        self.memtables.rebase_wal(removed);
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<usize> {
        let merges = compact_until_quiet(
            &mut self.levels,
            self.compaction.as_ref(),
            &self.table_options,
        )?;
        if merges > 0 {
            self.metrics.record_compactions(merges);
            log::debug!("{} merge(s) completed", merges);
        }
        Ok(merges)
    }

    /// Flush every buffered memtable to level 1, then compact as needed.
    /// Flushing with nothing buffered changes nothing.
    pub fn flush(&mut self) -> Result<()> {
        if self.memtables.is_empty() {
            return Ok(());
        }
        self.wal.rotate()?;
        let tables = self.memtables.drain(self.wal.active_segment());
        for table in tables {
            self.write_memtable(table)?;
        }
        self.truncate_wal()?;
        self.maybe_compact()?;
        Ok(())
    }

    /// Run the configured compaction policy until it has nothing left to
    /// do. Returns the number of merges performed.
    pub fn compact(&mut self) -> Result<usize> {
        self.maybe_compact()
    }

    /// Newest version of `key` anywhere in the tree, tombstones included.
    fn lookup(&self, key: &[u8]) -> Result<Option<Entry>> {
        if let Some(entry) = self.memtables.lookup(key) {
            return Ok(Some(entry));
        }
        let cache_key = key.to_vec();
        {
            let mut cache = self.read_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(&cache_key) {
                self.metrics.record_cache_hit();
                return Ok(Some(entry.clone()));
            }
        }

        self.metrics.record_sstable_read();
        let found = self.levels.get(key)?;
        if let Some(entry) = &found {
            self.read_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(cache_key, entry.clone());
        }
        Ok(found)
    }

    /// Retrieve a value by key. Deleted and missing keys are `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let value = self.lookup(key)?.and_then(|entry| {
            if entry.tombstone {
                None
            } else {
                Some(entry.value)
            }
        });
        self.metrics.record_get(value.as_ref().map(Vec::len));
        Ok(value)
    }

    /// One sorted source per memtable and per table, newest first.
    fn sources<'a>(&'a self, bounds: Bounds<'a>) -> Result<Vec<EntryIter<'a>>> {
        let mut sources: Vec<EntryIter<'a>> = Vec::new();
        for table in self.memtables.newest_first() {
            let entries: Box<dyn Iterator<Item = Entry> + 'a> = match bounds {
                Bounds::All => table.iter(),
                Bounds::Range(start, end) => table.range(start, Some(end)),
                Bounds::Prefix(prefix) => table.prefix(prefix),
            };
            sources.push(Box::new(entries.map(Ok)));
        }
        for table in self.levels.newest_first() {
            let entries: EntryIter<'a> = Box::new(table.iter()?);
            sources.push(match bounds {
                Bounds::All => entries,
                Bounds::Range(start, end) => Box::new(RangeIter::new(entries, start, Some(end))),
                Bounds::Prefix(prefix) => Box::new(PrefixIter::new(entries, prefix)),
            });
        }
        Ok(sources)
    }

    /// Merge every source, drop tombstones and internal keys, then return
    /// `take` pairs after skipping `skip`.
    fn collect_live(&self, bounds: Bounds<'_>, skip: usize, take: usize) -> Result<Vec<(Key, Value)>> {
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for entry in MergeIterator::new(self.sources(bounds)?) {
            let entry = entry?;
            if entry.tombstone || is_internal_key(&entry.key) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            if out.len() >= take {
                break;
            }
            out.push((entry.key, entry.value));
        }
        Ok(out)
    }

    /// Scan all live key-value pairs in sorted order.
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.metrics.record_scan();
        self.collect_live(Bounds::All, 0, usize::MAX)
    }

    /// Live pairs with `start <= key < end`, paginated. Pages start at 1;
    /// page 0, a zero page size, or an empty range return nothing.
    pub fn range_scan(
        &self,
        start: &[u8],
        end: &[u8],
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(Key, Value)>> {
        self.metrics.record_scan();
        if page == 0 || page_size == 0 || start >= end {
            return Ok(Vec::new());
        }
        self.collect_live(
            Bounds::Range(start, end),
            (page - 1).saturating_mul(page_size),
            page_size,
        )
    }

    /// Live pairs whose key starts with `prefix`, paginated like
    /// [`Strata::range_scan`].
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(Key, Value)>> {
        self.metrics.record_scan();
        if page == 0 || page_size == 0 {
            return Ok(Vec::new());
        }
        self.collect_live(
            Bounds::Prefix(prefix),
            (page - 1).saturating_mul(page_size),
            page_size,
        )
    }

    /// Recheck a table's Data blocks against its Merkle tree; returns the
    /// numbers of damaged blocks.
    pub fn verify_table(&self, level: u32, generation: u64) -> Result<Vec<u64>> {
        let table = TableRef::new(level, generation);
        self.levels
            .find(table)
            .ok_or_else(|| {
                StrataError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no table {}", table),
                ))
            })?
            .verify()
    }

    /// Live tables per level; index 0 is level 1, oldest generation first.
    pub fn levels(&self) -> Vec<Vec<TableRef>> {
        self.levels.refs()
    }

    /// Returns the number of live keys.
    pub fn len(&self) -> Result<usize> {
        Ok(self.collect_live(Bounds::All, 0, usize::MAX)?.len())
    }

    /// Returns true if no live key exists.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.collect_live(Bounds::All, 0, 1)?.is_empty())
    }

    /// Returns the approximate size of all memtables in bytes.
    pub fn memtable_size(&self) -> usize {
        self.memtables.size()
    }

    /// Returns a reference to the engine metrics.
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionAlgorithm, MemtableStructure};

    fn config(dir: &std::path::Path) -> Config {
        Config::new(dir)
            .with_block_size(256)
            .with_memtable_capacity(4)
            .with_memtable_count(2)
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        db.delete(b"a".to_vec()).unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"never").unwrap(), None);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        db.last_timestamp = i64::MAX / 2;
        let first = db.next_timestamp();
        let second = db.next_timestamp();
        assert_eq!(first, i64::MAX / 2 + 1);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_ring_flushes_oldest_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        for i in 0..8 {
            db.put(format!("k{}", i).into_bytes(), b"v".to_vec()).unwrap();
        }
        // two full generations; the first has been flushed
        assert_eq!(db.levels()[0].len(), 1);
        for i in 0..8 {
            assert_eq!(db.get(format!("k{}", i).as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
        assert_eq!(db.metrics().flushes.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        db.flush().unwrap();
        db.flush().unwrap();
        assert!(db.levels().iter().all(Vec::is_empty));
        db.put(b"x".to_vec(), b"y".to_vec()).unwrap();
        db.flush().unwrap();
        db.flush().unwrap();
        assert_eq!(db.levels()[0].len(), 1);
    }

    #[test]
    fn test_read_cache_serves_flushed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        db.put(b"cached".to_vec(), b"yes".to_vec()).unwrap();
        db.flush().unwrap();
        assert_eq!(db.get(b"cached").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(db.metrics().cache_hits.load(std::sync::atomic::Ordering::Relaxed), 1);

        db.put(b"cached".to_vec(), b"changed".to_vec()).unwrap();
        db.flush().unwrap();
        assert_eq!(db.get(b"cached").unwrap(), Some(b"changed".to_vec()));
    }

    #[test]
    fn test_internal_keys_hidden_from_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Strata::open(config(dir.path())).unwrap();
        db.put(b"__strata_internal__bucket".to_vec(), b"3".to_vec()).unwrap();
        db.put(b"user".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(db.scan().unwrap(), vec![(b"user".to_vec(), b"1".to_vec())]);
        assert_eq!(
            db.get(b"__strata_internal__bucket").unwrap(),
            Some(b"3".to_vec())
        );
        db.flush().unwrap();
        assert_eq!(db.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("never-created");
        let bad = Config::new(&data_dir).with_block_size(1000);
        assert!(matches!(Strata::open(bad), Err(StrataError::Config(_))));
        assert!(!data_dir.exists());
    }

    #[test]
    fn test_btree_memtable_and_leveled_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path())
            .with_memtable_structure(MemtableStructure::BTree)
            .with_compaction(CompactionAlgorithm::Leveled);
        cfg.leveled_base_limit = 16;
        cfg.level_size_multiplier = 2;
        cfg.max_level = 3;
        let mut db = Strata::open(cfg).unwrap();
        for i in 0..40 {
            db.put(format!("key{:02}", i).into_bytes(), vec![b'v'; 20]).unwrap();
        }
        db.flush().unwrap();
        assert!(db.levels()[0].is_empty());
        assert_eq!(db.len().unwrap(), 40);
    }
}
