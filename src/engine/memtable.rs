//! STRATA - MemTable (In-Memory Sorted Map)
//! The MemTable is the write-buffer of the LSM-Tree.
//! All writes go here first before being flushed to SSTables on disk.
//!
//! Several memtable generations are kept in a [`MemTableRing`]; only the
//! newest receives writes.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use crate::config::MemtableStructure;
use crate::types::{is_internal_key, Entry, Key, Value};

use super::skiplist::SkipList;

/// What the memtable stores per key.
#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    timestamp: i64,
    tombstone: bool,
}

enum Backing {
    SkipList(SkipList<Slot>),
    BTree(BTreeMap<Key, Slot>),
}

/// In-memory sorted key-value store bounded by an entry count.
///
/// A delete is an update with the tombstone flag set, never a removal, so
/// later readers can tell "deleted" from "never written".
pub struct MemTable {
    backing: Backing,
    /// Maximum number of distinct keys.
    capacity: usize,
    /// Current approximate size in bytes.
    size_bytes: usize,
    /// First WAL segment holding this memtable's writes.
    wal_start: u32,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new(capacity: usize, structure: MemtableStructure, max_height: usize) -> Self {
        let backing = match structure {
            MemtableStructure::SkipList => Backing::SkipList(SkipList::new(max_height)),
            MemtableStructure::BTree => Backing::BTree(BTreeMap::new()),
        };
        Self {
            backing,
            capacity,
            size_bytes: 0,
            wal_start: 1,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Returns the number of keys in the MemTable, tombstones included.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::SkipList(list) => list.len(),
            Backing::BTree(map) => map.len(),
        }
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the MemTable holds `capacity` keys.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn wal_start(&self) -> u32 {
        self.wal_start
    }

    /// Insert or overwrite `key`.
    pub fn update(&mut self, key: Key, value: Value, timestamp: i64, tombstone: bool) {
        let value = if tombstone { Vec::new() } else { value };
        let added = key.len() + value.len();
        let key_len = key.len();
        let slot = Slot {
            value,
            timestamp,
            tombstone,
        };
        let previous = match &mut self.backing {
            Backing::SkipList(list) => list.insert(key, slot),
            Backing::BTree(map) => map.insert(key, slot),
        };
        if let Some(old) = previous {
            self.size_bytes = self.size_bytes.saturating_sub(key_len + old.value.len());
        }
        self.size_bytes += added;
    }

    /// Delete a key by inserting a tombstone marker.
    pub fn delete(&mut self, key: Key, timestamp: i64) {
        self.update(key, Vec::new(), timestamp, true);
    }

    /// Get a value by key.
    /// Returns `None` if the key does not exist or has been deleted (tombstone).
    pub fn search(&self, key: &[u8]) -> Option<&Value> {
        match self.slot(key) {
            Some(slot) if !slot.tombstone => Some(&slot.value),
            _ => None,
        }
    }

    /// Raw lookup that also reports tombstones.
    pub fn lookup(&self, key: &[u8]) -> Option<Entry> {
        self.slot(key).map(|slot| to_entry(key, slot))
    }

    fn slot(&self, key: &[u8]) -> Option<&Slot> {
        match &self.backing {
            Backing::SkipList(list) => list.get(key),
            Backing::BTree(map) => map.get(key),
        }
    }

    /// Every entry in key order, tombstones and internal keys included.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Entry> + '_> {
        match &self.backing {
            Backing::SkipList(list) => Box::new(list.iter().map(|(k, s)| to_entry(k, s))),
            Backing::BTree(map) => Box::new(map.iter().map(|(k, s)| to_entry(k, s))),
        }
    }

    /// Entries with `start <= key < end` (unbounded when `end` is `None`),
    /// skipping internal keys.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: Option<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = Entry> + 'a> {
        let below_end = move |key: &[u8]| end.map_or(true, |end| key < end);
        let iter: Box<dyn Iterator<Item = (&'a [u8], &'a Slot)> + 'a> = match &self.backing {
            Backing::SkipList(list) => Box::new(list.seek(start)),
            Backing::BTree(map) => Box::new(
                map.range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
                    .map(|(k, s)| (k.as_slice(), s)),
            ),
        };
        Box::new(
            iter.take_while(move |(k, _)| below_end(*k))
                .filter(|(k, _)| !is_internal_key(*k))
                .map(|(k, s)| to_entry(k, s)),
        )
    }

    /// Entries whose key starts with `prefix`, skipping internal keys.
    pub fn prefix<'a>(&'a self, prefix: &'a [u8]) -> Box<dyn Iterator<Item = Entry> + 'a> {
        Box::new(
            self.range(prefix, None)
                .take_while(move |e| e.key.starts_with(prefix)),
        )
    }
}

fn to_entry(key: &[u8], slot: &Slot) -> Entry {
    Entry {
        key: key.to_vec(),
        value: slot.value.clone(),
        timestamp: slot.timestamp,
        tombstone: slot.tombstone,
    }
}

/// Fixed-length sequence of memtable generations, oldest first.
pub struct MemTableRing {
    tables: VecDeque<MemTable>,
    count: usize,
    capacity: usize,
    structure: MemtableStructure,
    max_height: usize,
}

impl MemTableRing {
    /// Create a ring holding at most `count` memtables of `capacity` keys.
    pub fn new(
        count: usize,
        capacity: usize,
        structure: MemtableStructure,
        max_height: usize,
        wal_start: u32,
    ) -> Self {
        let mut ring = Self {
            tables: VecDeque::with_capacity(count),
            count: count.max(1),
            capacity,
            structure,
            max_height,
        };
        let first = ring.fresh(wal_start);
        ring.tables.push_back(first);
        ring
    }

    fn fresh(&self, wal_start: u32) -> MemTable {
        let mut table = MemTable::new(self.capacity, self.structure, self.max_height);
        table.wal_start = wal_start;
        table
    }

    /// The memtable receiving writes.
    pub fn active(&self) -> &MemTable {
        &self.tables[self.tables.len() - 1]
    }

    pub fn active_mut(&mut self) -> &mut MemTable {
        let last = self.tables.len() - 1;
        &mut self.tables[last]
    }

    /// Allocate a fresh newest memtable whose writes start in WAL segment
    /// `wal_start`. When the ring is already full the oldest generation is
    /// removed and returned for flushing.
    pub fn advance(&mut self, wal_start: u32) -> Option<MemTable> {
        let evicted = if self.tables.len() >= self.count {
            self.tables.pop_front()
        } else {
            None
        };
        let table = self.fresh(wal_start);
        self.tables.push_back(table);
        evicted
    }

    /// Remove every generation, oldest first, leaving one fresh memtable.
    pub fn drain(&mut self, wal_start: u32) -> Vec<MemTable> {
        let drained: Vec<MemTable> = self.tables.drain(..).collect();
        let table = self.fresh(wal_start);
        self.tables.push_back(table);
        drained
    }

    /// Newest entry for `key` across all generations, tombstones included.
    pub fn lookup(&self, key: &[u8]) -> Option<Entry> {
        self.tables.iter().rev().find_map(|t| t.lookup(key))
    }

    /// Generations from newest to oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &MemTable> {
        self.tables.iter().rev()
    }

    /// WAL segment where the oldest buffered write lives.
    pub fn oldest_wal_start(&self) -> u32 {
        self.tables.front().map_or(1, |t| t.wal_start)
    }

    /// Shift every WAL marker down after `removed` segments were dropped.
    pub fn rebase_wal(&mut self, removed: u32) {
        for table in self.tables.iter_mut() {
            table.wal_start = table.wal_start.saturating_sub(removed).max(1);
        }
    }

    /// Number of generations currently allocated.
    pub fn generations(&self) -> usize {
        self.tables.len()
    }

    /// Total approximate size in bytes.
    pub fn size(&self) -> usize {
        self.tables.iter().map(|t| t.size()).sum()
    }

    /// True when no generation holds any entry.
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.is_empty())
    }
}
