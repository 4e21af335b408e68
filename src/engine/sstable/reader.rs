//! SSTable reader.
//!
//! Opening a table loads its TOC, Summary, Filter and (when present)
//! dictionary. A point lookup then costs at most one Index region read and
//! one Data range read, or nothing at all when the Bloom filter says no.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::block::SharedBlockStore;
use crate::engine::bloom::BloomFilter;
use crate::engine::merkle::MerkleTree;
use crate::error::{Result, StrataError};
use crate::types::{Entry, Key};

use super::dictionary::Dictionary;
use super::record::{decode_record, IndexEntry};
use super::{
    read_padded_text, read_range, read_segment, segment_blocks, Component, Summary, TableRef,
    Toc, TocEntry, TOC_FILE,
};

/// An open, immutable table.
pub struct SSTable {
    store: SharedBlockStore,
    table: TableRef,
    dir: PathBuf,
    toc: Toc,
    summary: Summary,
    filter: BloomFilter,
    dictionary: Option<Arc<Dictionary>>,
}

impl SSTable {
    /// Open the finalized table `table` under `root`.
    pub fn open(store: SharedBlockStore, root: &Path, table: TableRef) -> Result<Self> {
        let dir = table.dir(root);
        let toc_bytes = read_padded_text(store.as_ref(), &dir.join(TOC_FILE))?;
        let toc = Toc::parse(&String::from_utf8_lossy(&toc_bytes))?;

        let segment = |component: Component| -> Result<Option<Vec<u8>>> {
            match toc.entry(component) {
                Some(entry) => {
                    let path = toc.file(&dir, table.generation, component);
                    read_segment(store.as_ref(), &path, entry).map(Some)
                }
                None => Ok(None),
            }
        };
        let missing =
            |c: Component| StrataError::Corruption(format!("table {} has no {} segment", table, c.name()));

        let summary: Summary = bincode::deserialize(
            &segment(Component::Summary)?.ok_or_else(|| missing(Component::Summary))?,
        )?;
        let filter = BloomFilter::from_bytes(
            &segment(Component::Filter)?.ok_or_else(|| missing(Component::Filter))?,
        )?;
        let dictionary = match segment(Component::CompressionInfo)? {
            Some(bytes) => Some(Arc::new(Dictionary::from_bytes(&bytes)?)),
            None => None,
        };
        if toc.entry(Component::Data).is_none() || toc.entry(Component::Index).is_none() {
            return Err(missing(Component::Data));
        }

        Ok(Self {
            store,
            table,
            dir,
            toc,
            summary,
            filter,
            dictionary,
        })
    }

    pub fn table(&self) -> TableRef {
        self.table
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_count(&self) -> u64 {
        self.summary.entry_count
    }

    pub fn min_key(&self) -> &[u8] {
        &self.summary.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.summary.max_key
    }

    pub fn max_timestamp(&self) -> i64 {
        self.summary.max_timestamp
    }

    /// Persisted bytes across every segment.
    pub fn size_bytes(&self) -> u64 {
        self.toc.total_len()
    }

    /// Check if two tables have overlapping key ranges.
    pub fn overlaps(&self, other: &SSTable) -> bool {
        self.min_key() <= other.max_key() && self.max_key() >= other.min_key()
    }

    /// Bloom filter and key bounds; `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.min_key() && key <= self.max_key() && self.filter.may_contain(key)
    }

    fn segment_entry(&self, component: Component) -> Result<&TocEntry> {
        self.toc.entry(component).ok_or_else(|| {
            StrataError::Corruption(format!(
                "table {} has no {} segment",
                self.table,
                component.name()
            ))
        })
    }

    fn path(&self, component: Component) -> PathBuf {
        self.toc.file(&self.dir, self.table.generation, component)
    }

    /// Point lookup; tombstones are returned as entries.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let Some(region) = self.summary.find_region(key) else {
            return Ok(None);
        };

        let index = self.segment_entry(Component::Index)?;
        let bytes = read_range(
            self.store.as_ref(),
            &self.path(Component::Index),
            index.start_block,
            region.index_offset,
            region.index_len,
        )?;
        let Some(found) = IndexEntry::decode_all(&bytes)?
            .into_iter()
            .find(|e| e.key.as_slice() == key)
        else {
            return Ok(None);
        };

        let data = self.segment_entry(Component::Data)?;
        let record = read_range(
            self.store.as_ref(),
            &self.path(Component::Data),
            data.start_block,
            found.offset,
            found.len as u64,
        )?;
        match decode_record(&record, self.dictionary.as_deref())? {
            Some((entry, _)) if entry.key.as_slice() == key => Ok(Some(entry)),
            _ => Err(StrataError::Corruption(format!(
                "table {} index points at the wrong record for key {:?}",
                self.table,
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Every entry in key order, read sequentially from the Data segment.
    pub fn iter(&self) -> Result<TableIter> {
        let data = self.segment_entry(Component::Data)?;
        Ok(TableIter {
            store: self.store.clone(),
            path: self.path(Component::Data),
            start_block: data.start_block,
            data_len: data.len,
            next_block: 0,
            loaded: 0,
            buf: Vec::new(),
            pos: 0,
            dictionary: self.dictionary.clone(),
            done: false,
        })
    }

    /// Recompute the Merkle tree over the Data blocks and return the
    /// numbers of blocks that no longer match the stored one.
    ///
    /// Data blocks are read from storage directly, never from the block
    /// cache.
    pub fn verify(&self) -> Result<Vec<u64>> {
        let metadata = self.segment_entry(Component::Metadata)?;
        let stored = MerkleTree::from_bytes(&read_segment(
            self.store.as_ref(),
            &self.path(Component::Metadata),
            metadata,
        )?)?;

        let data = self.segment_entry(Component::Data)?;
        let path = self.path(Component::Data);
        let count = segment_blocks(data.len, self.store.block_size());
        let mut blocks = Vec::with_capacity(count as usize);
        for block in 0..count {
            match self.store.read_block_direct(&path, data.start_block + block)? {
                Some(bytes) => blocks.push(bytes),
                None => break,
            }
        }
        let mismatched = stored.diff(&blocks);
        if !mismatched.is_empty() {
            log::warn!(
                "table {} failed verification: {} block(s) differ",
                self.table,
                mismatched.len()
            );
        }
        Ok(mismatched)
    }

    /// Keys bounds as owned values.
    pub fn key_range(&self) -> (Key, Key) {
        (self.summary.min_key.clone(), self.summary.max_key.clone())
    }
}

/// Sequential Data-segment iterator. Owns everything it needs, so it can
/// outlive the borrow of its table.
pub struct TableIter {
    store: SharedBlockStore,
    path: PathBuf,
    start_block: u64,
    data_len: u64,
    next_block: u64,
    /// Data bytes pulled into `buf` so far.
    loaded: u64,
    buf: Vec<u8>,
    pos: usize,
    dictionary: Option<Arc<Dictionary>>,
    done: bool,
}

impl TableIter {
    fn load_block(&mut self) -> Result<()> {
        let block = self
            .store
            .read_block(&self.path, self.start_block + self.next_block)?
            .ok_or_else(|| {
                StrataError::Corruption(format!("{:?} ends inside its Data segment", self.path))
            })?;
        let take = (self.data_len - self.loaded).min(block.len() as u64) as usize;
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.buf.extend_from_slice(&block[..take]);
        self.loaded += take as u64;
        self.next_block += 1;
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        loop {
            if let Some((entry, used)) =
                decode_record(&self.buf[self.pos..], self.dictionary.as_deref())?
            {
                self.pos += used;
                return Ok(Some(entry));
            }
            if self.loaded >= self.data_len {
                if self.pos < self.buf.len() {
                    return Err(StrataError::Corruption(format!(
                        "{:?} ends with a partial record",
                        self.path
                    )));
                }
                return Ok(None);
            }
            self.load_block()?;
        }
    }
}

impl Iterator for TableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
