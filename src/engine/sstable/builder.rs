//! SSTable builder.
//!
//! Consumes entries in strictly ascending key order. Data blocks are written
//! as soon as they fill; the Index, Summary, Filter, Metadata and dictionary
//! segments are written by [`SSTableBuilder::finish`], followed by the TOC.

use std::path::PathBuf;

use bytes::BytesMut;

use crate::engine::block::SharedBlockStore;
use crate::engine::bloom::BloomFilter;
use crate::engine::merkle::{hash_block, Hash, MerkleTree};
use crate::error::{Result, StrataError};
use crate::types::{Entry, Key};

use super::dictionary::Dictionary;
use super::record::{encode_record, IndexEntry};
use super::{
    component_file_name, Component, SSTable, Summary, SummaryRegion, TableOptions, TableRef, Toc,
    TocEntry, TOC_FILE,
};

/// Streams entries into a new table under its temporary directory.
pub struct SSTableBuilder {
    store: SharedBlockStore,
    root: PathBuf,
    table: TableRef,
    tmp_dir: PathBuf,
    options: TableOptions,
    block_size: usize,
    /// Data bytes not yet written as a full block.
    pending: Vec<u8>,
    data_len: u64,
    data_blocks: u64,
    leaves: Vec<Hash>,
    index: BytesMut,
    regions: Vec<SummaryRegion>,
    open_region: Option<(SummaryRegion, usize)>,
    filter: BloomFilter,
    dictionary: Option<Dictionary>,
    entry_count: u64,
    min_key: Option<Key>,
    last_key: Option<Key>,
    max_timestamp: i64,
}

/// Index entries store record lengths as `u32`.
fn indexed_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        StrataError::Corruption(format!(
            "record of {} bytes exceeds the {} byte index limit",
            len,
            u32::MAX
        ))
    })
}

impl SSTableBuilder {
    /// Start a table that will hold roughly `expected_entries` entries.
    ///
    /// Any stale temporary directory for the same table is discarded.
    pub fn new(
        store: SharedBlockStore,
        root: impl Into<PathBuf>,
        table: TableRef,
        options: TableOptions,
        expected_entries: usize,
    ) -> Result<Self> {
        let root = root.into();
        let tmp_dir = table.tmp_dir(&root);
        store.remove_dir(&tmp_dir)?;
        let block_size = store.block_size();
        let dictionary = options.compression.then(Dictionary::default);
        let filter = BloomFilter::new(expected_entries, options.bloom_false_positive_rate);
        Ok(Self {
            store,
            root,
            table,
            tmp_dir,
            options,
            block_size,
            pending: Vec::with_capacity(block_size * 2),
            data_len: 0,
            data_blocks: 0,
            leaves: Vec::new(),
            index: BytesMut::new(),
            regions: Vec::new(),
            open_region: None,
            filter,
            dictionary,
            entry_count: 0,
            min_key: None,
            last_key: None,
            max_timestamp: i64::MIN,
        })
    }

    pub fn table(&self) -> TableRef {
        self.table
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn file(&self, component: Component) -> PathBuf {
        if self.options.single_file {
            self.tmp_dir.join(component_file_name(self.table.generation, None))
        } else {
            self.tmp_dir
                .join(component_file_name(self.table.generation, Some(component)))
        }
    }

    /// Append one entry. Keys must arrive strictly ascending.
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if entry.key <= *last {
                return Err(StrataError::Corruption(format!(
                    "table {} received keys out of order",
                    self.table
                )));
            }
        }

        let record = encode_record(entry, self.dictionary.as_mut());
        let index_entry = IndexEntry {
            key: entry.key.clone(),
            offset: self.data_len,
            len: indexed_len(record.len())?,
        };
        let index_offset = self.index.len() as u64;
        index_entry.encode_into(&mut self.index);
        let index_len = self.index.len() as u64 - index_offset;

        match self.open_region.as_mut() {
            Some((region, count)) => {
                region.last_key = entry.key.clone();
                region.index_len += index_len;
                *count += 1;
            }
            None => {
                let region = SummaryRegion {
                    first_key: entry.key.clone(),
                    last_key: entry.key.clone(),
                    index_offset,
                    index_len,
                };
                self.open_region = Some((region, 1));
            }
        }
        if matches!(self.open_region, Some((_, count)) if count >= self.options.summary_sparsity) {
            if let Some((region, _)) = self.open_region.take() {
                self.regions.push(region);
            }
        }

        self.filter.insert(&entry.key);
        self.data_len += record.len() as u64;
        self.pending.extend_from_slice(&record);
        while self.pending.len() >= self.block_size {
            let block: Vec<u8> = self.pending.drain(..self.block_size).collect();
            self.write_data_block(&block)?;
        }

        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.last_key = Some(entry.key.clone());
        self.max_timestamp = self.max_timestamp.max(entry.timestamp);
        self.entry_count += 1;
        Ok(())
    }

    fn write_data_block(&mut self, block: &[u8]) -> Result<()> {
        let mut padded = block.to_vec();
        padded.resize(self.block_size, 0);
        self.leaves.push(hash_block(&padded));
        self.store.append_block(&self.file(Component::Data), &padded)?;
        self.data_blocks += 1;
        Ok(())
    }

    fn write_segment(&self, component: Component, bytes: &[u8]) -> Result<TocEntry> {
        let start_block = self.store.append(&self.file(component), bytes)?;
        Ok(TocEntry {
            component,
            start_block,
            len: bytes.len() as u64,
        })
    }

    /// Write the remaining segments and the TOC.
    ///
    /// Returns `None` (and removes the temporary directory) when no entry was
    /// added. The table stays invisible until [`PendingTable::commit`].
    pub fn finish(mut self) -> Result<Option<PendingTable>> {
        if self.entry_count == 0 {
            self.store.remove_dir(&self.tmp_dir)?;
            return Ok(None);
        }
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.write_data_block(&tail)?;
        }
        if let Some((region, _)) = self.open_region.take() {
            self.regions.push(region);
        }

        let mut entries = vec![TocEntry {
            component: Component::Data,
            start_block: 0,
            len: self.data_len,
        }];
        entries.push(self.write_segment(Component::Index, &self.index)?);

        let summary = Summary {
            entry_count: self.entry_count,
            min_key: self.min_key.take().unwrap_or_default(),
            max_key: self.last_key.take().unwrap_or_default(),
            max_timestamp: self.max_timestamp,
            regions: std::mem::take(&mut self.regions),
        };
        entries.push(self.write_segment(Component::Summary, &bincode::serialize(&summary)?)?);
        entries.push(self.write_segment(Component::Filter, &self.filter.to_bytes()?)?);
        let merkle = MerkleTree::from_leaves(std::mem::take(&mut self.leaves));
        entries.push(self.write_segment(Component::Metadata, &merkle.to_bytes()?)?);
        if let Some(dict) = &self.dictionary {
            entries.push(self.write_segment(Component::CompressionInfo, &dict.to_bytes()?)?);
        }

        let toc = Toc {
            single_file: self.options.single_file,
            entries,
        };
        let mut files: Vec<PathBuf> = toc
            .entries
            .iter()
            .map(|e| self.file(e.component))
            .collect();
        files.dedup();
        for file in &files {
            self.store.sync(file)?;
        }
        let toc_path = self.tmp_dir.join(TOC_FILE);
        self.store.append(&toc_path, toc.render().as_bytes())?;
        self.store.sync(&toc_path)?;

        log::debug!(
            "table {} built: {} entries, {} data blocks",
            self.table,
            self.entry_count,
            self.data_blocks
        );
        Ok(Some(PendingTable {
            store: self.store,
            root: self.root,
            table: self.table,
        }))
    }
}

/// A fully written table still sitting in its temporary directory.
pub struct PendingTable {
    store: SharedBlockStore,
    root: PathBuf,
    table: TableRef,
}

impl PendingTable {
    pub fn table(&self) -> TableRef {
        self.table
    }

    /// Rename the temporary directory into place and open the table.
    pub fn commit(self) -> Result<SSTable> {
        let final_dir = self.table.dir(&self.root);
        self.store.rename(&self.table.tmp_dir(&self.root), &final_dir)?;
        SSTable::open(self.store, &self.root, self.table)
    }

    /// Throw the table away.
    pub fn abandon(self) -> Result<()> {
        self.store.remove_dir(&self.table.tmp_dir(&self.root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::FileBlockManager;
    use std::sync::Arc;

    #[test]
    fn test_empty_build_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedBlockStore = Arc::new(FileBlockManager::new(256));
        let table = TableRef::new(1, 1);
        let builder =
            SSTableBuilder::new(store, dir.path(), table, TableOptions::default(), 0).unwrap();
        assert!(builder.finish().unwrap().is_none());
        assert!(!table.tmp_dir(dir.path()).exists());
        assert!(!table.dir(dir.path()).exists());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_record_length_is_rejected() {
        assert_eq!(indexed_len(1234).unwrap(), 1234);
        assert_eq!(indexed_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            indexed_len(u32::MAX as usize + 1),
            Err(StrataError::Corruption(_))
        ));
    }

    #[test]
    fn test_rejects_unsorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedBlockStore = Arc::new(FileBlockManager::new(256));
        let mut builder = SSTableBuilder::new(
            store,
            dir.path(),
            TableRef::new(1, 1),
            TableOptions::default(),
            2,
        )
        .unwrap();
        builder.add(&Entry::put(b"b".to_vec(), b"1".to_vec(), 1)).unwrap();
        assert!(builder.add(&Entry::put(b"a".to_vec(), b"2".to_vec(), 2)).is_err());
        assert!(builder.add(&Entry::put(b"b".to_vec(), b"3".to_vec(), 3)).is_err());
    }

    #[test]
    fn test_table_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedBlockStore = Arc::new(FileBlockManager::new(256));
        let table = TableRef::new(1, 3);
        let mut builder =
            SSTableBuilder::new(store, dir.path(), table, TableOptions::default(), 1).unwrap();
        builder.add(&Entry::put(b"k".to_vec(), b"v".to_vec(), 1)).unwrap();
        let pending = builder.finish().unwrap().unwrap();
        assert!(table.tmp_dir(dir.path()).join(TOC_FILE).exists());
        assert!(!table.dir(dir.path()).exists());

        let sstable = pending.commit().unwrap();
        assert!(table.dir(dir.path()).join(TOC_FILE).exists());
        assert!(!table.tmp_dir(dir.path()).exists());
        assert_eq!(sstable.entry_count(), 1);
    }
}
