//! STRATA - SSTable (Sorted String Table)
//! Immutable on-disk file format for persisted key-value data.
//!
//! ## Layout
//! ```text
//! <sstable_dir>/<level>/<generation>/
//!     usertable-NNNNNN-Data.db             packed DataRecords
//!     usertable-NNNNNN-Index.db            key → (offset, length), one per entry
//!     usertable-NNNNNN-Summary.db          first/last key per index region
//!     usertable-NNNNNN-Filter.db           Bloom filter
//!     usertable-NNNNNN-Metadata.db         Merkle tree over Data blocks
//!     usertable-NNNNNN-CompressionInfo.db  dictionary (compressed tables only)
//!     TOC.txt                              segment table, written last
//! ```
//! In single-file mode every segment lives, block aligned, inside
//! `usertable-NNNNNN-SSTable.db` and `TOC.txt` records the start blocks.
//!
//! A table is built under `<level>/<generation>.tmp/` and renamed into place
//! once complete.

pub mod builder;
pub mod dictionary;
pub mod reader;
pub mod record;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::types::Key;

use super::block::{blocks_for, BlockStore};

pub use builder::{PendingTable, SSTableBuilder};
pub use reader::{SSTable, TableIter};

/// Name of the table-of-contents file inside a table directory.
pub const TOC_FILE: &str = "TOC.txt";
/// Suffix of a table directory that is still being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// Identifies an immutable table: `{level, generation}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub level: u32,
    pub generation: u64,
}

impl TableRef {
    pub fn new(level: u32, generation: u64) -> Self {
        Self { level, generation }
    }

    /// Finalized directory of this table under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        level_dir(root, self.level).join(self.generation.to_string())
    }

    /// Directory used while the table is being built.
    pub fn tmp_dir(&self, root: &Path) -> PathBuf {
        level_dir(root, self.level).join(format!("{}{}", self.generation, TMP_SUFFIX))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}/G{}", self.level, self.generation)
    }
}

/// Directory of one level under `root`.
pub fn level_dir(root: &Path, level: u32) -> PathBuf {
    root.join(level.to_string())
}

/// Segments making up a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Data,
    Index,
    Summary,
    Filter,
    Metadata,
    CompressionInfo,
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Data => "Data",
            Component::Index => "Index",
            Component::Summary => "Summary",
            Component::Filter => "Filter",
            Component::Metadata => "Metadata",
            Component::CompressionInfo => "CompressionInfo",
        }
    }
}

impl FromStr for Component {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Data" => Ok(Component::Data),
            "Index" => Ok(Component::Index),
            "Summary" => Ok(Component::Summary),
            "Filter" => Ok(Component::Filter),
            "Metadata" => Ok(Component::Metadata),
            "CompressionInfo" => Ok(Component::CompressionInfo),
            other => Err(StrataError::Corruption(format!(
                "unknown table component '{}'",
                other
            ))),
        }
    }
}

/// File name of `component` for `generation`; `None` selects the
/// single-file container.
pub fn component_file_name(generation: u64, component: Option<Component>) -> String {
    match component {
        Some(c) => format!("usertable-{:06}-{}.db", generation, c.name()),
        None => format!("usertable-{:06}-SSTable.db", generation),
    }
}

/// Where one segment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub component: Component,
    /// First block of the segment in its file.
    pub start_block: u64,
    /// Segment length in bytes.
    pub len: u64,
}

/// Table of contents.
///
/// ```text
/// layout single
/// Data 0 8190
/// Index 2 311
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toc {
    pub single_file: bool,
    pub entries: Vec<TocEntry>,
}

impl Toc {
    pub fn entry(&self, component: Component) -> Option<&TocEntry> {
        self.entries.iter().find(|e| e.component == component)
    }

    /// Path of the file holding `component` inside `dir`.
    pub fn file(&self, dir: &Path, generation: u64, component: Component) -> PathBuf {
        if self.single_file {
            dir.join(component_file_name(generation, None))
        } else {
            dir.join(component_file_name(generation, Some(component)))
        }
    }

    pub fn render(&self) -> String {
        let layout = if self.single_file { "single" } else { "discrete" };
        let mut out = format!("layout {}\n", layout);
        for e in &self.entries {
            out.push_str(&format!("{} {} {}\n", e.component.name(), e.start_block, e.len));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let bad = |line: &str| StrataError::Corruption(format!("malformed TOC line '{}'", line));
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let single_file = match lines.next() {
            Some("layout single") => true,
            Some("layout discrete") => false,
            Some(other) => return Err(bad(other)),
            None => return Err(StrataError::Corruption("empty TOC".into())),
        };
        let mut entries = Vec::new();
        for line in lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 {
                return Err(bad(line));
            }
            entries.push(TocEntry {
                component: parts[0].parse()?,
                start_block: parts[1].parse().map_err(|_| bad(line))?,
                len: parts[2].parse().map_err(|_| bad(line))?,
            });
        }
        Ok(Self {
            single_file,
            entries,
        })
    }

    /// Total persisted bytes across every segment.
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }
}

/// One region of `summary_sparsity` consecutive Index entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRegion {
    pub first_key: Key,
    pub last_key: Key,
    /// Byte offset of the region inside the Index segment.
    pub index_offset: u64,
    pub index_len: u64,
}

/// Summary segment: key bounds of the table and of each index region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
    pub max_timestamp: i64,
    pub regions: Vec<SummaryRegion>,
}

impl Summary {
    /// The only region that may hold `key`.
    pub fn find_region(&self, key: &[u8]) -> Option<&SummaryRegion> {
        let idx = self
            .regions
            .partition_point(|r| r.last_key.as_slice() < key);
        self.regions
            .get(idx)
            .filter(|r| r.first_key.as_slice() <= key)
    }
}

/// Build options taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub summary_sparsity: usize,
    pub compression: bool,
    pub single_file: bool,
    pub bloom_false_positive_rate: f64,
}

impl TableOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            summary_sparsity: config.summary_sparsity,
            compression: config.sstable_compression,
            single_file: config.sstable_single_file,
            bloom_false_positive_rate: config.bloom_false_positive_rate,
        }
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Read a whole file, dropping the zero padding of its last block.
pub(crate) fn read_padded_text(store: &dyn BlockStore, path: &Path) -> Result<Vec<u8>> {
    let count = store.block_count(path)?;
    let mut bytes = Vec::with_capacity(count as usize * store.block_size());
    for block in 0..count {
        if let Some(data) = store.read_block(path, block)? {
            bytes.extend_from_slice(&data);
        }
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    Ok(bytes)
}

/// Read `len` bytes starting `offset` bytes into the segment that begins
/// at `start_block` of `path`.
pub(crate) fn read_range(
    store: &dyn BlockStore,
    path: &Path,
    start_block: u64,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let block_size = store.block_size() as u64;
    let first = offset / block_size;
    let last = (offset + len - 1) / block_size;
    let mut bytes = Vec::with_capacity(((last - first + 1) * block_size) as usize);
    for block in first..=last {
        let data = store.read_block(path, start_block + block)?.ok_or_else(|| {
            StrataError::Corruption(format!(
                "{:?} ends before block {}",
                path,
                start_block + block
            ))
        })?;
        bytes.extend_from_slice(&data);
    }
    let skip = (offset - first * block_size) as usize;
    Ok(bytes[skip..skip + len as usize].to_vec())
}

/// Read a whole segment described by `entry`.
pub(crate) fn read_segment(store: &dyn BlockStore, path: &Path, entry: &TocEntry) -> Result<Vec<u8>> {
    read_range(store, path, entry.start_block, 0, entry.len)
}

/// Number of blocks a segment of `len` bytes occupies.
pub(crate) fn segment_blocks(len: u64, block_size: usize) -> u64 {
    blocks_for(len as usize, block_size) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toc_round_trip() {
        let toc = Toc {
            single_file: true,
            entries: vec![
                TocEntry { component: Component::Data, start_block: 0, len: 9000 },
                TocEntry { component: Component::Index, start_block: 3, len: 120 },
            ],
        };
        let parsed = Toc::parse(&toc.render()).unwrap();
        assert_eq!(parsed, toc);
        assert_eq!(parsed.total_len(), 9120);
        assert!(Toc::parse("layout weird\n").is_err());
        assert!(Toc::parse("layout discrete\nBogus 0 1\n").is_err());
    }

    #[test]
    fn test_paths() {
        let root = Path::new("/data/sstable");
        let table = TableRef::new(2, 7);
        assert_eq!(table.dir(root), PathBuf::from("/data/sstable/2/7"));
        assert_eq!(table.tmp_dir(root), PathBuf::from("/data/sstable/2/7.tmp"));
        assert_eq!(
            component_file_name(7, Some(Component::Filter)),
            "usertable-000007-Filter.db"
        );
        assert_eq!(component_file_name(12, None), "usertable-000012-SSTable.db");
    }

    #[test]
    fn test_find_region() {
        let region = |a: &str, b: &str| SummaryRegion {
            first_key: a.as_bytes().to_vec(),
            last_key: b.as_bytes().to_vec(),
            index_offset: 0,
            index_len: 0,
        };
        let summary = Summary {
            entry_count: 6,
            min_key: b"b".to_vec(),
            max_key: b"m".to_vec(),
            max_timestamp: 0,
            regions: vec![region("b", "d"), region("f", "h"), region("k", "m")],
        };
        assert_eq!(summary.find_region(b"c").map(|r| &r.first_key[..]), Some(&b"b"[..]));
        assert_eq!(summary.find_region(b"h").map(|r| &r.first_key[..]), Some(&b"f"[..]));
        assert!(summary.find_region(b"e").is_none());
        assert!(summary.find_region(b"a").is_none());
        assert!(summary.find_region(b"z").is_none());
    }
}
