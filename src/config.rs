//! STRATA - Engine Configuration
//! Defines tunable parameters for the LSM storage engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Which compaction policy picks the tables to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompactionAlgorithm {
    /// Merge the two oldest generations of a level once it holds too many.
    SizeTiered,
    /// Keep each level under `base_limit * multiplier^level` bytes.
    Leveled,
}

impl FromStr for CompactionAlgorithm {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "size_tiered" | "sizetiered" | "size-tiered" => Ok(Self::SizeTiered),
            "leveled" => Ok(Self::Leveled),
            other => Err(StrataError::Config(format!(
                "unknown compaction algorithm '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for CompactionAlgorithm {
    type Error = StrataError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CompactionAlgorithm> for String {
    fn from(algo: CompactionAlgorithm) -> Self {
        algo.to_string()
    }
}

impl fmt::Display for CompactionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeTiered => write!(f, "size_tiered"),
            Self::Leveled => write!(f, "leveled"),
        }
    }
}

/// Backing structure of each memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemtableStructure {
    SkipList,
    BTree,
}

impl FromStr for MemtableStructure {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skiplist" | "skip_list" => Ok(Self::SkipList),
            "btree" | "b_tree" => Ok(Self::BTree),
            other => Err(StrataError::Config(format!(
                "unknown memtable structure '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MemtableStructure {
    type Error = StrataError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MemtableStructure> for String {
    fn from(structure: MemtableStructure) -> Self {
        match structure {
            MemtableStructure::SkipList => "skiplist".to_string(),
            MemtableStructure::BTree => "btree".to_string(),
        }
    }
}

/// Configuration for the Strata storage engine.
///
/// `wal_dir` and `sstable_dir` are resolved against `data_dir` when relative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all data files (WAL, SSTables).
    pub data_dir: PathBuf,

    /// Size of one block in bytes; the unit of disk I/O and caching.
    pub block_size: usize,

    /// Number of blocks the block cache holds.
    pub block_cache_capacity: usize,

    /// Number of entries the read cache holds.
    pub read_cache_capacity: usize,

    /// Number of memtable generations in the ring.
    pub memtable_count: usize,

    /// Entries per memtable before it is considered full.
    pub memtable_capacity: usize,

    /// Backing structure of each memtable.
    pub memtable_structure: MemtableStructure,

    /// Maximum tower height of the skip list.
    pub skiplist_max_height: usize,

    /// Directory holding WAL segments.
    pub wal_dir: PathBuf,

    /// Blocks per WAL segment before rotation.
    pub wal_segment_size: usize,

    /// Whether to fsync WAL segments after every append.
    pub sync_writes: bool,

    /// Directory holding the level/generation tree of SSTables.
    pub sstable_dir: PathBuf,

    /// Intern keys and values through a compression dictionary.
    pub sstable_compression: bool,

    /// Index entries summarized by one Summary region.
    pub summary_sparsity: usize,

    /// Write every SSTable as one file plus a table of contents.
    pub sstable_single_file: bool,

    /// Target false positive rate of each SSTable's Bloom filter.
    pub bloom_false_positive_rate: f64,

    /// Deepest level of the tree.
    pub max_level: usize,

    /// Policy used by compaction.
    pub compaction_algorithm: CompactionAlgorithm,

    /// Size-tiered: generations on a level that trigger a merge.
    pub size_tier_threshold: usize,

    /// Leveled: byte budget of level 0 before multiplication.
    pub leveled_base_limit: u64,

    /// Leveled: growth factor between consecutive levels.
    pub level_size_multiplier: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_size: 4096,
            block_cache_capacity: 256,
            read_cache_capacity: 1024,
            memtable_count: 1,
            memtable_capacity: 1024,
            memtable_structure: MemtableStructure::SkipList,
            skiplist_max_height: 16,
            wal_dir: PathBuf::from("wal"),
            wal_segment_size: 64,
            sync_writes: true,
            sstable_dir: PathBuf::from("sstable"),
            sstable_compression: false,
            summary_sparsity: 16,
            sstable_single_file: false,
            bloom_false_positive_rate: 0.01,
            max_level: 4,
            compaction_algorithm: CompactionAlgorithm::SizeTiered,
            size_tier_threshold: 4,
            leveled_base_limit: 64 * 1024, // 64 KB
            level_size_multiplier: 10,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StrataError::Config(format!("invalid configuration: {}", e)))
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Set the block size in bytes.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the number of memtable generations.
    pub fn with_memtable_count(mut self, count: usize) -> Self {
        self.memtable_count = count;
        self
    }

    /// Set the number of entries a memtable holds before it is full.
    pub fn with_memtable_capacity(mut self, capacity: usize) -> Self {
        self.memtable_capacity = capacity;
        self
    }

    /// Set the memtable backing structure.
    pub fn with_memtable_structure(mut self, structure: MemtableStructure) -> Self {
        self.memtable_structure = structure;
        self
    }

    /// Set the WAL segment size in blocks.
    pub fn with_wal_segment_size(mut self, blocks: usize) -> Self {
        self.wal_segment_size = blocks;
        self
    }

    /// Set the compaction policy.
    pub fn with_compaction(mut self, algorithm: CompactionAlgorithm) -> Self {
        self.compaction_algorithm = algorithm;
        self
    }

    /// Set the size-tiered merge threshold.
    pub fn with_size_tier_threshold(mut self, threshold: usize) -> Self {
        self.size_tier_threshold = threshold;
        self
    }

    /// Enable or disable the SSTable compression dictionary.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.sstable_compression = enabled;
        self
    }

    /// Enable or disable the single-file SSTable layout.
    pub fn with_single_file(mut self, enabled: bool) -> Self {
        self.sstable_single_file = enabled;
        self
    }

    /// Resolved WAL directory.
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_dir)
    }

    /// Resolved SSTable directory.
    pub fn sstable_path(&self) -> PathBuf {
        self.data_dir.join(&self.sstable_dir)
    }

    /// Check every parameter. Runs before the engine touches the disk.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(64..=1 << 20).contains(&self.block_size) {
            return Err(StrataError::Config(format!(
                "block size must be a power of two between 64 and 1048576, got {}",
                self.block_size
            )));
        }
        let positive = [
            ("block_cache_capacity", self.block_cache_capacity),
            ("read_cache_capacity", self.read_cache_capacity),
            ("memtable_count", self.memtable_count),
            ("memtable_capacity", self.memtable_capacity),
            ("wal_segment_size", self.wal_segment_size),
            ("summary_sparsity", self.summary_sparsity),
            ("max_level", self.max_level),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StrataError::Config(format!("{} must be at least 1", name)));
            }
        }
        if !(1..=32).contains(&self.skiplist_max_height) {
            return Err(StrataError::Config(format!(
                "skip list height must be between 1 and 32, got {}",
                self.skiplist_max_height
            )));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(StrataError::Config(format!(
                "bloom false positive rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        if self.size_tier_threshold < 2 {
            return Err(StrataError::Config(
                "size tier threshold must be at least 2".to_string(),
            ));
        }
        if self.level_size_multiplier == 0 || self.leveled_base_limit == 0 {
            return Err(StrataError::Config(
                "leveled limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Ensure the data, WAL and SSTable directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.wal_path())?;
        std::fs::create_dir_all(self.sstable_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = Config::default().with_block_size(1000);
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
        let config = Config::default().with_block_size(32);
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_unknown_compaction_algorithm() {
        let err = "tiered_leveled".parse::<CompactionAlgorithm>().unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));

        let json = r#"{ "compaction_algorithm": "bogus" }"#;
        assert!(matches!(
            Config::from_json_str(json),
            Err(StrataError::Config(_))
        ));
    }

    #[test]
    fn test_json_partial_overrides() {
        let json = r#"{
            "block_size": 8192,
            "memtable_capacity": 2,
            "compaction_algorithm": "leveled",
            "memtable_structure": "btree"
        }"#;
        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.memtable_capacity, 2);
        assert_eq!(config.compaction_algorithm, CompactionAlgorithm::Leveled);
        assert_eq!(config.memtable_structure, MemtableStructure::BTree);
        // untouched fields keep their defaults
        assert_eq!(config.max_level, 4);
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::new("/tmp/x").with_compaction(CompactionAlgorithm::Leveled);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"leveled\""));
        let back = Config::from_json_str(&json).unwrap();
        assert_eq!(back.compaction_algorithm, CompactionAlgorithm::Leveled);
        assert_eq!(back.data_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_resolved_paths() {
        let config = Config::new("/srv/db");
        assert_eq!(config.wal_path(), PathBuf::from("/srv/db/wal"));
        assert_eq!(config.sstable_path(), PathBuf::from("/srv/db/sstable"));
    }
}
