//! STRATA - LSM-Tree Key-Value Storage Engine
//!
//! An embedded, crash-recoverable storage engine based on the Log-Structured
//! Merge-Tree (LSM-Tree) architecture, built over a fixed-size block store.
//!
//! ## Features
//! - **Block store**: every file is read and written in whole blocks, with an LRU block cache
//! - **Write-Ahead Log (WAL)**: fragmenting, segmented log with CRC32 integrity checks
//! - **MemTables**: a ring of skip-list (or B-tree) generations
//! - **SSTables**: Data/Index/Summary/Filter/Metadata components with a TOC,
//!   either as separate files or one file per table
//! - **Bloom Filter** and **Merkle tree** per table
//! - **Compaction**: size-tiered or leveled, crash-safe through a journal
//! - **Scans**: full, range and prefix, with pagination
//! - **Metrics**: lock-free atomic counters for observability
//! - **Concurrency**: thread-safe Arc + RwLock wrapper
//!
//! ## Example
//! ```no_run
//! use strata::{config::Config, engine::Strata};
//!
//! let config = Config::new("./strata_data");
//! let mut engine = Strata::open(config).unwrap();
//!
//! engine.put(b"key".to_vec(), b"value".to_vec()).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
