//! STRATA - Level Bookkeeping
//! The directory tree under the SSTable root is the manifest: every
//! `<level>/<generation>/` directory holding a `TOC.txt` is a live table.
//!
//! This module discovers tables, hands out generations, renumbers
//! survivors after a merge, and replays the compaction journal at startup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::Entry;

use super::block::SharedBlockStore;
use super::sstable::{level_dir, SSTable, TableRef, TMP_SUFFIX, TOC_FILE};

/// File name of the compaction journal under the SSTable root.
pub const JOURNAL_FILE: &str = "COMPACTION.json";

/// Record of a merge whose output is about to be finalized.
///
/// Written before the output is renamed into place and removed once the
/// inputs are gone, so a crash in between can be completed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJournal {
    /// `None` when every merged entry was dropped.
    pub output: Option<TableRef>,
    pub inputs: Vec<TableRef>,
}

impl CompactionJournal {
    pub fn path(root: &Path) -> PathBuf {
        root.join(JOURNAL_FILE)
    }

    /// Persist the journal and fsync it.
    pub fn write(&self, root: &Path) -> Result<()> {
        let file = fs::File::create(Self::path(root))?;
        serde_json::to_writer_pretty(&file, self)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(root: &Path) -> Result<Option<Self>> {
        match fs::read(Self::path(root)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                StrataError::RecoveryFailed(format!("unreadable compaction journal: {}", e))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(root: &Path) -> Result<()> {
        match fs::remove_file(Self::path(root)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn numeric_dirs(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
            found.push((n, entry.path()));
        }
    }
    found.sort_unstable_by_key(|(n, _)| *n);
    Ok(found)
}

/// Finalized generations of `level`, ascending. Directories without a TOC
/// (and `.tmp` build directories) are not tables.
pub fn discover_generations(root: &Path, level: u32) -> Result<Vec<u64>> {
    Ok(numeric_dirs(&level_dir(root, level))?
        .into_iter()
        .filter(|(_, path)| path.join(TOC_FILE).is_file())
        .map(|(generation, _)| generation)
        .collect())
}

/// Next unused generation on `level`.
pub fn next_generation(root: &Path, level: u32) -> Result<u64> {
    Ok(numeric_dirs(&level_dir(root, level))?
        .last()
        .map_or(1, |(generation, _)| generation + 1))
}

/// Remove half-built tables left behind by a crash.
pub fn remove_temporary_tables(store: &SharedBlockStore, root: &Path) -> Result<usize> {
    let mut removed = 0;
    for (_, level_path) in numeric_dirs(root)? {
        for entry in fs::read_dir(&level_path)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(TMP_SUFFIX));
            if is_tmp {
                log::warn!("Removing unfinished table {:?}", path);
                store.remove_dir(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Make the `usertable-NNNNNN-` prefix of every file in a table directory
/// match the directory's generation.
fn normalize_file_names(store: &SharedBlockStore, dir: &Path, generation: u64) -> Result<()> {
    let wanted = format!("usertable-{:06}-", generation);
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(rest) = name.strip_prefix("usertable-") else {
            continue;
        };
        if name.starts_with(&wanted) {
            continue;
        }
        if let Some((_, component)) = rest.split_once('-') {
            store.rename(&path, &dir.join(format!("{}{}", wanted, component)))?;
        }
    }
    Ok(())
}

/// Renumber the tables of `level` contiguously from 1, keeping their order.
pub fn renumber_level(store: &SharedBlockStore, root: &Path, level: u32) -> Result<()> {
    // ascending order never renames onto a live directory
    for (target, generation) in discover_generations(root, level)?.into_iter().enumerate() {
        let target = target as u64 + 1;
        let dir = TableRef::new(level, target).dir(root);
        if generation != target {
            store.rename(&TableRef::new(level, generation).dir(root), &dir)?;
            log::debug!("Renumbered L{} generation {} -> {}", level, generation, target);
        }
        normalize_file_names(store, &dir, target)?;
    }
    Ok(())
}

/// Finish or discard an interrupted compaction.
pub fn replay_journal(store: &SharedBlockStore, root: &Path) -> Result<()> {
    let Some(journal) = CompactionJournal::load(root)? else {
        return Ok(());
    };
    let finalized = journal
        .output
        .map_or(true, |out| out.dir(root).join(TOC_FILE).is_file());
    if finalized {
        log::warn!(
            "Completing interrupted compaction: removing {} input table(s)",
            journal.inputs.len()
        );
        for input in &journal.inputs {
            if Some(*input) != journal.output {
                store.remove_dir(&input.dir(root))?;
            }
        }
    } else {
        log::warn!("Discarding journal of a compaction that never finalized");
    }
    CompactionJournal::clear(root)
}

/// Open tables grouped by level. `levels[0]` is level 1; each level is
/// sorted by ascending generation (oldest first).
pub struct LevelSet {
    store: SharedBlockStore,
    root: PathBuf,
    max_level: u32,
    levels: Vec<Vec<SSTable>>,
}

impl LevelSet {
    /// Clean up after any crash, then open every table under `root`.
    pub fn open(store: SharedBlockStore, root: impl Into<PathBuf>, max_level: u32) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        remove_temporary_tables(&store, &root)?;
        replay_journal(&store, &root)?;

        let mut set = Self {
            store,
            root,
            max_level,
            levels: Vec::new(),
        };
        for level in 1..=max_level {
            renumber_level(&set.store, &set.root, level)?;
        }
        set.reload()?;
        Ok(set)
    }

    /// Re-read the directory tree.
    pub fn reload(&mut self) -> Result<()> {
        let mut levels = Vec::with_capacity(self.max_level as usize);
        for level in 1..=self.max_level {
            let tables = discover_generations(&self.root, level)?
                .into_iter()
                .map(|generation| {
                    SSTable::open(self.store.clone(), &self.root, TableRef::new(level, generation))
                })
                .collect::<Result<Vec<_>>>()?;
            levels.push(tables);
        }
        self.levels = levels;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &SharedBlockStore {
        &self.store
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Tables of `level` (1-based), oldest first.
    pub fn level(&self, level: u32) -> &[SSTable] {
        level
            .checked_sub(1)
            .and_then(|i| self.levels.get(i as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Register a freshly committed table.
    pub fn insert(&mut self, table: SSTable) {
        let level = table.table().level;
        if let Some(tables) = level
            .checked_sub(1)
            .and_then(|i| self.levels.get_mut(i as usize))
        {
            tables.push(table);
            tables.sort_by_key(|t| t.table().generation);
        }
    }

    pub fn next_generation(&self, level: u32) -> Result<u64> {
        next_generation(&self.root, level)
    }

    /// Every table, newest source first: level 1 before level 2, higher
    /// generation before lower.
    pub fn newest_first(&self) -> impl Iterator<Item = &SSTable> {
        self.levels.iter().flat_map(|tables| tables.iter().rev())
    }

    pub fn refs(&self) -> Vec<Vec<TableRef>> {
        self.levels
            .iter()
            .map(|tables| tables.iter().map(SSTable::table).collect())
            .collect()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn find(&self, table: TableRef) -> Option<&SSTable> {
        self.level(table.level)
            .iter()
            .find(|t| t.table() == table)
    }

    /// Highest timestamp persisted anywhere.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.newest_first().map(SSTable::max_timestamp).max()
    }

    /// Newest persisted version of `key`, tombstones included.
    ///
    /// Levels are probed in order and the first level holding the key wins;
    /// inside a level the greatest timestamp wins, ties going to the higher
    /// generation.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        for tables in &self.levels {
            let mut best: Option<Entry> = None;
            for table in tables.iter().rev() {
                if !table.may_contain(key) {
                    continue;
                }
                if let Some(entry) = table.get(key)? {
                    if best.as_ref().map_or(true, |b| entry.timestamp > b.timestamp) {
                        best = Some(entry);
                    }
                }
            }
            if best.is_some() {
                return Ok(best);
            }
        }
        Ok(None)
    }
}
