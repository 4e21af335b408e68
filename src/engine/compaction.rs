//! STRATA - Compaction Strategy
//! Merges SSTables down the levels to bound read amplification and to
//! reclaim space held by overwritten and deleted keys.
//!
//! ## LSM-Tree Compaction
//! Flushes land on level 1. A policy picks input tables, a k-way merge
//! streams them into one new table on the target level, and the inputs are
//! deleted once the new table is durable:
//!
//! ```text
//! Idle → SelectInputs → OpenIterators → StreamMerge → FinalizeNewTable
//!      → DeleteInputs → RenumberGenerations → Idle
//! ```
//!
//! ## Policies
//! - **Size-tiered**: a level holding `threshold` tables merges its two
//!   oldest into the next level (the last level merges in place).
//! - **Leveled**: a level whose total size exceeds
//!   `base_limit × multiplier^level` pushes its oldest table, merged with
//!   every overlapping table below it, into the next level.

use crate::config::{CompactionAlgorithm, Config};
use crate::error::{Result, StrataError};

use super::iter::{EntryIter, MergeIterator};
use super::levels::{renumber_level, CompactionJournal, LevelSet};
use super::sstable::{SSTable, SSTableBuilder, TableOptions, TableRef};

/// Trait defining a compaction strategy.
pub trait CompactionStrategy {
    /// Pick the next merge, or `None` when the tree is within bounds.
    fn select(&self, levels: &LevelSet) -> Option<CompactionTask>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// One merge: `inputs` become a single table on `target_level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub source_level: u32,
    pub target_level: u32,
    pub inputs: Vec<TableRef>,
}

/// Result of one executed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// `None` when every entry was dropped.
    pub output: Option<TableRef>,
    pub entries_written: u64,
    pub tombstones_dropped: u64,
}

/// Size-tiered compaction strategy.
pub struct SizeTieredCompaction {
    /// Number of tables per level that triggers a merge.
    threshold: usize,
    max_level: u32,
}

impl SizeTieredCompaction {
    pub fn new(threshold: usize, max_level: u32) -> Self {
        Self {
            threshold: threshold.max(2),
            max_level,
        }
    }
}

impl CompactionStrategy for SizeTieredCompaction {
    fn select(&self, levels: &LevelSet) -> Option<CompactionTask> {
        (1..=self.max_level).find_map(|level| {
            let tables = levels.level(level);
            (tables.len() >= self.threshold).then(|| CompactionTask {
                source_level: level,
                target_level: (level + 1).min(self.max_level),
                inputs: tables.iter().take(2).map(SSTable::table).collect(),
            })
        })
    }

    fn name(&self) -> &str {
        "SizeTieredCompaction"
    }
}

/// Leveled compaction strategy.
pub struct LeveledCompaction {
    base_limit: u64,
    multiplier: u64,
    max_level: u32,
}

impl LeveledCompaction {
    pub fn new(base_limit: u64, multiplier: u64, max_level: u32) -> Self {
        Self {
            base_limit,
            multiplier: multiplier.max(1),
            max_level,
        }
    }

    /// Byte budget of `level`.
    pub fn level_limit(&self, level: u32) -> u64 {
        self.base_limit
            .saturating_mul(self.multiplier.saturating_pow(level))
    }
}

impl CompactionStrategy for LeveledCompaction {
    fn select(&self, levels: &LevelSet) -> Option<CompactionTask> {
        (1..self.max_level).find_map(|level| {
            let tables = levels.level(level);
            let total: u64 = tables.iter().map(SSTable::size_bytes).sum();
            if total <= self.level_limit(level) {
                return None;
            }
            let oldest = tables.first()?;
            let mut inputs = vec![oldest.table()];
            inputs.extend(
                levels
                    .level(level + 1)
                    .iter()
                    .filter(|t| t.overlaps(oldest))
                    .map(SSTable::table),
            );
            Some(CompactionTask {
                source_level: level,
                target_level: level + 1,
                inputs,
            })
        })
    }

    fn name(&self) -> &str {
        "LeveledCompaction"
    }
}

/// Build the configured policy.
pub fn strategy_for(config: &Config) -> Box<dyn CompactionStrategy + Send + Sync> {
    let max_level = config.max_level as u32;
    match config.compaction_algorithm {
        CompactionAlgorithm::SizeTiered => {
            Box::new(SizeTieredCompaction::new(config.size_tier_threshold, max_level))
        }
        CompactionAlgorithm::Leveled => Box::new(LeveledCompaction::new(
            config.leveled_base_limit,
            config.level_size_multiplier,
            max_level,
        )),
    }
}

/// Steps of one merge, logged as they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SelectInputs,
    OpenIterators,
    StreamMerge,
    FinalizeNewTable,
    DeleteInputs,
    RenumberGenerations,
}

fn enter(phase: Phase, task: &CompactionTask) {
    log::debug!(
        "compaction L{} -> L{}: {:?}",
        task.source_level,
        task.target_level,
        phase
    );
}

/// True if a table outside the merge may still hold a version of `key`
/// that a dropped tombstone would let resurface.
fn shadows_older(guards: &[&SSTable], key: &[u8]) -> Result<bool> {
    for table in guards {
        if table.may_contain(key) && table.get(key)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Execute `task` against `levels`. The level set is reloaded afterwards.
pub fn run_compaction(
    levels: &mut LevelSet,
    task: &CompactionTask,
    options: &TableOptions,
) -> Result<CompactionOutcome> {
    let root = levels.root().to_path_buf();
    let store = levels.store().clone();
    let output_ref = TableRef::new(task.target_level, levels.next_generation(task.target_level)?);

    let (pending, entries_written, tombstones_dropped) = {
        enter(Phase::SelectInputs, task);
        let mut inputs = task
            .inputs
            .iter()
            .map(|t| {
                levels.find(*t).ok_or_else(|| {
                    StrataError::Corruption(format!("compaction input {} is not a live table", t))
                })
            })
            .collect::<Result<Vec<&SSTable>>>()?;
        // merge priority: lower level first, then newer generation
        inputs.sort_by_key(|t| (t.table().level, std::cmp::Reverse(t.table().generation)));
        let guards: Vec<&SSTable> = levels
            .newest_first()
            .filter(|t| t.table().level >= task.source_level && !task.inputs.contains(&t.table()))
            .collect();
        let expected: u64 = inputs.iter().map(|t| t.entry_count()).sum();

        enter(Phase::OpenIterators, task);
        let sources = inputs
            .iter()
            .map(|t| Ok(Box::new(t.iter()?) as EntryIter<'static>))
            .collect::<Result<Vec<_>>>()?;
        let mut builder = SSTableBuilder::new(
            store.clone(),
            &root,
            output_ref,
            options.clone(),
            expected as usize,
        )?;

        enter(Phase::StreamMerge, task);
        let mut written = 0u64;
        let mut dropped = 0u64;
        let streamed: Result<()> = (|| {
            for entry in MergeIterator::new(sources) {
                let entry = entry?;
                if entry.tombstone && !shadows_older(&guards, &entry.key)? {
                    dropped += 1;
                    continue;
                }
                builder.add(&entry)?;
                written += 1;
            }
            Ok(())
        })();
        if let Err(e) = streamed {
            store.remove_dir(&output_ref.tmp_dir(&root))?;
            return Err(e);
        }

        enter(Phase::FinalizeNewTable, task);
        (builder.finish()?, written, dropped)
    };

    let journal = CompactionJournal {
        output: pending.as_ref().map(|p| p.table()),
        inputs: task.inputs.clone(),
    };
    journal.write(&root)?;
    if let Some(pending) = pending {
        pending.commit()?;
    }

    enter(Phase::DeleteInputs, task);
    for input in &task.inputs {
        store.remove_dir(&input.dir(&root))?;
    }
    CompactionJournal::clear(&root)?;

    enter(Phase::RenumberGenerations, task);
    renumber_level(&store, &root, task.source_level)?;
    if task.target_level != task.source_level {
        renumber_level(&store, &root, task.target_level)?;
    }
    levels.reload()?;

    log::info!(
        "Compacted {} table(s) L{} -> L{}: {} entries kept, {} tombstones dropped",
        task.inputs.len(),
        task.source_level,
        task.target_level,
        entries_written,
        tombstones_dropped
    );
    Ok(CompactionOutcome {
        output: journal.output,
        entries_written,
        tombstones_dropped,
    })
}

/// Run `strategy` until it finds nothing to do; returns the number of merges.
pub fn compact_until_quiet(
    levels: &mut LevelSet,
    strategy: &dyn CompactionStrategy,
    options: &TableOptions,
) -> Result<usize> {
    let mut merges = 0;
    while let Some(task) = strategy.select(levels) {
        run_compaction(levels, &task, options)?;
        merges += 1;
    }
    Ok(merges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::{FileBlockManager, SharedBlockStore};
    use crate::types::Entry;
    use std::path::Path;
    use std::sync::Arc;

    fn put(key: &str, value: &str, ts: i64) -> Entry {
        Entry::put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), ts)
    }

    fn build(store: &SharedBlockStore, root: &Path, table: TableRef, items: &[Entry]) {
        let mut builder = SSTableBuilder::new(
            store.clone(),
            root,
            table,
            TableOptions::default(),
            items.len(),
        )
        .unwrap();
        for e in items {
            builder.add(e).unwrap();
        }
        builder.finish().unwrap().unwrap().commit().unwrap();
    }

    fn setup() -> (tempfile::TempDir, SharedBlockStore) {
        (tempfile::tempdir().unwrap(), Arc::new(FileBlockManager::new(128)))
    }

    fn all_entries(levels: &LevelSet) -> Vec<Entry> {
        let sources: Vec<EntryIter> = levels
            .newest_first()
            .map(|t| Box::new(t.iter().unwrap()) as EntryIter)
            .collect();
        MergeIterator::new(sources).map(|e| e.unwrap()).collect()
    }

    #[test]
    fn test_size_tiered_selects_two_oldest() {
        let (dir, store) = setup();
        for g in 1..=3 {
            build(&store, dir.path(), TableRef::new(1, g), &[put("k", "v", g as i64)]);
        }
        let levels = LevelSet::open(store, dir.path(), 3).unwrap();
        assert!(SizeTieredCompaction::new(4, 3).select(&levels).is_none());
        let task = SizeTieredCompaction::new(3, 3).select(&levels).unwrap();
        assert_eq!(task.source_level, 1);
        assert_eq!(task.target_level, 2);
        assert_eq!(task.inputs, vec![TableRef::new(1, 1), TableRef::new(1, 2)]);
    }

    #[test]
    fn test_size_tiered_last_level_merges_in_place() {
        let (dir, store) = setup();
        build(&store, dir.path(), TableRef::new(2, 1), &[put("a", "1", 1)]);
        build(&store, dir.path(), TableRef::new(2, 2), &[put("b", "2", 2)]);
        let mut levels = LevelSet::open(store, dir.path(), 2).unwrap();
        let strategy = SizeTieredCompaction::new(2, 2);
        let task = strategy.select(&levels).unwrap();
        assert_eq!((task.source_level, task.target_level), (2, 2));

        assert_eq!(
            compact_until_quiet(&mut levels, &strategy, &TableOptions::default()).unwrap(),
            1
        );
        assert_eq!(levels.refs(), vec![vec![], vec![TableRef::new(2, 1)]]);
        assert_eq!(levels.level(2)[0].entry_count(), 2);
    }

    #[test]
    fn test_merge_resolves_duplicates_and_conserves_keys() {
        let (dir, store) = setup();
        build(
            &store,
            dir.path(),
            TableRef::new(1, 1),
            &[put("a", "a1", 1), put("b", "b1", 2), put("c", "c1", 3)],
        );
        build(
            &store,
            dir.path(),
            TableRef::new(1, 2),
            &[put("b", "b2", 10), put("d", "d2", 11)],
        );
        build(&store, dir.path(), TableRef::new(1, 3), &[put("e", "e3", 20)]);
        let mut levels = LevelSet::open(store, dir.path(), 3).unwrap();
        let before: Vec<Entry> = all_entries(&levels);

        let strategy = SizeTieredCompaction::new(2, 3);
        compact_until_quiet(&mut levels, &strategy, &TableOptions::default()).unwrap();

        assert_eq!(all_entries(&levels), before);
        assert_eq!(levels.get(b"b").unwrap().unwrap().value, b"b2");
        assert!(levels.level(1).len() < 2);
        assert!(!CompactionJournal::path(dir.path()).exists());
    }

    #[test]
    fn test_tombstone_kept_while_older_version_outside_merge() {
        let (dir, store) = setup();
        build(&store, dir.path(), TableRef::new(3, 1), &[put("x", "ancient", 1)]);
        build(&store, dir.path(), TableRef::new(1, 1), &[put("x", "old", 5)]);
        build(&store, dir.path(), TableRef::new(1, 2), &[Entry::delete(b"x".to_vec(), 9)]);
        let mut levels = LevelSet::open(store, dir.path(), 3).unwrap();

        let task = CompactionTask {
            source_level: 1,
            target_level: 2,
            inputs: vec![TableRef::new(1, 1), TableRef::new(1, 2)],
        };
        let outcome = run_compaction(&mut levels, &task, &TableOptions::default()).unwrap();
        assert_eq!(outcome.tombstones_dropped, 0);
        assert!(levels.get(b"x").unwrap().unwrap().tombstone);
    }

    #[test]
    fn test_tombstone_dropped_when_nothing_older_remains() {
        let (dir, store) = setup();
        build(&store, dir.path(), TableRef::new(1, 1), &[put("x", "old", 5), put("y", "y", 6)]);
        build(&store, dir.path(), TableRef::new(1, 2), &[Entry::delete(b"x".to_vec(), 9)]);
        let mut levels = LevelSet::open(store, dir.path(), 2).unwrap();

        let task = CompactionTask {
            source_level: 1,
            target_level: 2,
            inputs: vec![TableRef::new(1, 1), TableRef::new(1, 2)],
        };
        let outcome = run_compaction(&mut levels, &task, &TableOptions::default()).unwrap();
        assert_eq!(outcome.tombstones_dropped, 1);
        assert_eq!(outcome.entries_written, 1);
        assert!(levels.get(b"x").unwrap().is_none());
        assert_eq!(levels.get(b"y").unwrap().unwrap().value, b"y");
    }

    #[test]
    fn test_all_tombstones_leave_no_table() {
        let (dir, store) = setup();
        build(&store, dir.path(), TableRef::new(1, 1), &[Entry::delete(b"x".to_vec(), 1)]);
        build(&store, dir.path(), TableRef::new(1, 2), &[Entry::delete(b"y".to_vec(), 2)]);
        let mut levels = LevelSet::open(store, dir.path(), 2).unwrap();
        let task = SizeTieredCompaction::new(2, 2).select(&levels).unwrap();
        let outcome = run_compaction(&mut levels, &task, &TableOptions::default()).unwrap();
        assert_eq!(outcome.output, None);
        assert_eq!(levels.table_count(), 0);
    }

    #[test]
    fn test_leveled_pushes_oldest_with_overlaps() {
        let (dir, store) = setup();
        build(&store, dir.path(), TableRef::new(1, 1), &[put("a", "1", 1), put("m", "1", 2)]);
        build(&store, dir.path(), TableRef::new(1, 2), &[put("x", "2", 3)]);
        build(&store, dir.path(), TableRef::new(2, 1), &[put("c", "old", 0)]);
        build(&store, dir.path(), TableRef::new(2, 2), &[put("z", "far", 0)]);
        let mut levels = LevelSet::open(store, dir.path(), 3).unwrap();

        let strategy = LeveledCompaction::new(1, 1, 3);
        let task = strategy.select(&levels).unwrap();
        assert_eq!(task.target_level, 2);
        assert_eq!(task.inputs, vec![TableRef::new(1, 1), TableRef::new(2, 1)]);

        let roomy = LeveledCompaction::new(1 << 30, 10, 3);
        assert!(roomy.select(&levels).is_none());

        compact_until_quiet(&mut levels, &strategy, &TableOptions::default()).unwrap();
        assert!(levels.level(1).is_empty());
        assert!(levels.level(2).is_empty());
        assert_eq!(levels.get(b"c").unwrap().unwrap().value, b"old");
        assert_eq!(levels.get(b"x").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn test_level_limit_grows_geometrically() {
        let strategy = LeveledCompaction::new(100, 10, 4);
        assert_eq!(strategy.level_limit(1), 1_000);
        assert_eq!(strategy.level_limit(2), 10_000);
    }
}
