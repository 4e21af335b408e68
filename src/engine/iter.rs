//! STRATA - Entry Iterators
//! Every source (memtable, SSTable) is an `Iterator<Item = Result<Entry>>`
//! yielding keys in ascending order. [`MergeIterator`] combines any number of
//! them; [`RangeIter`] and [`PrefixIter`] restrict one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::types::{Entry, Key};

/// Boxed sorted entry source.
pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;

/// Heap slot: the current head of one source.
struct HeapItem {
    entry: Entry,
    /// Position in the source list; lower is newer.
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    /// `BinaryHeap` is a max-heap, so "greatest" must mean: smallest key,
    /// then newest timestamp, then highest-priority source.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| self.entry.timestamp.cmp(&other.entry.timestamp))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge over sorted sources.
///
/// Sources are ordered by priority: index 0 is the newest (memtable), higher
/// indices are older. For each key only the newest version is yielded;
/// tombstones are yielded too and left to the caller.
pub struct MergeIterator<'a> {
    sources: Vec<EntryIter<'a>>,
    heap: BinaryHeap<HeapItem>,
    primed: bool,
    failed: bool,
}

impl<'a> MergeIterator<'a> {
    pub fn new(sources: Vec<EntryIter<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            primed: false,
            failed: false,
        }
    }

    /// Pull the next entry of `source` onto the heap.
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapItem {
                entry: next?,
                source,
            });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                self.refill(source)?;
            }
        }
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(top.source)?;
        // discard older versions of the same key
        while self
            .heap
            .peek()
            .map_or(false, |next| next.entry.key == top.entry.key)
        {
            if let Some(stale) = self.heap.pop() {
                self.refill(stale.source)?;
            }
        }
        Ok(Some(top.entry))
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Entries with `start <= key < end` (`end` of `None` is unbounded).
pub struct RangeIter<'a> {
    inner: EntryIter<'a>,
    start: Key,
    end: Option<Key>,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub fn new(inner: EntryIter<'a>, start: &[u8], end: Option<&[u8]>) -> Self {
        Self {
            inner,
            start: start.to_vec(),
            end: end.map(<[u8]>::to_vec),
            done: false,
        }
    }
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if entry.key < self.start {
                continue;
            }
            if self.end.as_ref().map_or(false, |end| entry.key >= *end) {
                self.done = true;
                return None;
            }
            return Some(Ok(entry));
        }
        None
    }
}

/// Entries whose key starts with `prefix`.
pub struct PrefixIter<'a> {
    inner: RangeIter<'a>,
    prefix: Key,
}

impl<'a> PrefixIter<'a> {
    pub fn new(inner: EntryIter<'a>, prefix: &[u8]) -> Self {
        Self {
            inner: RangeIter::new(inner, prefix, None),
            prefix: prefix.to_vec(),
        }
    }
}

impl<'a> Iterator for PrefixIter<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(entry) if entry.key.starts_with(&self.prefix) => Some(Ok(entry)),
            Ok(_) => {
                self.inner.done = true;
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}
