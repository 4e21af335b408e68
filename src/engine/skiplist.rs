//! STRATA - Skip List
//! Probabilistic ordered map backing the memtable.
//!
//! Nodes live in an arena (`Vec<Node>`) and link to each other by index, so
//! no node is aliased across levels.
//!
//! ```text
//! Level 2:  HEAD ──────────► 20 ────────────────► 50 ──────────► NIL
//! Level 1:  HEAD ──► 10 ──► 20 ────► 35 ────────► 50 ──► 60 ──► NIL
//! Level 0:  HEAD ──► 10 ──► 20 ──► 25 ──► 35 ──► 50 ──► 60 ──► 70 ► NIL
//! ```

use rand::Rng;

use crate::types::Key;

const HEAD: usize = 0;

struct Node<V> {
    key: Key,
    value: Option<V>,
    /// Successor index at each level this node participates in.
    next: Vec<Option<usize>>,
}

/// An ordered map from byte keys to `V` with expected O(log n) operations.
pub struct SkipList<V> {
    /// Arena; index 0 is the head sentinel (no key, no value).
    nodes: Vec<Node<V>>,
    max_height: usize,
    /// Tallest tower currently in use.
    height: usize,
    len: usize,
}

impl<V> SkipList<V> {
    /// Create an empty skip list whose towers never exceed `max_height`.
    pub fn new(max_height: usize) -> Self {
        let max_height = max_height.max(1);
        Self {
            nodes: vec![Node {
                key: Vec::new(),
                value: None,
                next: vec![None; max_height],
            }],
            max_height,
            height: 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_height(&self) -> usize {
        self.max_height
    }

    /// Fair coin flips: each extra level survives with probability 1/2.
    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < self.max_height && rng.gen_bool(0.5) {
            height += 1;
        }
        height
    }

    /// Descend from the top level, recording the last node before `key` on
    /// every level.
    fn predecessors(&self, key: &[u8]) -> Vec<usize> {
        let mut update = vec![HEAD; self.max_height];
        let mut current = HEAD;
        for level in (0..self.height).rev() {
            while let Some(next) = self.nodes[current].next[level] {
                if self.nodes[next].key.as_slice() < key {
                    current = next;
                } else {
                    break;
                }
            }
            update[level] = current;
        }
        update
    }

    /// Insert `key`, overwriting the value in place if it already exists.
    /// Returns the previous value.
    pub fn insert(&mut self, key: Key, value: V) -> Option<V> {
        let update = self.predecessors(&key);
        if let Some(candidate) = self.nodes[update[0]].next[0] {
            if self.nodes[candidate].key == key {
                return self.nodes[candidate].value.replace(value);
            }
        }

        let height = self.random_height();
        if height > self.height {
            self.height = height;
        }
        let index = self.nodes.len();
        let mut next = vec![None; height];
        for (level, slot) in next.iter_mut().enumerate() {
            *slot = self.nodes[update[level]].next[level];
        }
        self.nodes.push(Node {
            key,
            value: Some(value),
            next,
        });
        for (level, &pred) in update.iter().enumerate().take(height) {
            self.nodes[pred].next[level] = Some(index);
        }
        self.len += 1;
        None
    }

    /// Look up `key`.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let update = self.predecessors(key);
        let candidate = self.nodes[update[0]].next[0]?;
        let node = &self.nodes[candidate];
        if node.key.as_slice() == key {
            node.value.as_ref()
        } else {
            None
        }
    }

    /// Iterate every entry in key order along the bottom level.
    pub fn iter(&self) -> SkipListIter<'_, V> {
        SkipListIter {
            list: self,
            current: self.nodes[HEAD].next[0],
        }
    }

    /// Iterate from the first key `>= key`.
    pub fn seek(&self, key: &[u8]) -> SkipListIter<'_, V> {
        let update = self.predecessors(key);
        SkipListIter {
            list: self,
            current: self.nodes[update[0]].next[0],
        }
    }
}

/// Sorted iterator over a [`SkipList`].
pub struct SkipListIter<'a, V> {
    list: &'a SkipList<V>,
    current: Option<usize>,
}

impl<'a, V> Iterator for SkipListIter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let index = self.current?;
            let node = &self.list.nodes[index];
            self.current = node.next[0];
            if let Some(value) = node.value.as_ref() {
                return Some((node.key.as_slice(), value));
            }
        }
    }
}
