//! STRATA - Merkle Tree
//! Integrity metadata over the raw Data blocks of an SSTable.
//!
//! Leaves are SHA-256 digests of each block; every parent hashes the
//! concatenation of its two children (an odd node is paired with itself).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 digest.
pub type Hash = [u8; 32];

/// Leaf digest of one raw block.
pub fn hash_block(block: &[u8]) -> Hash {
    Sha256::digest(block).into()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle tree stored level by level, leaves first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build a tree over `blocks` in order.
    pub fn build<B: AsRef<[u8]>>(blocks: &[B]) -> Self {
        let leaves: Vec<Hash> = blocks.iter().map(|b| hash_block(b.as_ref())).collect();
        Self::from_leaves(leaves)
    }

    /// Build a tree from leaf digests already computed with [`hash_block`].
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map_or(false, |level| level.len() > 1) {
            let below = &levels[levels.len() - 1];
            let parents = below
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(parents);
        }
        Self { levels }
    }

    /// Root digest; all zeroes for a tree without blocks.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first().copied())
            .unwrap_or([0u8; 32])
    }

    /// Number of leaves (data blocks).
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |l| l.len())
    }

    /// Compare against the blocks as they are now; returns the indices of
    /// blocks whose digest changed, plus any blocks added or missing.
    pub fn diff<B: AsRef<[u8]>>(&self, blocks: &[B]) -> Vec<u64> {
        let current = Self::build(blocks);
        if current.root() == self.root() && current.leaf_count() == self.leaf_count() {
            return Vec::new();
        }
        let stored = self.levels.first().map(Vec::as_slice).unwrap_or(&[]);
        let fresh = current.levels.first().map(Vec::as_slice).unwrap_or(&[]);
        (0..stored.len().max(fresh.len()))
            .filter(|&i| stored.get(i) != fresh.get(i))
            .map(|i| i as u64)
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
