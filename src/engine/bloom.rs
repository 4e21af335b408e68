//! STRATA - Bloom Filter
//! A space-efficient probabilistic data structure used to test
//! whether an element is a member of a set.
//!
//! False positives are possible, but false negatives are not.
//! Every SSTable persists one in its Filter segment so point lookups
//! can skip tables that definitely do not hold a key.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::Result;

/// A Bloom filter for probabilistic set membership testing.
///
/// ## How it works
/// - Multiple hash functions map each key to bit positions
/// - On insert: set all corresponding bits to 1
/// - On lookup: check if all corresponding bits are 1
/// - If any bit is 0 → key is **definitely not** in the set
/// - If all bits are 1 → key is **probably** in the set
///
/// ## False Positive Rate
/// With `k` hash functions and `m` bits for `n` inserted elements:
/// `FPR ≈ (1 - e^(-kn/m))^k`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Bit array stored as bytes.
    bits: Vec<u8>,
    /// Number of bits in the filter.
    num_bits: usize,
    /// Number of hash functions to use.
    num_hashes: u32,
    /// Number of elements inserted.
    count: usize,
}

impl BloomFilter {
    /// Create a new Bloom filter optimized for `expected_items`
    /// with the given `false_positive_rate`.
    ///
    /// # Formulas
    /// - Optimal bits: `m = -n * ln(p) / (ln(2)^2)`
    /// - Optimal hashes: `k = (m/n) * ln(2)`
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let fp_rate = false_positive_rate.clamp(0.0001, 0.5);

        let num_bits =
            (-(expected_items as f64) * fp_rate.ln() / (2.0_f64.ln().powi(2))).ceil() as usize;
        let num_bits = num_bits.max(64); // minimum 64 bits

        let num_hashes = ((num_bits as f64 / expected_items as f64) * 2.0_f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(2, 16);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
            num_hashes,
            count: 0,
        }
    }

    /// Insert a key into the Bloom filter.
    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit_index = self.hash_index(key, i);
            self.bits[bit_index / 8] |= 1 << (bit_index % 8);
        }
        self.count += 1;
    }

    /// Check if a key **may** be in the set.
    /// - Returns `false` → key is **definitely not** in the set
    /// - Returns `true` → key is **probably** in the set (may be false positive)
    pub fn may_contain(&self, key: &[u8]) -> bool {
        (0..self.num_hashes).all(|i| {
            let bit_index = self.hash_index(key, i);
            self.bits[bit_index / 8] & (1 << (bit_index % 8)) != 0
        })
    }

    /// Returns the number of elements inserted.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Returns the number of hash functions used.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Estimated false positive rate based on current fill.
    pub fn estimated_fpr(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = self.count as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Serialize for the Filter segment.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a Filter segment.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Double hashing: `h(i) = h1 + i * h2 (mod m)`.
    ///
    /// xxh3 is stable across builds, which matters because filters are persisted.
    fn hash_index(&self, key: &[u8], i: u32) -> usize {
        let h1 = xxh3_64_with_seed(key, 0);
        let h2 = xxh3_64_with_seed(key, 0xDEAD_BEEF);
        let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (combined % self.num_bits as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut bf = BloomFilter::new(100, 0.01);
        bf.insert(b"hello");
        bf.insert(b"world");

        assert!(bf.may_contain(b"hello"));
        assert!(bf.may_contain(b"world"));
        assert_eq!(bf.count(), 2);
    }

    #[test]
    fn test_definitely_not_contains() {
        let mut bf = BloomFilter::new(100, 0.01);
        bf.insert(b"alpha");
        bf.insert(b"bravo");

        let false_positives = (0..1000)
            .filter(|i| bf.may_contain(format!("nonexistent_key_{}", i).as_bytes()))
            .count();
        assert!(
            false_positives < 50,
            "Too many false positives: {}",
            false_positives
        );
    }

    #[test]
    fn test_no_false_negatives() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            bf.insert(format!("key_{}", i).as_bytes());
        }
        for i in 0..500 {
            let key = format!("key_{}", i);
            assert!(bf.may_contain(key.as_bytes()), "False negative for key: {}", key);
        }
    }

    #[test]
    fn test_estimated_fpr() {
        let mut bf = BloomFilter::new(100, 0.01);
        assert_eq!(bf.estimated_fpr(), 0.0);
        for i in 0..100 {
            bf.insert(format!("k{}", i).as_bytes());
        }
        let fpr = bf.estimated_fpr();
        assert!(fpr > 0.0);
        assert!(fpr < 0.1);
    }

    #[test]
    fn test_persisted_filter_answers_the_same() {
        let mut bf = BloomFilter::new(50, 0.01);
        for i in 0..50 {
            bf.insert(format!("row{}", i).as_bytes());
        }
        let restored = BloomFilter::from_bytes(&bf.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.num_bits(), bf.num_bits());
        assert_eq!(restored.num_hashes(), bf.num_hashes());
        for i in 0..200 {
            let key = format!("row{}", i);
            assert_eq!(restored.may_contain(key.as_bytes()), bf.may_contain(key.as_bytes()));
        }
    }
}
