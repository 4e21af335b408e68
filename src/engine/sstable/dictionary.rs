//! Per-table compression dictionary.
//!
//! Every distinct key or value byte string is stored once; data records refer
//! to it by position.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dictionary {
    entries: Vec<Vec<u8>>,
    #[serde(skip)]
    lookup: HashMap<Vec<u8>, u64>,
}

impl Dictionary {
    /// Index of `bytes`, adding it on first sight.
    pub fn intern(&mut self, bytes: &[u8]) -> u64 {
        if let Some(&index) = self.lookup.get(bytes) {
            return index;
        }
        let index = self.entries.len() as u64;
        self.entries.push(bytes.to_vec());
        self.lookup.insert(bytes.to_vec(), index);
        index
    }

    pub fn resolve(&self, index: u64) -> Result<&[u8]> {
        self.entries
            .get(index as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                StrataError::Corruption(format!(
                    "dictionary index {} out of range ({} entries)",
                    index,
                    self.entries.len()
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dict: Dictionary = bincode::deserialize(bytes)?;
        dict.lookup = dict
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), i as u64))
            .collect();
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut dict = Dictionary::default();
        assert_eq!(dict.intern(b"x"), 0);
        assert_eq!(dict.intern(b"y"), 1);
        assert_eq!(dict.intern(b"x"), 0);
        assert_eq!(dict.resolve(1).unwrap(), b"y");
        assert!(dict.resolve(2).is_err());
    }

    #[test]
    fn test_reload_keeps_lookup() {
        let mut dict = Dictionary::default();
        dict.intern(b"alpha");
        dict.intern(b"beta");
        let mut back = Dictionary::from_bytes(&dict.to_bytes().unwrap()).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.intern(b"beta"), 1);
        assert_eq!(back.intern(b"gamma"), 2);
    }
}
