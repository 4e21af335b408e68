//! STRATA - Core Type Definitions
//! Defines fundamental types used across the storage engine.

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Using Vec<u8> allows arbitrary binary values.
pub type Value = Vec<u8>;

/// Keys starting with this prefix belong to internal collaborators
/// (rate limiter bookkeeping and the like) and are hidden from scans.
pub const INTERNAL_KEY_PREFIX: &[u8] = b"__strata_internal__";

/// Returns true if `key` is reserved for internal bookkeeping.
pub fn is_internal_key(key: &[u8]) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX)
}

/// Represents a single entry in the storage engine.
///
/// The same entry flows through the WAL, the memtable and every SSTable.
/// A tombstone carries an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
    pub timestamp: i64,
    pub tombstone: bool,
}

impl Entry {
    /// Create a new entry with a value (PUT operation).
    pub fn put(key: Key, value: Value, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
            tombstone: false,
        }
    }

    /// Create a tombstone entry (DELETE operation).
    pub fn delete(key: Key, timestamp: i64) -> Self {
        Self {
            key,
            value: Vec::new(),
            timestamp,
            tombstone: true,
        }
    }

    /// Returns true if this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Returns the value, or `None` for tombstones.
    pub fn live_value(&self) -> Option<&Value> {
        if self.tombstone {
            None
        } else {
            Some(&self.value)
        }
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_has_no_value() {
        let e = Entry::delete(b"k".to_vec(), 7);
        assert!(e.is_tombstone());
        assert!(e.value.is_empty());
        assert_eq!(e.live_value(), None);
    }

    #[test]
    fn test_internal_prefix() {
        assert!(is_internal_key(b"__strata_internal__limiter"));
        assert!(!is_internal_key(b"user:1"));
    }
}
