//! STRATA - Error Types
//! Defines the error hierarchy for the LSM storage engine.

use thiserror::Error;

/// Custom Result type for the Strata engine.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Error types for the Strata storage engine.
///
/// A missing or deleted key is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum StrataError {
    /// I/O errors from file operations (block store, WAL, SSTable).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors (bincode, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, malformed fragments, bad layout).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// WAL or compaction-journal recovery failure.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error, raised before any I/O happens.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StrataError {
    fn from(err: bincode::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}
