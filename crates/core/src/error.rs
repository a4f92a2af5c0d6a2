//! Core error types

use thiserror::Error;

/// Core error type for Tessel
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the storage abstraction.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The named file or directory does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The handle was deleted and can no longer be used
    #[error("Deleted: {0}")]
    Deleted(String),

    /// A read extended past the end of the file
    #[error("Read out of bounds: offset {offset} + {len} exceeds size {size}")]
    OutOfBounds {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: usize,
        /// Actual file size
        size: u64,
    },

    /// Underlying filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
