//! Error types for the metadata store.

use tessel_core::{PublicKey, StorageError};
use thiserror::Error;

/// Errors that can occur in metadata operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// A space or identity record with this key is already present
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No catalog entry for this space
    #[error("Space not found: {0}")]
    SpaceNotFound(PublicKey),

    /// The backing file is inconsistent; requires an explicit `clear`
    #[error("Metadata corrupted: {0}")]
    Corrupted(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;
