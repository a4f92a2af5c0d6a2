//! Error types for feed operations.

use tessel_core::{PublicKey, StorageError};
use tessel_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Append attempted without the feed's secret key
    #[error("Permission denied: no secret key for feed {0}")]
    PermissionDenied(PublicKey),

    /// The feed has been closed
    #[error("Feed closed: {0}")]
    Closed(PublicKey),

    /// The store has been closed
    #[error("Feed store closed")]
    StoreClosed,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Entry encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Signing error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
