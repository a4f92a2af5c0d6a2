//! Error types for identity and space control operations.

use tessel_crypto::CryptoError;
use tessel_feed::FeedError;
use tessel_metadata::MetadataError;
use thiserror::Error;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// An identity record or space already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires the device to be admitted first
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The manager or pipeline has been closed
    #[error("Closed")]
    Closed,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Feed error
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Metadata error
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Key custody error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Credential encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
