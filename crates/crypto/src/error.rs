//! Error types for key custody and signing.

use tessel_core::{PublicKey, StorageError};
use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The keyring holds no key pair for this public key
    #[error("Key not found: {0}")]
    KeyNotFound(PublicKey),

    /// The key pair is public-only and cannot sign
    #[error("No secret key available for {0}")]
    MissingSecret(PublicKey),

    /// Malformed key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption at rest was requested without a passphrase
    #[error("Keyring encryption enabled but no passphrase configured")]
    MissingPassphrase,

    /// Sealing a secret failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// A stored secret could not be opened (wrong passphrase or tampered file)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Persisted key could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
