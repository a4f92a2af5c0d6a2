//! Error types for Tessel mesh operations.
//!
//! Covers framing, the authenticated session handshake and replication.
//! Verification failures of individual entries are not errors here; they
//! are logged and the session continues.

use tessel_core::PublicKey;
use tessel_crypto::CryptoError;
use tessel_feed::FeedError;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Frame larger than the configured limit
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared or encoded frame length
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Handshake failed; the peer never counts as connected
    #[error("Handshake with {peer} failed: {reason}")]
    Handshake {
        /// Expected remote peer
        peer: PublicKey,
        /// What went wrong
        reason: String,
    },

    /// Peer sent a message that makes no sense at this point
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The protocol has been stopped
    #[error("Protocol stopped")]
    Stopped,

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Feed error
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Signing error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
