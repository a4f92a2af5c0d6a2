//! Error types for invitations.

use tessel_crypto::CryptoError;
use tessel_feed::FeedError;
use tessel_identity::IdentityError;
use tessel_mesh::MeshError;
use tessel_metadata::MetadataError;
use thiserror::Error;

/// Errors that can occur while hosting or accepting an invitation.
#[derive(Debug, Error)]
pub enum InvitationError {
    /// Descriptor hash does not match its fields
    #[error("Invitation descriptor has been tampered with")]
    Tampered,

    /// Descriptor text could not be decoded
    #[error("Invalid invitation descriptor: {0}")]
    InvalidDescriptor(String),

    /// Host refused every code and has no attempts left
    #[error("Too many authentication attempts")]
    TooManyAttempts,

    /// Host refused the admission
    #[error("Admission rejected: {0}")]
    Rejected(String),

    /// No more auth codes will be supplied, or the invitation was cancelled
    #[error("Invitation cancelled")]
    Cancelled,

    /// Gave up waiting
    #[error("Invitation timed out")]
    Timeout,

    /// Peer sent an unexpected message or closed the connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Adapter cannot serve this request
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Identity error
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Network error
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Metadata error
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Key error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Feed error
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Result type for invitation operations.
pub type InvitationResult<T> = Result<T, InvitationError>;
