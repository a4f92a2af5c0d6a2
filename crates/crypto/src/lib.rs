//! Cryptographic primitives for Tessel.
//!
//! # Core Capabilities
//!
//! - **Key Pairs**: Ed25519 key generation with zeroized secret halves
//! - **Signatures**: sign byte payloads and verify them without ever failing loudly
//! - **Keyring**: serialized key custody with optional encryption at rest
//! - **Passcodes**: short numeric codes for interactive invitations
//!
//! # Security Principles
//!
//! - Secrets never leave the keyring except through [`KeyPair`] values the caller created
//! - [`verify`] returns `false` for any malformed input instead of erroring
//! - Encrypted keyrings use ChaCha20-Poly1305 with a BLAKE3-derived key

pub mod cipher;
pub mod error;
pub mod keyring;
pub mod keys;
pub mod passcode;
pub mod signing;

pub use cipher::SecretCipher;
pub use error::{CryptoError, CryptoResult};
pub use keyring::Keyring;
pub use keys::{KeyPair, SecretKey};
pub use passcode::generate_passcode;
pub use signing::{sign, verify, Signature};
pub use tessel_core::PublicKey;
