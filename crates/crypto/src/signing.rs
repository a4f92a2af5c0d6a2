//! Ed25519 signing and verification over raw byte payloads.
//!
//! Verification never fails loudly: malformed keys, malformed signatures,
//! and tampered payloads all yield `false`.

use crate::keys::SecretKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tessel_core::PublicKey;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Detached signature bytes.
///
/// Kept as a byte vector so that malformed signatures received from peers
/// can still be represented and rejected by [`verify`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wrap raw signature bytes without validation.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mutable access, for tests that tamper with signatures.
    pub fn as_mut_bytes(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len().min(4);
        write!(f, "Signature({}..)", hex::encode(&self.0[..n]))
    }
}

/// Sign `payload` with `secret_key`.
pub fn sign(secret_key: &SecretKey, payload: &[u8]) -> Signature {
    let signing_key = SigningKey::from_bytes(secret_key.as_bytes());
    Signature(signing_key.sign(payload).to_bytes().to_vec())
}

/// Check `signature` over `payload` against `public_key`.
pub fn verify(public_key: &PublicKey, payload: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature.0) else {
        return false;
    };
    verifying_key.verify_strict(payload, &signature).is_ok()
}
