//! Ed25519 key pairs.

use crate::error::{CryptoError, CryptoResult};
use crate::signing::{self, Signature};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessel_core::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a secret key in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Ed25519 secret seed. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SecretKey([u8; SECRET_KEY_LENGTH]);

impl SecretKey {
    /// Fresh random secret from the OS entropy source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap an existing seed.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, rejecting anything that is not 32 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("secret key of {} bytes", bytes.len())))?;
        Ok(Self(bytes))
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LENGTH] {
        &self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let signing_key = SigningKey::from_bytes(&self.0);
        PublicKey::from_bytes(signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A public key with an optional secret half.
///
/// Peers hold secrets only for keys they own; replicas of remote feeds and
/// remote devices are represented by public-only pairs.
#[derive(Clone, Debug)]
pub struct KeyPair {
    /// Public half, used as the identifier
    pub public_key: PublicKey,
    /// Secret half, present only for locally owned keys
    pub secret_key: Option<SecretKey>,
}

impl KeyPair {
    /// Generate a new key pair from the OS entropy source.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    /// Complete pair from a secret seed.
    pub fn from_secret(secret_key: SecretKey) -> Self {
        Self {
            public_key: secret_key.public_key(),
            secret_key: Some(secret_key),
        }
    }

    /// Public-only pair for a key owned elsewhere.
    pub fn public_only(public_key: PublicKey) -> Self {
        Self {
            public_key,
            secret_key: None,
        }
    }

    /// True if this pair can sign.
    pub fn can_sign(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Sign `payload` with the secret half.
    pub fn sign(&self, payload: &[u8]) -> CryptoResult<Signature> {
        let secret = self
            .secret_key
            .as_ref()
            .ok_or(CryptoError::MissingSecret(self.public_key))?;
        Ok(signing::sign(secret, payload))
    }

    /// Verify `signature` over `payload` against this pair's public key.
    pub fn verify(&self, payload: &[u8], signature: &Signature) -> bool {
        signing::verify(&self.public_key, payload, signature)
    }
}
