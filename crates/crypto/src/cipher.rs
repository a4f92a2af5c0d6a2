//! Passphrase-based sealing of secrets at rest.

use crate::error::{CryptoError, CryptoResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

const KEY_CONTEXT: &str = "tessel 2024-01-01 keyring secret encryption";

/// Authenticated encryption for stored key material.
///
/// The cipher key is derived from a passphrase with BLAKE3 `derive_key`.
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    /// Derive a cipher from `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes());
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key));
        Self { cipher }
    }

    /// Encrypt `plaintext`, returning `(ciphertext, nonce)`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<(Vec<u8>, [u8; NONCE_SIZE])> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt and authenticate.
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}
