//! Keyring: custody of local key pairs.
//!
//! The keyring creates key pairs, holds their secret halves, and signs on
//! their behalf. All mutations are serialized behind a single async mutex.
//! When opened over a storage directory, every key is written to its own
//! file named by the hex public key, optionally sealed with a
//! passphrase-derived cipher.

use crate::cipher::{SecretCipher, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, SecretKey};
use crate::signing::{self, Signature};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tessel_core::config::KeyringConfig;
use tessel_core::{Directory, PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk form of one key.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    public_key: PublicKey,
    /// Raw seed, or ciphertext when `nonce` is set
    secret: Vec<u8>,
    nonce: Option<[u8; NONCE_SIZE]>,
}

/// Local key custody.
#[derive(Debug)]
pub struct Keyring {
    keys: Mutex<HashMap<PublicKey, KeyPair>>,
    storage: Option<Arc<dyn Directory>>,
    cipher: Option<SecretCipher>,
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyring {
    /// Memory-only keyring.
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            storage: None,
            cipher: None,
        }
    }

    /// Open a persistent keyring over `storage`, loading any stored keys.
    pub async fn open(storage: Arc<dyn Directory>, config: &KeyringConfig) -> CryptoResult<Self> {
        let cipher = if config.encrypt_at_rest {
            let passphrase = config
                .passphrase
                .as_deref()
                .ok_or(CryptoError::MissingPassphrase)?;
            Some(SecretCipher::from_passphrase(passphrase))
        } else {
            None
        };

        let mut keys = HashMap::new();
        for name in storage.list().await? {
            let Ok(expected) = PublicKey::from_hex(&name) else {
                debug!(file = %name, "Skipping non-key file in keyring storage");
                continue;
            };
            let bytes = storage.file(&name).await?.read_all().await?;
            let stored: StoredKey = postcard::from_bytes(&bytes)?;
            let secret = match (&stored.nonce, &cipher) {
                (Some(nonce), Some(cipher)) => cipher.open(&stored.secret, nonce)?,
                (None, _) => stored.secret.clone(),
                (Some(_), None) => return Err(CryptoError::MissingPassphrase),
            };
            let pair = KeyPair::from_secret(SecretKey::try_from_slice(&secret)?);
            if pair.public_key != expected || pair.public_key != stored.public_key {
                return Err(CryptoError::InvalidKey(format!(
                    "stored secret does not match key {}",
                    expected.fmt_short()
                )));
            }
            keys.insert(pair.public_key, pair);
        }

        info!(keys = keys.len(), encrypted = cipher.is_some(), "Keyring opened");
        Ok(Self {
            keys: Mutex::new(keys),
            storage: Some(storage),
            cipher,
        })
    }

    /// Generate and store a new key pair, returning its public key.
    pub async fn create_key(&self) -> CryptoResult<PublicKey> {
        let pair = KeyPair::generate();
        let public_key = pair.public_key;
        self.import_key_pair(pair).await?;
        debug!(key = %public_key.fmt_short(), "Created key");
        Ok(public_key)
    }

    /// Add an existing complete key pair.
    pub async fn import_key_pair(&self, pair: KeyPair) -> CryptoResult<()> {
        let secret = pair
            .secret_key
            .as_ref()
            .ok_or(CryptoError::MissingSecret(pair.public_key))?;
        let mut keys = self.keys.lock().await;
        self.persist(&pair.public_key, secret).await?;
        keys.insert(pair.public_key, pair);
        Ok(())
    }

    async fn persist(&self, public_key: &PublicKey, secret: &SecretKey) -> CryptoResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let stored = match &self.cipher {
            Some(cipher) => {
                let (ciphertext, nonce) = cipher.seal(secret.as_bytes())?;
                StoredKey {
                    public_key: *public_key,
                    secret: ciphertext,
                    nonce: Some(nonce),
                }
            }
            None => StoredKey {
                public_key: *public_key,
                secret: secret.as_bytes().to_vec(),
                nonce: None,
            },
        };
        let bytes = postcard::to_stdvec(&stored)?;
        let file = storage.file(&public_key.to_hex()).await?;
        file.truncate(0).await?;
        file.write(0, &bytes).await?;
        Ok(())
    }

    /// True if a secret is held for `public_key`.
    pub async fn has_key(&self, public_key: &PublicKey) -> bool {
        self.keys.lock().await.contains_key(public_key)
    }

    /// All public keys held.
    pub async fn public_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.keys.lock().await.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Sign `payload` with the secret for `public_key`.
    pub async fn sign(&self, public_key: &PublicKey, payload: &[u8]) -> CryptoResult<Signature> {
        let keys = self.keys.lock().await;
        let pair = keys
            .get(public_key)
            .ok_or(CryptoError::KeyNotFound(*public_key))?;
        pair.sign(payload)
    }

    /// Remove a key from memory and storage.
    pub async fn delete_key(&self, public_key: &PublicKey) -> CryptoResult<()> {
        let mut keys = self.keys.lock().await;
        if keys.remove(public_key).is_none() {
            warn!(key = %public_key.fmt_short(), "Delete of unknown key");
            return Err(CryptoError::KeyNotFound(*public_key));
        }
        if let Some(storage) = &self.storage {
            storage.file(&public_key.to_hex()).await?.delete().await?;
        }
        Ok(())
    }

    /// Verify a signature. Never errors; malformed input yields `false`.
    pub fn verify(public_key: &PublicKey, payload: &[u8], signature: &Signature) -> bool {
        signing::verify(public_key, payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::MemoryDirectory;

    fn encrypted(passphrase: &str) -> KeyringConfig {
        KeyringConfig {
            encrypt_at_rest: true,
            passphrase: Some(passphrase.to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_and_sign() {
        let keyring = Keyring::new();
        let key = keyring.create_key().await.unwrap();
        assert!(keyring.has_key(&key).await);

        let sig = keyring.sign(&key, b"hello").await.unwrap();
        assert!(Keyring::verify(&key, b"hello", &sig));
        assert!(!Keyring::verify(&key, b"hullo", &sig));
    }

    #[tokio::test]
    async fn test_sign_unknown_key() {
        let keyring = Keyring::new();
        let stranger = KeyPair::generate().public_key;
        assert!(matches!(
            keyring.sign(&stranger, b"x").await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_keys_reload() {
        let storage = MemoryDirectory::new();
        let key = {
            let keyring = Keyring::open(Arc::new(storage.clone()), &KeyringConfig::default())
                .await
                .unwrap();
            keyring.create_key().await.unwrap()
        };

        let reopened = Keyring::open(Arc::new(storage), &KeyringConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.public_keys().await, vec![key]);
        let sig = reopened.sign(&key, b"after restart").await.unwrap();
        assert!(Keyring::verify(&key, b"after restart", &sig));
    }

    #[tokio::test]
    async fn test_encrypted_keyring() {
        let storage = MemoryDirectory::new();
        let key = {
            let keyring = Keyring::open(Arc::new(storage.clone()), &encrypted("hunter2"))
                .await
                .unwrap();
            keyring.create_key().await.unwrap()
        };

        let raw = storage.file(&key.to_hex()).await.unwrap().read_all().await.unwrap();
        let stored: StoredKey = postcard::from_bytes(&raw).unwrap();
        assert!(stored.nonce.is_some());

        let reopened = Keyring::open(Arc::new(storage.clone()), &encrypted("hunter2"))
            .await
            .unwrap();
        assert!(reopened.has_key(&key).await);

        let wrong = Keyring::open(Arc::new(storage.clone()), &encrypted("hunter3")).await;
        assert!(matches!(wrong, Err(CryptoError::Decryption(_))));

        let plain = Keyring::open(Arc::new(storage), &KeyringConfig::default()).await;
        assert!(matches!(plain, Err(CryptoError::MissingPassphrase)));
    }

    #[tokio::test]
    async fn test_missing_passphrase() {
        let config = KeyringConfig {
            encrypt_at_rest: true,
            passphrase: None,
        };
        let result = Keyring::open(Arc::new(MemoryDirectory::new()), &config).await;
        assert!(matches!(result, Err(CryptoError::MissingPassphrase)));
    }

    #[tokio::test]
    async fn test_delete_key() {
        let storage = MemoryDirectory::new();
        let keyring = Keyring::open(Arc::new(storage.clone()), &KeyringConfig::default())
            .await
            .unwrap();
        let key = keyring.create_key().await.unwrap();
        keyring.delete_key(&key).await.unwrap();
        assert!(!keyring.has_key(&key).await);
        assert!(storage.list().await.unwrap().is_empty());
    }
}
