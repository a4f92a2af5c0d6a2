//! Configuration management for Tessel.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub keyring: KeyringConfig,
    pub replication: ReplicationConfig,
    pub invitation: InvitationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist to `data_root` instead of keeping everything in memory.
    pub persistent: bool,
    pub data_root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    pub encrypt_at_rest: bool,
    /// Required when `encrypt_at_rest` is set.
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Largest protocol frame accepted from a peer, in bytes.
    pub max_message_size: usize,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    /// Host gives up if no guest completes within this window.
    pub timeout_ms: u64,
    pub auth_code_length: usize,
    pub max_auth_attempts: u32,
    /// Lifetime of persisted invitations.
    pub expiry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            data_root: PathBuf::from(".tessel"),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5 * 60 * 1000,
            auth_code_length: 6,
            max_auth_attempts: 3,
            expiry_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            #[cfg(feature = "toml")]
            _ => Ok(toml::from_str(&content)?),
            #[cfg(not(feature = "toml"))]
            _ => anyhow::bail!("unsupported config format: {}", path.display()),
        }
    }

    /// In-memory defaults suitable for tests and embedding.
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Filesystem-backed defaults rooted at `data_root`.
    pub fn persistent<P: Into<PathBuf>>(data_root: P) -> Self {
        Self {
            storage: StorageConfig {
                persistent: true,
                data_root: data_root.into(),
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default_config();
        assert!(!config.storage.persistent);
        assert_eq!(config.invitation.max_auth_attempts, 3);
        assert_eq!(config.invitation.auth_code_length, 6);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_partial_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tessel.toml");
        std::fs::write(
            &path,
            "[storage]\npersistent = true\ndata_root = \"/var/lib/tessel\"\n\n[invitation]\nmax_auth_attempts = 5\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.storage.persistent);
        assert_eq!(config.storage.data_root, PathBuf::from("/var/lib/tessel"));
        assert_eq!(config.invitation.max_auth_attempts, 5);
        assert_eq!(config.invitation.auth_code_length, 6);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_json_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tessel.json");
        std::fs::write(&path, r#"{"logging": {"json": true}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.logging.json);
        assert!(!config.storage.persistent);
    }
}
