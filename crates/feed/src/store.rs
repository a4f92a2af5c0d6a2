//! Feed store: the set of feeds known to this peer.
//!
//! Feeds are opened by key. Concurrent opens of the same key share one
//! [`Feed`] and one underlying storage file; handles are reference counted
//! through `Arc`, and the store keeps its own handle until it is closed.

use crate::error::{FeedError, FeedResult};
use crate::feed::Feed;
use std::collections::HashMap;
use std::sync::Arc;
use tessel_core::{Directory, PublicKey};
use tessel_crypto::Keyring;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Options for [`FeedStore::open_feed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedOptions {
    /// Require the secret key so the feed can be appended to
    pub writable: bool,
}

impl FeedOptions {
    /// Writable feed options.
    pub fn writable() -> Self {
        Self { writable: true }
    }

    /// Read-only replica options.
    pub fn read_only() -> Self {
        Self { writable: false }
    }
}

#[derive(Default)]
struct StoreState {
    feeds: HashMap<PublicKey, Feed>,
    closed: bool,
}

/// Owns every feed's storage.
pub struct FeedStore {
    directory: Arc<dyn Directory>,
    keyring: Arc<Keyring>,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for FeedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStore")
            .field("directory", &self.directory.path())
            .finish()
    }
}

impl FeedStore {
    /// Store over `directory`, signing with keys from `keyring`.
    pub fn new(directory: Arc<dyn Directory>, keyring: Arc<Keyring>) -> Self {
        Self {
            directory,
            keyring,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// The keyring feeds are signed with.
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Open the feed for `key`, loading it from storage on first use.
    ///
    /// Reopening returns the same logical feed. Opening writable requires
    /// the keyring to hold the feed's secret key and upgrades an existing
    /// read-only handle.
    pub async fn open_feed(&self, key: PublicKey, options: FeedOptions) -> FeedResult<Feed> {
        if options.writable && !self.keyring.has_key(&key).await {
            return Err(FeedError::PermissionDenied(key));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FeedError::StoreClosed);
        }
        if let Some(feed) = state.feeds.get(&key) {
            if options.writable && !feed.is_writable() {
                debug!(feed = %key.fmt_short(), "Upgrading feed to writable");
                feed.set_writable();
            }
            return Ok(feed.clone());
        }

        let file = self.directory.file(&key.to_hex()).await?;
        let feed = Feed::load(key, file, self.keyring.clone(), options.writable).await?;
        state.feeds.insert(key, feed.clone());
        Ok(feed)
    }

    /// Create a key pair and open a new writable feed for it.
    pub async fn create_feed(&self) -> FeedResult<Feed> {
        let key = self.keyring.create_key().await?;
        self.open_feed(key, FeedOptions::writable()).await
    }

    /// An already opened feed.
    pub async fn get_feed(&self, key: &PublicKey) -> Option<Feed> {
        self.state.lock().await.feeds.get(key).cloned()
    }

    /// All opened feeds.
    pub async fn feeds(&self) -> Vec<Feed> {
        self.state.lock().await.feeds.values().cloned().collect()
    }

    /// Keys of feeds persisted in storage, opened or not.
    pub async fn stored_keys(&self) -> FeedResult<Vec<PublicKey>> {
        Ok(self
            .directory
            .list()
            .await?
            .iter()
            .filter_map(|name| PublicKey::from_hex(name).ok())
            .collect())
    }

    /// Close and remove a feed's local storage.
    pub async fn delete_feed(&self, key: &PublicKey) -> FeedResult<()> {
        let feed = self.state.lock().await.feeds.remove(key);
        match feed {
            Some(feed) => {
                feed.close().await;
                feed.delete_storage().await?;
            }
            None => self.directory.file(&key.to_hex()).await?.delete().await?,
        }
        info!(feed = %key.fmt_short(), "Feed deleted");
        Ok(())
    }

    /// Close every feed. In-flight appends finish first; live readers end.
    /// Idempotent.
    pub async fn close(&self) {
        let feeds = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.feeds.values().cloned().collect::<Vec<_>>()
        };
        for feed in &feeds {
            feed.close().await;
        }
        info!(feeds = feeds.len(), "Feed store closed");
    }
}
