//! Control pipeline: feeds in, authorization state out.
//!
//! A pipeline reads every admitted feed of one space (or HALO) from the
//! start, decodes credential entries, and feeds them to a
//! [`CredentialProcessor`]. When a credential admits a new feed, the
//! pipeline opens it read-only and starts reading it too. A pipeline may
//! own one writable feed into which the local device writes credentials
//! and data.

use crate::credential::{Assertion, Credential, FeedMessage};
use crate::error::{IdentityError, IdentityResult};
use crate::processor::{AuthorizationEvent, AuthorizationState, CredentialProcessor};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tessel_core::{PublicKey, Timeframe};
use tessel_feed::{Feed, FeedEntry, FeedOptions, FeedStore};
use tessel_metadata::MetadataStore;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const FEED_CHANNEL_CAPACITY: usize = 64;

/// Reads control feeds into a credential processor.
pub struct ControlPipeline {
    root: PublicKey,
    scope: PublicKey,
    feed_store: Arc<FeedStore>,
    processor: Mutex<CredentialProcessor>,
    state: watch::Receiver<AuthorizationState>,
    events: broadcast::Receiver<AuthorizationEvent>,
    timeframe: watch::Sender<Timeframe>,
    feeds: Mutex<HashMap<PublicKey, Feed>>,
    feed_added: broadcast::Sender<Feed>,
    writer: Mutex<Option<Feed>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    this: Weak<Self>,
}

impl std::fmt::Debug for ControlPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPipeline")
            .field("root", &self.root)
            .field("scope", &self.scope)
            .finish()
    }
}

impl ControlPipeline {
    /// Pipeline trusting `root`, admitting feeds named under `scope`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(root: PublicKey, scope: PublicKey, feed_store: Arc<FeedStore>) -> Arc<Self> {
        let processor = CredentialProcessor::new(root, scope);
        let state = processor.subscribe_state();
        let events = processor.subscribe_events();
        let (timeframe, _) = watch::channel(Timeframe::new());
        let (feed_added, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let pipeline = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            root,
            scope,
            feed_store,
            processor: Mutex::new(processor),
            state: state.clone(),
            events,
            timeframe,
            feeds: Mutex::new(HashMap::new()),
            feed_added,
            writer: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
            cancel: cancel.clone(),
            this: weak.clone(),
        });
        // Nothing else can hold the lock before `new` returns.
        if let Ok(mut tasks) = pipeline.tasks.try_lock() {
            tasks.spawn(follow_admitted_feeds(
                Arc::downgrade(&pipeline),
                state,
                cancel,
            ));
        }
        pipeline
    }

    /// Trust anchor.
    pub fn root(&self) -> PublicKey {
        self.root
    }

    /// Space key feeds are admitted under.
    pub fn scope(&self) -> PublicKey {
        self.scope
    }

    /// Current authorization snapshot.
    pub fn state(&self) -> AuthorizationState {
        self.state.borrow().clone()
    }

    /// Watch the authorization state.
    pub fn subscribe_state(&self) -> watch::Receiver<AuthorizationState> {
        self.state.clone()
    }

    /// Receive an event per accepted credential from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthorizationEvent> {
        self.events.resubscribe()
    }

    /// Receive every feed the pipeline starts reading from now on.
    pub fn subscribe_feeds(&self) -> broadcast::Receiver<Feed> {
        self.feed_added.subscribe()
    }

    /// Highest processed seq per feed.
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe.borrow().clone()
    }

    /// Feeds currently being read.
    pub async fn feeds(&self) -> Vec<Feed> {
        self.feeds.lock().await.values().cloned().collect()
    }

    /// The local writable feed, if set.
    pub async fn writer(&self) -> Option<Feed> {
        self.writer.lock().await.clone()
    }

    /// Use `feed` for local writes and start reading it.
    pub async fn set_writer(&self, feed: Feed) -> IdentityResult<()> {
        if !feed.is_writable() {
            return Err(IdentityError::InvalidState(format!(
                "feed {} is not writable",
                feed.key().fmt_short()
            )));
        }
        *self.writer.lock().await = Some(feed.clone());
        self.add_feed(feed).await;
        Ok(())
    }

    /// Start reading `feed` from its first entry. Already added feeds are
    /// ignored.
    pub async fn add_feed(&self, feed: Feed) {
        if self.cancel.is_cancelled() {
            return;
        }
        let key = feed.key();
        {
            let mut feeds = self.feeds.lock().await;
            if feeds.contains_key(&key) {
                return;
            }
            feeds.insert(key, feed.clone());
        }
        debug!(root = %self.root.fmt_short(), feed = %key.fmt_short(), "Reading control feed");
        let _ = self.feed_added.send(feed.clone());

        let reader = read_feed(self.this.clone(), feed, self.cancel.child_token());
        self.tasks.lock().await.spawn(reader);
    }

    /// Issue `assertion` as `issuer` and append it to the writable feed.
    pub async fn write_credential(
        &self,
        issuer: PublicKey,
        assertion: Assertion,
    ) -> IdentityResult<u64> {
        let credential =
            Credential::issue(self.feed_store.keyring(), issuer, assertion).await?;
        self.write(FeedMessage::Credential(credential)).await
    }

    /// Append an opaque data payload to the writable feed.
    pub async fn write_data(&self, payload: Vec<u8>) -> IdentityResult<u64> {
        self.write(FeedMessage::Data(payload)).await
    }

    async fn write(&self, message: FeedMessage) -> IdentityResult<u64> {
        let writer = self
            .writer
            .lock()
            .await
            .clone()
            .ok_or_else(|| IdentityError::InvalidState("no writable feed".to_string()))?;
        Ok(writer.append(message.encode()?).await?)
    }

    /// Suspend until `predicate` holds for the authorization state.
    ///
    /// There is no internal timeout; fails only if the pipeline closes.
    pub async fn wait_until<F>(&self, mut predicate: F) -> IdentityResult<AuthorizationState>
    where
        F: FnMut(&AuthorizationState) -> bool,
    {
        let mut state = self.state.clone();
        tokio::select! {
            result = state.wait_for(|s| predicate(s)) => match result {
                Ok(s) => Ok((*s).clone()),
                Err(_) => Err(IdentityError::Closed),
            },
            _ = self.cancel.cancelled() => Err(IdentityError::Closed),
        }
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop reading. Idempotent; feeds stay open in the store.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.tasks.lock().await.shutdown().await;
        debug!(root = %self.root.fmt_short(), "Control pipeline closed");
    }

    async fn process_entry(&self, feed: PublicKey, entry: FeedEntry) {
        match FeedMessage::decode(&entry.payload) {
            Ok(FeedMessage::Credential(credential)) => {
                let outcome = self.processor.lock().await.process(credential);
                trace!(feed = %feed.fmt_short(), seq = entry.seq, ?outcome, "Processed credential");
            }
            Ok(FeedMessage::Data(_)) => {}
            Err(e) => {
                warn!(feed = %feed.fmt_short(), seq = entry.seq, "Skipping undecodable entry: {}", e);
            }
        }
        self.timeframe.send_modify(|tf| {
            tf.set(feed, entry.seq);
        });
    }
}

/// Keeps the metadata catalog entry for `space_key` in step with the feeds
/// the pipeline reads. Runs until `cancel` fires.
pub(crate) async fn sync_catalog(
    pipeline: Arc<ControlPipeline>,
    metadata: Arc<MetadataStore>,
    space_key: PublicKey,
    cancel: CancellationToken,
) {
    let mut added = pipeline.subscribe_feeds();
    let record = |key: PublicKey| {
        let metadata = metadata.clone();
        async move {
            if let Err(e) = metadata.add_space_feed(&space_key, key).await {
                warn!(space = %space_key.fmt_short(), feed = %key.fmt_short(), "Failed to record feed: {}", e);
            }
        }
    };

    for feed in pipeline.feeds().await {
        record(feed.key()).await;
    }
    loop {
        let next = tokio::select! {
            next = added.recv() => next,
            _ = cancel.cancelled() => return,
        };
        match next {
            Ok(feed) => record(feed.key()).await,
            Err(broadcast::error::RecvError::Lagged(_)) => {
                for feed in pipeline.feeds().await {
                    record(feed.key()).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Processes one feed's entries in order until cancelled or the feed closes.
async fn read_feed(pipeline: Weak<ControlPipeline>, feed: Feed, cancel: CancellationToken) {
    let key = feed.key();
    let mut entries = Box::pin(feed.read_from(0));
    loop {
        let entry = tokio::select! {
            entry = entries.next() => entry,
            _ = cancel.cancelled() => return,
        };
        let Some(entry) = entry else {
            debug!(feed = %key.fmt_short(), "Control feed ended");
            return;
        };
        let Some(this) = pipeline.upgrade() else {
            return;
        };
        this.process_entry(key, entry).await;
    }
}

/// Opens and reads feeds as credentials admit them.
async fn follow_admitted_feeds(
    pipeline: Weak<ControlPipeline>,
    mut state: watch::Receiver<AuthorizationState>,
    cancel: CancellationToken,
) {
    loop {
        let admitted: Vec<PublicKey> = state.borrow_and_update().feeds.iter().copied().collect();
        let Some(this) = pipeline.upgrade() else {
            return;
        };
        for key in admitted {
            if this.feeds.lock().await.contains_key(&key) {
                continue;
            }
            match this.feed_store.open_feed(key, FeedOptions::read_only()).await {
                Ok(feed) => this.add_feed(feed).await,
                Err(e) => warn!(feed = %key.fmt_short(), "Failed to open admitted feed: {}", e),
            }
        }
        drop(this);

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::MemoryDirectory;
    use tessel_crypto::Keyring;

    fn feed_store() -> Arc<FeedStore> {
        Arc::new(FeedStore::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(Keyring::new()),
        ))
    }

    #[tokio::test]
    async fn test_follows_admitted_feeds() {
        let store = feed_store();
        let keyring = store.keyring().clone();
        let identity = keyring.create_key().await.unwrap();
        let device = keyring.create_key().await.unwrap();
        let second_device = keyring.create_key().await.unwrap();

        let genesis = store.create_feed().await.unwrap();
        let second_feed = store.create_feed().await.unwrap();

        // A credential in a feed that is not admitted yet.
        second_feed
            .append(
                FeedMessage::Credential(
                    Credential::issue(
                        &keyring,
                        device,
                        Assertion::AuthorizedDevice {
                            identity_key: identity,
                            device_key: second_device,
                        },
                    )
                    .await
                    .unwrap(),
                )
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();

        let pipeline = ControlPipeline::new(identity, identity, store.clone());
        pipeline.set_writer(genesis.clone()).await.unwrap();
        pipeline
            .write_credential(
                identity,
                Assertion::AuthorizedDevice {
                    identity_key: identity,
                    device_key: device,
                },
            )
            .await
            .unwrap();
        pipeline
            .write_credential(
                device,
                Assertion::AuthorizedFeed {
                    space_key: identity,
                    feed_key: second_feed.key(),
                },
            )
            .await
            .unwrap();

        let state = pipeline
            .wait_until(|s| s.is_device_authorized(&second_device))
            .await
            .unwrap();
        assert!(state.is_feed_admitted(&second_feed.key()));
        assert_eq!(pipeline.feeds().await.len(), 2);

        pipeline.close().await;
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_data_entries_are_skipped() {
        let store = feed_store();
        let keyring = store.keyring().clone();
        let identity = keyring.create_key().await.unwrap();
        let genesis = store.create_feed().await.unwrap();

        let pipeline = ControlPipeline::new(identity, identity, store.clone());
        pipeline.set_writer(genesis.clone()).await.unwrap();
        pipeline.write_data(b"opaque".to_vec()).await.unwrap();
        genesis.append(b"not a message".to_vec()).await.unwrap();
        pipeline
            .write_credential(
                identity,
                Assertion::AuthorizedDevice {
                    identity_key: identity,
                    device_key: identity,
                },
            )
            .await
            .unwrap();

        let state = pipeline.wait_until(|s| s.credentials == 1).await.unwrap();
        assert!(state.is_device_authorized(&identity));
        assert!(pipeline.timeframe().get(&genesis.key()) >= Some(1));
    }

    #[tokio::test]
    async fn test_wait_fails_on_close() {
        let store = feed_store();
        let root = store.keyring().create_key().await.unwrap();
        let pipeline = ControlPipeline::new(root, root, store);

        let waiter = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.wait_until(|s| s.credentials > 0).await })
        };
        tokio::task::yield_now().await;
        pipeline.close().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(IdentityError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_without_writer() {
        let store = feed_store();
        let root = store.keyring().create_key().await.unwrap();
        let pipeline = ControlPipeline::new(root, root, store);
        assert!(matches!(
            pipeline.write_data(vec![1]).await,
            Err(IdentityError::InvalidState(_))
        ));
    }
}
