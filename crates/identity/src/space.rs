//! Spaces: shared, replicated collections of feeds with their own members.
//!
//! The space key is the trust root of its control pipeline. On creation
//! it signs the creator in as the first member and admits the genesis feed;
//! after that only members admit members. Each member writes through its own
//! feed, so a space always has one writable feed per local member.

use crate::credential::{Assertion, FeedMessage};
use crate::error::{IdentityError, IdentityResult};
use crate::pipeline::{sync_catalog, ControlPipeline};
use crate::processor::AuthorizationState;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tessel_core::{PublicKey, Timeframe};
use tessel_feed::{Feed, FeedOptions, FeedStore};
use tessel_metadata::{MetadataStore, SpaceMetadata};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADMIT_GRACE: Duration = Duration::from_millis(500);

/// One space as seen from this device.
pub struct Space {
    key: PublicKey,
    genesis_feed_key: PublicKey,
    member_key: PublicKey,
    pipeline: Arc<ControlPipeline>,
    metadata: Arc<MetadataStore>,
    data_feed: Feed,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("key", &self.key)
            .field("member_key", &self.member_key)
            .finish()
    }
}

impl Space {
    /// Create a new space with `member_key` as its first member.
    ///
    /// `member_key` must be in the feed store's keyring.
    pub async fn create(
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        member_key: PublicKey,
    ) -> IdentityResult<Self> {
        let keyring = feed_store.keyring().clone();
        if !keyring.has_key(&member_key).await {
            return Err(IdentityError::InvalidState(format!(
                "member key {} is not in the keyring",
                member_key.fmt_short()
            )));
        }
        let space_key = keyring.create_key().await?;
        let genesis = feed_store.create_feed().await?;

        let pipeline = ControlPipeline::new(space_key, space_key, feed_store);
        pipeline.set_writer(genesis.clone()).await?;
        pipeline
            .write_credential(
                space_key,
                Assertion::SpaceMember {
                    space_key,
                    member_key,
                },
            )
            .await?;
        pipeline
            .write_credential(
                space_key,
                Assertion::AuthorizedFeed {
                    space_key,
                    feed_key: genesis.key(),
                },
            )
            .await?;
        let genesis_key = genesis.key();
        if let Err(e) = pipeline
            .wait_until(|s| s.is_member(&member_key) && s.is_feed_admitted(&genesis_key))
            .await
        {
            pipeline.close().await;
            return Err(e);
        }
        metadata
            .add_space(SpaceMetadata::new(space_key, genesis_key))
            .await?;

        info!(space = %space_key.fmt_short(), "Space created");
        Ok(Self::install(space_key, genesis.key(), member_key, pipeline, metadata, genesis))
    }

    /// Join an existing space with a fresh writable feed.
    pub async fn join(
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        space_key: PublicKey,
        genesis_feed_key: PublicKey,
        member_key: PublicKey,
    ) -> IdentityResult<Self> {
        let feed = feed_store.create_feed().await?;
        Self::join_with_feed(
            feed_store,
            metadata,
            space_key,
            genesis_feed_key,
            member_key,
            feed.key(),
        )
        .await
    }

    /// Join an existing space writing through `feed_key`, whose secret the
    /// keyring holds. The space is usable immediately but this member is
    /// only recognized after an existing member admits it.
    pub async fn join_with_feed(
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        space_key: PublicKey,
        genesis_feed_key: PublicKey,
        member_key: PublicKey,
        feed_key: PublicKey,
    ) -> IdentityResult<Self> {
        if metadata.has_space(&space_key).await {
            return Err(IdentityError::AlreadyExists(format!("space {}", space_key)));
        }
        let own = feed_store.open_feed(feed_key, FeedOptions::writable()).await?;
        let genesis = feed_store
            .open_feed(genesis_feed_key, FeedOptions::read_only())
            .await?;

        let pipeline = ControlPipeline::new(space_key, space_key, feed_store);
        pipeline.add_feed(genesis).await;
        pipeline.set_writer(own.clone()).await?;

        let mut record = SpaceMetadata::new(space_key, genesis_feed_key);
        record.additional_feed_keys.push(feed_key);
        metadata.add_space(record).await?;

        info!(space = %space_key.fmt_short(), member = %member_key.fmt_short(), "Joined space");
        Ok(Self::install(space_key, genesis_feed_key, member_key, pipeline, metadata, own))
    }

    /// Reopen a space from its catalog entry.
    pub async fn open(
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        record: SpaceMetadata,
        member_key: PublicKey,
    ) -> IdentityResult<Self> {
        let keyring = feed_store.keyring().clone();
        let pipeline = ControlPipeline::new(record.key, record.key, feed_store.clone());
        let mut writer = None;
        for key in record.feed_keys() {
            if writer.is_none() && keyring.has_key(&key).await {
                let feed = feed_store.open_feed(key, FeedOptions::writable()).await?;
                pipeline.set_writer(feed.clone()).await?;
                writer = Some(feed);
            } else {
                let feed = feed_store.open_feed(key, FeedOptions::read_only()).await?;
                pipeline.add_feed(feed).await;
            }
        }
        let Some(writer) = writer else {
            pipeline.close().await;
            return Err(IdentityError::InvalidState(format!(
                "no writable feed for space {}",
                record.key.fmt_short()
            )));
        };
        debug!(space = %record.key.fmt_short(), "Space opened");
        Ok(Self::install(
            record.key,
            record.genesis_feed_key,
            member_key,
            pipeline,
            metadata,
            writer,
        ))
    }

    fn install(
        key: PublicKey,
        genesis_feed_key: PublicKey,
        member_key: PublicKey,
        pipeline: Arc<ControlPipeline>,
        metadata: Arc<MetadataStore>,
        data_feed: Feed,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(sync_catalog(
            pipeline.clone(),
            metadata.clone(),
            key,
            cancel.child_token(),
        ));
        Self {
            key,
            genesis_feed_key,
            member_key,
            pipeline,
            metadata,
            data_feed,
            tasks: Mutex::new(tasks),
            cancel,
        }
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn genesis_feed_key(&self) -> PublicKey {
        self.genesis_feed_key
    }

    /// Local member key.
    pub fn member_key(&self) -> PublicKey {
        self.member_key
    }

    /// This member's writable feed.
    pub fn data_feed(&self) -> &Feed {
        &self.data_feed
    }

    pub fn pipeline(&self) -> &Arc<ControlPipeline> {
        &self.pipeline
    }

    /// Authorization snapshot for this space.
    pub fn state(&self) -> AuthorizationState {
        self.pipeline.state()
    }

    /// Every feed of the space currently being read.
    pub async fn feeds(&self) -> Vec<Feed> {
        self.pipeline.feeds().await
    }

    /// Receive each space feed as it starts being read.
    pub fn subscribe_feeds(&self) -> broadcast::Receiver<Feed> {
        self.pipeline.subscribe_feeds()
    }

    /// Suspend until the local member is admitted.
    pub async fn ready(&self) -> IdentityResult<()> {
        let member = self.member_key;
        self.pipeline.wait_until(|s| s.is_member(&member)).await?;
        Ok(())
    }

    /// Admit another member and the feed it writes through.
    ///
    /// A local member still being replayed gets a short grace period before
    /// the call fails with `NotReady`.
    pub async fn admit_member(
        &self,
        member_key: PublicKey,
        feed_key: PublicKey,
    ) -> IdentityResult<()> {
        let local = self.member_key;
        let recognized =
            tokio::time::timeout(ADMIT_GRACE, self.pipeline.wait_until(|s| s.is_member(&local)))
                .await;
        if !matches!(recognized, Ok(Ok(_))) {
            return Err(IdentityError::NotReady(format!(
                "not a member of space {}",
                self.key.fmt_short()
            )));
        }
        self.pipeline
            .write_credential(
                self.member_key,
                Assertion::SpaceMember {
                    space_key: self.key,
                    member_key,
                },
            )
            .await?;
        self.pipeline
            .write_credential(
                self.member_key,
                Assertion::AuthorizedFeed {
                    space_key: self.key,
                    feed_key,
                },
            )
            .await?;
        info!(space = %self.key.fmt_short(), member = %member_key.fmt_short(), "Admitted member");
        Ok(())
    }

    /// Append an application payload to this member's feed.
    pub async fn write_data(&self, payload: Vec<u8>) -> IdentityResult<u64> {
        self.pipeline.write_data(payload).await
    }

    /// Application payloads of one feed as `(seq, payload)`, starting at
    /// `start` and following new entries. Credentials are skipped.
    pub async fn read_data(
        &self,
        feed_key: &PublicKey,
        start: u64,
    ) -> IdentityResult<impl Stream<Item = (u64, Vec<u8>)> + Send + 'static> {
        let feed = self
            .pipeline
            .feeds()
            .await
            .into_iter()
            .find(|f| f.key() == *feed_key)
            .ok_or_else(|| {
                IdentityError::InvalidState(format!(
                    "feed {} is not part of space {}",
                    feed_key.fmt_short(),
                    self.key.fmt_short()
                ))
            })?;
        Ok(feed.read_from(start).filter_map(|entry| async move {
            match FeedMessage::decode(&entry.payload) {
                Ok(FeedMessage::Data(payload)) => Some((entry.seq, payload)),
                _ => None,
            }
        }))
    }

    /// Record how far the consuming layer has read.
    pub async fn set_data_timeframe(&self, timeframe: &Timeframe) -> IdentityResult<()> {
        self.metadata
            .set_space_data_timeframe(&self.key, timeframe)
            .await?;
        Ok(())
    }

    /// Stop processing and persist control progress. Idempotent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self
            .metadata
            .set_space_control_timeframe(&self.key, &self.pipeline.timeframe())
            .await
        {
            warn!(space = %self.key.fmt_short(), "Failed to persist timeframe: {}", e);
        }
        self.pipeline.close().await;
        self.tasks.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{Directory, MemoryDirectory};
    use tessel_crypto::Keyring;

    struct Peer {
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        member: PublicKey,
    }

    async fn peer_with(
        storage: MemoryDirectory,
        keyring: Arc<Keyring>,
        member: Option<PublicKey>,
    ) -> Peer {
        let feed_store = Arc::new(FeedStore::new(storage.sub_directory("feeds"), keyring.clone()));
        let metadata = Arc::new(MetadataStore::new(storage.sub_directory("metadata")));
        metadata.load().await.unwrap();
        let member = match member {
            Some(key) => key,
            None => keyring.create_key().await.unwrap(),
        };
        Peer {
            feed_store,
            metadata,
            member,
        }
    }

    async fn peer() -> Peer {
        peer_with(MemoryDirectory::new(), Arc::new(Keyring::new()), None).await
    }

    async fn replicate(from: &Space, to: &Space) {
        for feed in from.feeds().await {
            let Some(target) = to.feeds().await.into_iter().find(|f| f.key() == feed.key()) else {
                continue;
            };
            for entry in feed.range(0, feed.length()).await {
                target.insert_replicated(entry).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_create_space() {
        let peer = peer().await;
        let space = Space::create(peer.feed_store.clone(), peer.metadata.clone(), peer.member)
            .await
            .unwrap();
        space.ready().await.unwrap();

        let state = space.state();
        assert!(state.is_member(&peer.member));
        assert!(state.is_feed_admitted(&space.genesis_feed_key()));
        assert!(peer.metadata.has_space(&space.key()).await);
        space.close().await;
    }

    #[tokio::test]
    async fn test_member_admission() {
        let alice = peer().await;
        let bob = peer().await;
        let alice_space = Space::create(alice.feed_store.clone(), alice.metadata.clone(), alice.member)
            .await
            .unwrap();
        let bob_space = Space::join(
            bob.feed_store.clone(),
            bob.metadata.clone(),
            alice_space.key(),
            alice_space.genesis_feed_key(),
            bob.member,
        )
        .await
        .unwrap();

        assert!(matches!(
            bob_space.admit_member(alice.member, alice.member).await,
            Err(IdentityError::NotReady(_))
        ));

        alice_space
            .admit_member(bob.member, bob_space.data_feed().key())
            .await
            .unwrap();
        replicate(&alice_space, &bob_space).await;

        tokio::time::timeout(Duration::from_secs(5), bob_space.ready())
            .await
            .unwrap()
            .unwrap();
        assert!(bob_space.state().is_feed_admitted(&bob_space.data_feed().key()));
    }

    #[tokio::test]
    async fn test_creator_admits_right_after_create() {
        let alice = peer().await;
        let space = Space::create(alice.feed_store.clone(), alice.metadata.clone(), alice.member)
            .await
            .unwrap();
        // Genesis credentials are already processed when create returns.
        assert!(space.state().is_member(&alice.member));

        let newcomer = tessel_crypto::KeyPair::generate().public_key;
        let feed = tessel_crypto::KeyPair::generate().public_key;
        space.admit_member(newcomer, feed).await.unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            space.pipeline().wait_until(|s| s.is_member(&newcomer)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(state.is_feed_admitted(&feed));
        space.close().await;
    }

    #[tokio::test]
    async fn test_read_data_skips_credentials() {
        let peer = peer().await;
        let space = Space::create(peer.feed_store.clone(), peer.metadata.clone(), peer.member)
            .await
            .unwrap();
        space.write_data(b"first".to_vec()).await.unwrap();
        space.write_data(b"second".to_vec()).await.unwrap();

        let items: Vec<_> = space
            .read_data(&space.genesis_feed_key(), 0)
            .await
            .unwrap()
            .take(2)
            .collect()
            .await;
        assert_eq!(
            items,
            vec![(2, b"first".to_vec()), (3, b"second".to_vec())]
        );

        let unknown = tessel_crypto::KeyPair::generate().public_key;
        assert!(space.read_data(&unknown, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_from_catalog() {
        let storage = MemoryDirectory::new();
        let keyring = Arc::new(Keyring::new());
        let (key, member) = {
            let peer = peer_with(storage.clone(), keyring.clone(), None).await;
            let space = Space::create(peer.feed_store.clone(), peer.metadata.clone(), peer.member)
                .await
                .unwrap();
            space.ready().await.unwrap();
            space.write_data(b"kept".to_vec()).await.unwrap();
            space.close().await;
            peer.feed_store.close().await;
            (space.key(), peer.member)
        };

        let peer = peer_with(storage, keyring, Some(member)).await;
        let record = peer.metadata.space(&key).await.unwrap();
        let space = Space::open(peer.feed_store.clone(), peer.metadata.clone(), record, peer.member)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), space.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(space.data_feed().length(), 3);
    }

    #[tokio::test]
    async fn test_join_twice_rejected() {
        let alice = peer().await;
        let space = Space::create(alice.feed_store.clone(), alice.metadata.clone(), alice.member)
            .await
            .unwrap();
        let again = Space::join(
            alice.feed_store.clone(),
            alice.metadata.clone(),
            space.key(),
            space.genesis_feed_key(),
            alice.member,
        )
        .await;
        assert!(matches!(again, Err(IdentityError::AlreadyExists(_))));
    }
}
