//! Identity manager: bootstrap, join and admit devices.
//!
//! # State Transitions
//!
//! ```text
//! Uninitialized
//!     ├─ create_identity ──> Bootstrapping ──> Ready
//!     └─ accept_identity ──> Joining ──(own AuthorizedDevice observed)──> Ready
//! ```
//!
//! A device resumed from a persisted identity record starts in `Joining`
//! and moves to `Ready` as soon as replaying the HALO control feeds shows
//! its own authorization.
//!
//! Every device writes credentials into its own control feed of the HALO
//! (the identity's private control space). The bootstrapping device uses the
//! genesis feed; a joining device brings a fresh feed that its admitter
//! authorizes alongside the device key.

use crate::credential::Assertion;
use crate::error::{IdentityError, IdentityResult};
use crate::pipeline::{sync_catalog, ControlPipeline};
use crate::processor::{AuthorizationEvent, AuthorizationState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessel_core::PublicKey;
use tessel_crypto::Keyring;
use tessel_feed::{Feed, FeedOptions, FeedStore};
use tessel_metadata::{IdentityRecord, MetadataStore, SpaceMetadata};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the local identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityState {
    /// No identity on this device
    Uninitialized,
    /// Creating a new identity
    Bootstrapping,
    /// Waiting for another device to admit this one
    Joining,
    /// Admitted; may admit other devices
    Ready,
}

/// Coordinates needed to join an existing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    pub identity_key: PublicKey,
    pub halo_space_key: PublicKey,
    pub halo_genesis_feed_key: PublicKey,
}

impl From<&IdentityRecord> for JoinParams {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            identity_key: record.identity_key,
            halo_space_key: record.halo_space_key,
            halo_genesis_feed_key: record.halo_genesis_feed_key,
        }
    }
}

#[derive(Clone)]
struct Halo {
    record: IdentityRecord,
    pipeline: Arc<ControlPipeline>,
    control_feed: Feed,
}

/// Owns the device's identity and its HALO control pipeline.
pub struct IdentityManager {
    keyring: Arc<Keyring>,
    feed_store: Arc<FeedStore>,
    metadata: Arc<MetadataStore>,
    state: watch::Sender<IdentityState>,
    halo: Mutex<Option<Halo>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("state", &self.state())
            .finish()
    }
}

impl IdentityManager {
    /// Manager over the given stores. Signs with the feed store's keyring.
    pub fn new(feed_store: Arc<FeedStore>, metadata: Arc<MetadataStore>) -> Self {
        let (state, _) = watch::channel(IdentityState::Uninitialized);
        Self {
            keyring: feed_store.keyring().clone(),
            feed_store,
            metadata,
            state,
            halo: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IdentityState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<IdentityState> {
        self.state.subscribe()
    }

    /// Resume the identity persisted in the metadata store, if any.
    pub async fn open(&self) -> IdentityResult<()> {
        self.ensure_open()?;
        let mut halo = self.halo.lock().await;
        if halo.is_some() {
            return Ok(());
        }
        let Some(record) = self.metadata.identity_record().await else {
            debug!("No identity to resume");
            return Ok(());
        };

        let space = match self.metadata.space(&record.halo_space_key).await {
            Some(space) => space,
            None => {
                let space = SpaceMetadata::new(record.halo_space_key, record.halo_genesis_feed_key);
                self.metadata.add_space(space.clone()).await?;
                space
            }
        };

        let pipeline = ControlPipeline::new(
            record.identity_key,
            record.halo_space_key,
            self.feed_store.clone(),
        );
        let mut control_feed = None;
        for key in space.feed_keys() {
            if control_feed.is_none() && self.keyring.has_key(&key).await {
                let feed = self.feed_store.open_feed(key, FeedOptions::writable()).await?;
                pipeline.set_writer(feed.clone()).await?;
                control_feed = Some(feed);
            } else {
                let feed = self.feed_store.open_feed(key, FeedOptions::read_only()).await?;
                pipeline.add_feed(feed).await;
            }
        }
        let Some(control_feed) = control_feed else {
            pipeline.close().await;
            return Err(IdentityError::InvalidState(
                "no writable control feed for this device".to_string(),
            ));
        };

        info!(identity = %record.identity_key.fmt_short(), "Resuming identity");
        self.state.send_replace(IdentityState::Joining);
        *halo = Some(self.install(record, pipeline, control_feed).await);
        Ok(())
    }

    /// Create a new identity with this device as its first member.
    pub async fn create_identity(&self) -> IdentityResult<IdentityRecord> {
        self.ensure_open()?;
        let mut halo = self.halo.lock().await;
        self.ensure_uninitialized(&halo).await?;

        self.state.send_replace(IdentityState::Bootstrapping);
        match self.bootstrap().await {
            Ok(installed) => {
                let record = installed.record;
                *halo = Some(installed);
                self.state.send_replace(IdentityState::Ready);
                info!(identity = %record.identity_key.fmt_short(), "Identity created");
                Ok(record)
            }
            Err(e) => {
                warn!("Identity bootstrap failed: {}", e);
                self.state.send_replace(IdentityState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn bootstrap(&self) -> IdentityResult<Halo> {
        let identity_key = self.keyring.create_key().await?;
        let device_key = self.keyring.create_key().await?;
        let halo_space_key = self.keyring.create_key().await?;
        let genesis = self.feed_store.create_feed().await?;
        let record = IdentityRecord {
            identity_key,
            device_key,
            halo_space_key,
            halo_genesis_feed_key: genesis.key(),
        };

        let pipeline = ControlPipeline::new(identity_key, halo_space_key, self.feed_store.clone());
        let result = async {
            pipeline.set_writer(genesis.clone()).await?;
            pipeline
                .write_credential(
                    identity_key,
                    Assertion::AuthorizedDevice {
                        identity_key,
                        device_key,
                    },
                )
                .await?;
            pipeline
                .write_credential(
                    device_key,
                    Assertion::AuthorizedFeed {
                        space_key: halo_space_key,
                        feed_key: genesis.key(),
                    },
                )
                .await?;

            self.metadata
                .add_space(SpaceMetadata::new(halo_space_key, genesis.key()))
                .await?;
            self.metadata.set_identity_record(record).await?;

            pipeline
                .wait_until(|s| s.is_device_authorized(&device_key))
                .await?;
            Ok::<_, IdentityError>(())
        }
        .await;

        if let Err(e) = result {
            pipeline.close().await;
            return Err(e);
        }
        Ok(self.install(record, pipeline, genesis).await)
    }

    /// Join an existing identity with a fresh device key and control feed.
    ///
    /// Returns once the join is recorded; use [`ready`](Self::ready) to wait
    /// for admission.
    pub async fn accept_identity(&self, params: JoinParams) -> IdentityResult<IdentityRecord> {
        self.ensure_open()?;
        {
            let halo = self.halo.lock().await;
            self.ensure_uninitialized(&halo).await?;
        }
        let device_key = self.keyring.create_key().await?;
        let control_feed = self.feed_store.create_feed().await?;
        self.accept_identity_with_device(params, device_key, control_feed.key())
            .await
    }

    /// Join an existing identity using a device key and control feed that
    /// were prepared earlier, e.g. during an invitation handshake. Both
    /// secrets must be in the keyring.
    pub async fn accept_identity_with_device(
        &self,
        params: JoinParams,
        device_key: PublicKey,
        control_feed_key: PublicKey,
    ) -> IdentityResult<IdentityRecord> {
        self.ensure_open()?;
        let mut halo = self.halo.lock().await;
        self.ensure_uninitialized(&halo).await?;
        if !self.keyring.has_key(&device_key).await {
            return Err(IdentityError::InvalidState(format!(
                "device key {} is not in the keyring",
                device_key.fmt_short()
            )));
        }
        let control_feed = self
            .feed_store
            .open_feed(control_feed_key, FeedOptions::writable())
            .await?;

        self.state.send_replace(IdentityState::Joining);
        let record = IdentityRecord {
            identity_key: params.identity_key,
            device_key,
            halo_space_key: params.halo_space_key,
            halo_genesis_feed_key: params.halo_genesis_feed_key,
        };

        let pipeline = ControlPipeline::new(
            params.identity_key,
            params.halo_space_key,
            self.feed_store.clone(),
        );
        let result = async {
            let genesis = self
                .feed_store
                .open_feed(params.halo_genesis_feed_key, FeedOptions::read_only())
                .await?;
            pipeline.add_feed(genesis).await;
            pipeline.set_writer(control_feed.clone()).await?;

            let mut space = SpaceMetadata::new(params.halo_space_key, params.halo_genesis_feed_key);
            space.additional_feed_keys.push(control_feed_key);
            self.metadata.add_space(space).await?;
            self.metadata.set_identity_record(record).await?;
            Ok::<_, IdentityError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(
                    identity = %record.identity_key.fmt_short(),
                    device = %device_key.fmt_short(),
                    "Joining identity"
                );
                *halo = Some(self.install(record, pipeline, control_feed).await);
                Ok(record)
            }
            Err(e) => {
                pipeline.close().await;
                self.state.send_replace(IdentityState::Uninitialized);
                Err(e)
            }
        }
    }

    /// Start background work for an installed HALO: catalog sync and the
    /// transition to `Ready` once this device's authorization is observed.
    async fn install(
        &self,
        record: IdentityRecord,
        pipeline: Arc<ControlPipeline>,
        control_feed: Feed,
    ) -> Halo {
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(sync_catalog(
            pipeline.clone(),
            self.metadata.clone(),
            record.halo_space_key,
            self.cancel.child_token(),
        ));

        if self.state() != IdentityState::Ready {
            let waiter = pipeline.clone();
            let state = self.state.clone();
            tasks.spawn(async move {
                let device_key = record.device_key;
                if waiter
                    .wait_until(|s| s.is_device_authorized(&device_key))
                    .await
                    .is_ok()
                {
                    info!(device = %device_key.fmt_short(), "Device admitted");
                    state.send_replace(IdentityState::Ready);
                }
            });
        }

        Halo {
            record,
            pipeline,
            control_feed,
        }
    }

    /// Suspend until this device is admitted. No internal timeout; fails
    /// only if the manager is closed first.
    pub async fn ready(&self) -> IdentityResult<()> {
        let mut state = self.state.subscribe();
        tokio::select! {
            result = state.wait_for(|s| *s == IdentityState::Ready) => {
                result.map(|_| ()).map_err(|_| IdentityError::Closed)
            }
            _ = self.cancel.cancelled() => Err(IdentityError::Closed),
        }
    }

    /// Authorize another device and its control feed. Requires `Ready`.
    pub async fn admit_device(
        &self,
        device_key: PublicKey,
        control_feed_key: PublicKey,
    ) -> IdentityResult<()> {
        self.ensure_open()?;
        if self.state() != IdentityState::Ready {
            return Err(IdentityError::NotReady(
                "device must be admitted before admitting others".to_string(),
            ));
        }
        let halo = self.halo().await?;
        let issuer = halo.record.device_key;
        halo.pipeline
            .write_credential(
                issuer,
                Assertion::AuthorizedDevice {
                    identity_key: halo.record.identity_key,
                    device_key,
                },
            )
            .await?;
        halo.pipeline
            .write_credential(
                issuer,
                Assertion::AuthorizedFeed {
                    space_key: halo.record.halo_space_key,
                    feed_key: control_feed_key,
                },
            )
            .await?;
        info!(device = %device_key.fmt_short(), "Admitted device");
        Ok(())
    }

    async fn halo(&self) -> IdentityResult<Halo> {
        self.halo
            .lock()
            .await
            .clone()
            .ok_or_else(|| IdentityError::NotReady("no identity".to_string()))
    }

    /// The identity record, once created, joined or resumed.
    pub async fn identity_record(&self) -> Option<IdentityRecord> {
        self.halo.lock().await.as_ref().map(|h| h.record)
    }

    /// The HALO control pipeline.
    pub async fn pipeline(&self) -> Option<Arc<ControlPipeline>> {
        self.halo.lock().await.as_ref().map(|h| h.pipeline.clone())
    }

    /// This device's writable control feed.
    pub async fn control_feed(&self) -> Option<Feed> {
        self.halo.lock().await.as_ref().map(|h| h.control_feed.clone())
    }

    /// Every HALO feed currently being processed.
    pub async fn control_feeds(&self) -> Vec<Feed> {
        match self.pipeline().await {
            Some(pipeline) => pipeline.feeds().await,
            None => Vec::new(),
        }
    }

    /// Receive each HALO feed as it starts being processed.
    pub async fn subscribe_feeds(&self) -> Option<broadcast::Receiver<Feed>> {
        self.pipeline().await.map(|p| p.subscribe_feeds())
    }

    /// Receive HALO authorization events.
    pub async fn subscribe_events(&self) -> Option<broadcast::Receiver<AuthorizationEvent>> {
        self.pipeline().await.map(|p| p.subscribe_events())
    }

    /// Snapshot of HALO authorization.
    pub async fn authorization_state(&self) -> Option<AuthorizationState> {
        self.pipeline().await.map(|p| p.state())
    }

    /// Stop processing. Idempotent. Feeds stay open; closing the feed store
    /// is the owner's job.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let halo = self.halo.lock().await.clone();
        if let Some(halo) = halo {
            let timeframe = halo.pipeline.timeframe();
            if let Err(e) = self
                .metadata
                .set_space_control_timeframe(&halo.record.halo_space_key, &timeframe)
                .await
            {
                warn!("Failed to persist HALO timeframe: {}", e);
            }
            halo.pipeline.close().await;
        }
        self.tasks.lock().await.shutdown().await;
        debug!("Identity manager closed");
    }

    fn ensure_open(&self) -> IdentityResult<()> {
        if self.cancel.is_cancelled() {
            Err(IdentityError::Closed)
        } else {
            Ok(())
        }
    }

    async fn ensure_uninitialized(&self, halo: &Option<Halo>) -> IdentityResult<()> {
        if let Some(existing) = halo {
            return Err(IdentityError::AlreadyExists(format!(
                "identity {}",
                existing.record.identity_key
            )));
        }
        if let Some(existing) = self.metadata.identity_record().await {
            return Err(IdentityError::AlreadyExists(format!(
                "identity {}",
                existing.identity_key
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Credential, FeedMessage};
    use futures::StreamExt;
    use std::time::Duration;
    use tessel_core::{Directory, MemoryDirectory};
    use tessel_crypto::KeyPair;
    use tessel_feed::InsertOutcome;

    struct Device {
        storage: MemoryDirectory,
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        manager: IdentityManager,
    }

    async fn device_with(storage: MemoryDirectory, keyring: Arc<Keyring>) -> Device {
        let feed_store = Arc::new(FeedStore::new(storage.sub_directory("feeds"), keyring));
        let metadata = Arc::new(MetadataStore::new(storage.sub_directory("metadata")));
        metadata.load().await.unwrap();
        let manager = IdentityManager::new(feed_store.clone(), metadata.clone());
        Device {
            storage,
            feed_store,
            metadata,
            manager,
        }
    }

    async fn device() -> Device {
        device_with(MemoryDirectory::new(), Arc::new(Keyring::new())).await
    }

    /// Copy every entry of every feed `from` has into `to`, once.
    async fn replicate(from: &Device, to: &Device) {
        for feed in from.feed_store.feeds().await {
            let Some(target) = to.feed_store.get_feed(&feed.key()).await else {
                continue;
            };
            for entry in feed.range(0, feed.length()).await {
                target.insert_replicated(entry).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_bootstrap() {
        let device = device().await;
        assert_eq!(device.manager.state(), IdentityState::Uninitialized);

        let record = device.manager.create_identity().await.unwrap();
        assert_eq!(device.manager.state(), IdentityState::Ready);
        device.manager.ready().await.unwrap();

        let state = device.manager.authorization_state().await.unwrap();
        assert!(state.is_device_authorized(&record.device_key));
        assert!(state.is_feed_admitted(&record.halo_genesis_feed_key));
        assert_eq!(device.metadata.identity_record().await, Some(record));

        // First entry is the identity-signed device credential.
        let genesis = device.manager.control_feed().await.unwrap();
        let first = genesis.get(0).await.unwrap();
        match FeedMessage::decode(&first.payload).unwrap() {
            FeedMessage::Credential(c) => {
                assert_eq!(c.issuer, record.identity_key);
                assert_eq!(c.subject, record.device_key);
            }
            other => panic!("unexpected first entry: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_identity_rejected() {
        let device = device().await;
        device.manager.create_identity().await.unwrap();
        assert!(matches!(
            device.manager.create_identity().await,
            Err(IdentityError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_join_after_create_leaves_no_trace() {
        let host = device().await;
        let record = host.manager.create_identity().await.unwrap();
        let other = device().await;
        let other_record = other.manager.create_identity().await.unwrap();

        let keys = other.feed_store.keyring().public_keys().await.len();
        let feeds = other.feed_store.feeds().await.len();
        assert!(matches!(
            other.manager.accept_identity(JoinParams::from(&record)).await,
            Err(IdentityError::AlreadyExists(_))
        ));
        assert_eq!(other.feed_store.keyring().public_keys().await.len(), keys);
        assert_eq!(other.feed_store.feeds().await.len(), feeds);
        assert_eq!(other.manager.state(), IdentityState::Ready);
        assert_eq!(other.metadata.identity_record().await, Some(other_record));
    }

    #[tokio::test]
    async fn test_admit_requires_ready() {
        let device = device().await;
        let result = device
            .manager
            .admit_device(KeyPair::generate().public_key, KeyPair::generate().public_key)
            .await;
        assert!(matches!(result, Err(IdentityError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_join_blocks_until_admitted() {
        let host = device().await;
        let record = host.manager.create_identity().await.unwrap();

        let guest = device().await;
        let guest_record = guest
            .manager
            .accept_identity(JoinParams::from(&record))
            .await
            .unwrap();
        assert_eq!(guest.manager.state(), IdentityState::Joining);
        assert!(matches!(
            guest.manager.admit_device(KeyPair::generate().public_key, KeyPair::generate().public_key).await,
            Err(IdentityError::NotReady(_))
        ));

        // Only the host's own history: the guest is not named anywhere.
        replicate(&host, &guest).await;
        let pending = tokio::time::timeout(Duration::from_millis(100), guest.manager.ready()).await;
        assert!(pending.is_err());

        let guest_feed = guest.manager.control_feed().await.unwrap().key();
        host.manager
            .admit_device(guest_record.device_key, guest_feed)
            .await
            .unwrap();
        replicate(&host, &guest).await;

        tokio::time::timeout(Duration::from_secs(5), guest.manager.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guest.manager.state(), IdentityState::Ready);
    }

    #[tokio::test]
    async fn test_forged_admission_does_not_resolve_ready() {
        let host = device().await;
        let record = host.manager.create_identity().await.unwrap();
        let guest = device().await;
        let guest_record = guest
            .manager
            .accept_identity(JoinParams::from(&record))
            .await
            .unwrap();
        replicate(&host, &guest).await;

        // An outsider authorizes the guest. Correctly signed, but the
        // outsider was never admitted, so the guest must keep waiting.
        let outsider = KeyPair::generate();
        let forged = Credential::issue_with(
            &outsider,
            Assertion::AuthorizedDevice {
                identity_key: record.identity_key,
                device_key: guest_record.device_key,
            },
        )
        .unwrap();
        let own_feed = guest.manager.control_feed().await.unwrap();
        own_feed
            .append(FeedMessage::Credential(forged).encode().unwrap())
            .await
            .unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(150), guest.manager.ready()).await;
        assert!(pending.is_err());
        let state = guest.manager.authorization_state().await.unwrap();
        assert!(!state.is_device_authorized(&guest_record.device_key));
        assert_eq!(state.held, 1);
    }

    #[tokio::test]
    async fn test_tampered_replicated_credential_ignored() {
        let host = device().await;
        let record = host.manager.create_identity().await.unwrap();
        let guest = device().await;
        guest
            .manager
            .accept_identity(JoinParams::from(&record))
            .await
            .unwrap();

        let genesis = host.manager.control_feed().await.unwrap();
        let mut entry = genesis.get(0).await.unwrap();
        entry.signature.as_mut_bytes()[5] ^= 0x10;
        let replica = guest
            .feed_store
            .get_feed(&record.halo_genesis_feed_key)
            .await
            .unwrap();
        assert_eq!(
            replica.insert_replicated(entry).await.unwrap(),
            InsertOutcome::Rejected
        );
        assert_eq!(replica.length(), 0);
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let storage = MemoryDirectory::new();
        let keyring = Arc::new(Keyring::new());
        let record = {
            let device = device_with(storage.clone(), keyring.clone()).await;
            let record = device.manager.create_identity().await.unwrap();
            device.manager.close().await;
            device.manager.close().await;
            device.feed_store.close().await;
            record
        };

        let device = device_with(storage, keyring).await;
        device.manager.open().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), device.manager.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.manager.identity_record().await, Some(record));
        assert!(device.storage.sub_directory("feeds").list().await.unwrap().len() >= 1);
        assert!(matches!(
            device.manager.create_identity().await,
            Err(IdentityError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_fails_after_close() {
        let device = device().await;
        device.manager.close().await;
        assert!(matches!(
            device.manager.ready().await,
            Err(IdentityError::Closed)
        ));
        assert!(matches!(
            device.manager.create_identity().await,
            Err(IdentityError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_control_feed_entries_are_credentials() {
        let device = device().await;
        device.manager.create_identity().await.unwrap();
        let feed = device.manager.control_feed().await.unwrap();
        let entries: Vec<_> = feed.read_from(0).take(2).collect().await;
        assert!(entries
            .iter()
            .all(|e| matches!(FeedMessage::decode(&e.payload), Ok(FeedMessage::Credential(_)))));
    }
}
