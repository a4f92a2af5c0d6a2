//! Service context: one device's stores, identity and replication.
//!
//! Everything is built from the [`Config`] and network handed to
//! [`ServiceContext::open`]; there is no global state, so several contexts
//! can live in one process (the integration tests run a handful on one
//! in-memory network).
//!
//! # Storage Layout
//!
//! ```text
//! <root>/keyring/    key pairs
//! <root>/feeds/      one sub-directory per feed
//! <root>/metadata/   space catalog and identity record
//! ```

use crate::replication::Replication;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tessel_core::{create_storage, Config, PublicKey};
use tessel_crypto::Keyring;
use tessel_feed::FeedStore;
use tessel_identity::{IdentityManager, IdentityState, Space};
use tessel_invitation::{
    DeviceInvitationProtocol, HostInvitation, InvitationDescriptor, InvitationOptions,
    InvitationsHandler, SpaceInvitationProtocol,
};
use tessel_mesh::{NetworkManager, SpaceProtocol};
use tessel_metadata::{IdentityRecord, MetadataStore};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct OpenSpace {
    space: Arc<Space>,
    replication: Replication,
}

/// A device's running Tessel stack.
pub struct ServiceContext {
    config: Config,
    network: Arc<dyn NetworkManager>,
    keyring: Arc<Keyring>,
    feed_store: Arc<FeedStore>,
    metadata: Arc<MetadataStore>,
    identity: Arc<IdentityManager>,
    invitations: InvitationsHandler,
    halo: Mutex<Option<Replication>>,
    spaces: Mutex<HashMap<PublicKey, OpenSpace>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("identity", &self.identity.state())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl ServiceContext {
    /// Open every component and resume a persisted identity and its spaces.
    pub async fn open(config: Config, network: Arc<dyn NetworkManager>) -> Result<Self> {
        let storage = create_storage(&config.storage);
        let keyring = Keyring::open(storage.sub_directory("keyring"), &config.keyring)
            .await
            .context("failed to open keyring")?;
        let keyring = Arc::new(keyring);
        let feed_store = Arc::new(FeedStore::new(storage.sub_directory("feeds"), keyring.clone()));
        let metadata = Arc::new(MetadataStore::new(storage.sub_directory("metadata")));
        metadata.load().await.context("failed to load metadata")?;

        let identity = Arc::new(IdentityManager::new(feed_store.clone(), metadata.clone()));
        identity.open().await.context("failed to resume identity")?;

        let invitations =
            InvitationsHandler::new(network.clone(), config.invitation.clone(), &config.replication)
                .with_metadata(metadata.clone());

        let context = Self {
            config,
            network,
            keyring,
            feed_store,
            metadata,
            identity,
            invitations,
            halo: Mutex::new(None),
            spaces: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        };
        if let Some(record) = context.identity.identity_record().await {
            context.start_halo().await?;
            context.resume_spaces(&record).await?;
        }
        info!(
            persistent = context.config.storage.persistent,
            state = ?context.identity.state(),
            "Service context opened"
        );
        Ok(context)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            bail!("service context is closed");
        }
        Ok(())
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn feed_store(&self) -> &Arc<FeedStore> {
        &self.feed_store
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    pub fn invitations(&self) -> &InvitationsHandler {
        &self.invitations
    }

    /// Bootstrap a new identity on this device.
    pub async fn create_identity(&self) -> Result<IdentityRecord> {
        self.ensure_open()?;
        let record = self.identity.create_identity().await?;
        self.start_halo().await?;
        Ok(record)
    }

    pub async fn identity_record(&self) -> Option<IdentityRecord> {
        self.identity.identity_record().await
    }

    /// Suspend until this device is admitted to its identity.
    pub async fn ready(&self) -> Result<()> {
        self.identity.ready().await?;
        Ok(())
    }

    /// Invite another device into this identity.
    pub async fn create_device_invitation(
        &self,
        options: InvitationOptions,
    ) -> Result<HostInvitation> {
        self.ensure_open()?;
        if self.identity.state() != IdentityState::Ready {
            bail!("identity is not ready to admit devices");
        }
        let host = Arc::new(DeviceInvitationProtocol::new(
            self.identity.clone(),
            self.feed_store.clone(),
        ));
        Ok(self.invitations.create_invitation(host, options).await?)
    }

    /// Join the identity that issued `descriptor`. Returns once admitted by
    /// the host; [`ServiceContext::ready`] resolves after the admission has
    /// replicated back.
    pub async fn accept_device_invitation(
        &self,
        descriptor: &InvitationDescriptor,
        codes: mpsc::Receiver<String>,
    ) -> Result<IdentityRecord> {
        self.ensure_open()?;
        let guest = DeviceInvitationProtocol::new(self.identity.clone(), self.feed_store.clone());
        self.invitations
            .accept_invitation(&guest, descriptor, codes)
            .await
            .context("device invitation failed")?;
        self.start_halo().await?;
        self.identity
            .identity_record()
            .await
            .ok_or_else(|| anyhow!("identity missing after admission"))
    }

    /// Create a space with this device as its first member.
    pub async fn create_space(&self) -> Result<Arc<Space>> {
        self.ensure_open()?;
        let member = self.device_key().await?;
        let space = Space::create(self.feed_store.clone(), self.metadata.clone(), member).await?;
        self.register_space(Arc::new(space)).await
    }

    /// Invite a member into one of this device's spaces.
    pub async fn create_space_invitation(
        &self,
        space_key: &PublicKey,
        options: InvitationOptions,
    ) -> Result<HostInvitation> {
        self.ensure_open()?;
        let space = self
            .space(space_key)
            .await
            .ok_or_else(|| anyhow!("unknown space {}", space_key.fmt_short()))?;
        let host = Arc::new(SpaceInvitationProtocol::host(
            space,
            self.feed_store.clone(),
            self.metadata.clone(),
        ));
        Ok(self.invitations.create_invitation(host, options).await?)
    }

    /// Join a space as this device.
    pub async fn accept_space_invitation(
        &self,
        descriptor: &InvitationDescriptor,
        codes: mpsc::Receiver<String>,
    ) -> Result<Arc<Space>> {
        self.ensure_open()?;
        let member = self.device_key().await?;
        let guest =
            SpaceInvitationProtocol::guest(self.feed_store.clone(), self.metadata.clone(), member);
        self.invitations
            .accept_invitation(&guest, descriptor, codes)
            .await
            .context("space invitation failed")?;
        let space = guest
            .space()
            .await
            .ok_or_else(|| anyhow!("space missing after admission"))?;
        self.register_space(space).await
    }

    pub async fn space(&self, key: &PublicKey) -> Option<Arc<Space>> {
        self.spaces.lock().await.get(key).map(|open| open.space.clone())
    }

    pub async fn spaces(&self) -> Vec<Arc<Space>> {
        self.spaces
            .lock()
            .await
            .values()
            .map(|open| open.space.clone())
            .collect()
    }

    /// Protocol replicating the HALO control feeds, once there is an identity.
    pub async fn halo_protocol(&self) -> Option<Arc<SpaceProtocol>> {
        self.halo.lock().await.as_ref().map(|r| r.protocol().clone())
    }

    /// Protocol replicating one space.
    pub async fn space_protocol(&self, key: &PublicKey) -> Option<Arc<SpaceProtocol>> {
        self.spaces
            .lock()
            .await
            .get(key)
            .map(|open| open.replication.protocol().clone())
    }

    /// Stop replication, then close the identity, spaces and feed store.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let spaces: Vec<OpenSpace> = self.spaces.lock().await.drain().map(|(_, s)| s).collect();
        for open in spaces {
            open.replication.stop().await;
            open.space.close().await;
        }
        if let Some(halo) = self.halo.lock().await.take() {
            halo.stop().await;
        }
        self.identity.close().await;
        self.feed_store.close().await;
        info!("Service context closed");
    }

    async fn device_key(&self) -> Result<PublicKey> {
        self.identity
            .identity_record()
            .await
            .map(|record| record.device_key)
            .ok_or_else(|| anyhow!("no identity on this device"))
    }

    async fn start_halo(&self) -> Result<()> {
        let mut halo = self.halo.lock().await;
        if halo.is_some() {
            return Ok(());
        }
        let (Some(record), Some(pipeline)) = (
            self.identity.identity_record().await,
            self.identity.pipeline().await,
        ) else {
            bail!("no identity to replicate");
        };
        let local = self.identity.control_feed().await.into_iter().collect();
        let replication = Replication::start(
            record.halo_space_key,
            record.device_key,
            pipeline,
            local,
            self.keyring.clone(),
            self.network.clone(),
            self.config.replication.clone(),
        )
        .await
        .context("failed to start HALO replication")?;
        *halo = Some(replication);
        Ok(())
    }

    async fn resume_spaces(&self, record: &IdentityRecord) -> Result<()> {
        for entry in self.metadata.spaces().await {
            if entry.key == record.halo_space_key {
                continue;
            }
            let key = entry.key;
            match Space::open(
                self.feed_store.clone(),
                self.metadata.clone(),
                entry,
                record.device_key,
            )
            .await
            {
                Ok(space) => {
                    self.register_space(Arc::new(space)).await?;
                }
                Err(e) => warn!(space = %key.fmt_short(), "Failed to reopen space: {}", e),
            }
        }
        Ok(())
    }

    async fn register_space(&self, space: Arc<Space>) -> Result<Arc<Space>> {
        let mut spaces = self.spaces.lock().await;
        if let Some(open) = spaces.get(&space.key()) {
            return Ok(open.space.clone());
        }
        let replication = Replication::start(
            space.key(),
            space.member_key(),
            space.pipeline().clone(),
            vec![space.data_feed().clone()],
            self.keyring.clone(),
            self.network.clone(),
            self.config.replication.clone(),
        )
        .await
        .with_context(|| format!("failed to replicate space {}", space.key().fmt_short()))?;
        info!(space = %space.key().fmt_short(), "Space opened");
        spaces.insert(
            space.key(),
            OpenSpace {
                space: space.clone(),
                replication,
            },
        );
        Ok(space)
    }
}
