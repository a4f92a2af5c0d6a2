//! Host and guest sides of an invitation, per target.
//!
//! The handshake in [`crate::handler`] is the same for every target; what
//! differs is how the host admits a guest and how the guest prepares and
//! completes its side. [`DeviceInvitationProtocol`] admits devices into the
//! host's identity, [`SpaceInvitationProtocol`] admits members into a space.

use crate::descriptor::{InvitationDescriptor, InvitationKind, InvitationTarget};
use crate::error::{InvitationError, InvitationResult};
use crate::messages::{AdmissionRequest, AdmissionResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tessel_core::PublicKey;
use tessel_crypto::Keyring;
use tessel_feed::FeedStore;
use tessel_identity::{IdentityManager, JoinParams, Space};
use tessel_metadata::MetadataStore;
use tokio::sync::Mutex;
use tracing::debug;

/// Keys the host publishes in the descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvitationKeys {
    pub identity_key: Option<PublicKey>,
    pub space_key: Option<PublicKey>,
}

/// Host side of an invitation.
#[async_trait]
pub trait InvitationHost: Send + Sync {
    fn target(&self) -> InvitationTarget;

    /// Keys to publish in a new descriptor.
    async fn invitation_keys(&self) -> InvitationResult<InvitationKeys>;

    /// Admit an authenticated guest.
    async fn admit(&self, request: AdmissionRequest) -> InvitationResult<AdmissionResponse>;
}

/// Guest side of an invitation.
#[async_trait]
pub trait InvitationGuest: Send + Sync {
    fn target(&self) -> InvitationTarget;

    /// Keyring holding the pre-authorized key of offline invitations.
    fn keyring(&self) -> &Arc<Keyring>;

    /// Keys and feeds to ask admission for.
    async fn admission_request(
        &self,
        descriptor: &InvitationDescriptor,
    ) -> InvitationResult<AdmissionRequest>;

    /// Complete the join once admitted.
    async fn accept(
        &self,
        request: AdmissionRequest,
        response: AdmissionResponse,
    ) -> InvitationResult<()>;
}

/// Device invitations: join another device's identity.
pub struct DeviceInvitationProtocol {
    manager: Arc<IdentityManager>,
    feed_store: Arc<FeedStore>,
}

impl DeviceInvitationProtocol {
    pub fn new(manager: Arc<IdentityManager>, feed_store: Arc<FeedStore>) -> Self {
        Self {
            manager,
            feed_store,
        }
    }
}

#[async_trait]
impl InvitationHost for DeviceInvitationProtocol {
    fn target(&self) -> InvitationTarget {
        InvitationTarget::Device
    }

    async fn invitation_keys(&self) -> InvitationResult<InvitationKeys> {
        let record = self
            .manager
            .identity_record()
            .await
            .ok_or_else(|| InvitationError::InvalidState("no identity to invite into".to_string()))?;
        Ok(InvitationKeys {
            identity_key: Some(record.identity_key),
            space_key: None,
        })
    }

    async fn admit(&self, request: AdmissionRequest) -> InvitationResult<AdmissionResponse> {
        let AdmissionRequest::Device {
            device_key,
            control_feed_key,
        } = request
        else {
            return Err(InvitationError::Protocol(
                "space admission on a device invitation".to_string(),
            ));
        };
        let record = self
            .manager
            .identity_record()
            .await
            .ok_or_else(|| InvitationError::InvalidState("no identity".to_string()))?;
        self.manager.admit_device(device_key, control_feed_key).await?;
        Ok(AdmissionResponse::Device {
            identity_key: record.identity_key,
            halo_space_key: record.halo_space_key,
            halo_genesis_feed_key: record.halo_genesis_feed_key,
        })
    }
}

#[async_trait]
impl InvitationGuest for DeviceInvitationProtocol {
    fn target(&self) -> InvitationTarget {
        InvitationTarget::Device
    }

    fn keyring(&self) -> &Arc<Keyring> {
        self.feed_store.keyring()
    }

    async fn admission_request(
        &self,
        descriptor: &InvitationDescriptor,
    ) -> InvitationResult<AdmissionRequest> {
        let device_key = match (descriptor.kind, descriptor.guest_key) {
            (InvitationKind::Offline, Some(key)) => key,
            _ => self.keyring().create_key().await?,
        };
        let control_feed = self.feed_store.create_feed().await?;
        debug!(device = %device_key.fmt_short(), "Prepared device for admission");
        Ok(AdmissionRequest::Device {
            device_key,
            control_feed_key: control_feed.key(),
        })
    }

    async fn accept(
        &self,
        request: AdmissionRequest,
        response: AdmissionResponse,
    ) -> InvitationResult<()> {
        match (request, response) {
            (
                AdmissionRequest::Device {
                    device_key,
                    control_feed_key,
                },
                AdmissionResponse::Device {
                    identity_key,
                    halo_space_key,
                    halo_genesis_feed_key,
                },
            ) => {
                let params = JoinParams {
                    identity_key,
                    halo_space_key,
                    halo_genesis_feed_key,
                };
                self.manager
                    .accept_identity_with_device(params, device_key, control_feed_key)
                    .await?;
                Ok(())
            }
            _ => Err(InvitationError::Protocol(
                "admission response does not match a device invitation".to_string(),
            )),
        }
    }
}

/// Space invitations: become a member of a space.
pub struct SpaceInvitationProtocol {
    feed_store: Arc<FeedStore>,
    metadata: Arc<MetadataStore>,
    member_key: PublicKey,
    space: Mutex<Option<Arc<Space>>>,
}

impl SpaceInvitationProtocol {
    /// Host side for an open space.
    pub fn host(space: Arc<Space>, feed_store: Arc<FeedStore>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            feed_store,
            metadata,
            member_key: space.member_key(),
            space: Mutex::new(Some(space)),
        }
    }

    /// Guest side joining as `member_key`.
    pub fn guest(
        feed_store: Arc<FeedStore>,
        metadata: Arc<MetadataStore>,
        member_key: PublicKey,
    ) -> Self {
        Self {
            feed_store,
            metadata,
            member_key,
            space: Mutex::new(None),
        }
    }

    /// The hosted space, or the joined one once admitted.
    pub async fn space(&self) -> Option<Arc<Space>> {
        self.space.lock().await.clone()
    }
}

#[async_trait]
impl InvitationHost for SpaceInvitationProtocol {
    fn target(&self) -> InvitationTarget {
        InvitationTarget::Space
    }

    async fn invitation_keys(&self) -> InvitationResult<InvitationKeys> {
        let space = self
            .space()
            .await
            .ok_or_else(|| InvitationError::InvalidState("no space to invite into".to_string()))?;
        Ok(InvitationKeys {
            identity_key: None,
            space_key: Some(space.key()),
        })
    }

    async fn admit(&self, request: AdmissionRequest) -> InvitationResult<AdmissionResponse> {
        let AdmissionRequest::Space {
            member_key,
            feed_key,
        } = request
        else {
            return Err(InvitationError::Protocol(
                "device admission on a space invitation".to_string(),
            ));
        };
        let space = self
            .space()
            .await
            .ok_or_else(|| InvitationError::InvalidState("no space".to_string()))?;
        space.admit_member(member_key, feed_key).await?;
        Ok(AdmissionResponse::Space {
            space_key: space.key(),
            genesis_feed_key: space.genesis_feed_key(),
        })
    }
}

#[async_trait]
impl InvitationGuest for SpaceInvitationProtocol {
    fn target(&self) -> InvitationTarget {
        InvitationTarget::Space
    }

    fn keyring(&self) -> &Arc<Keyring> {
        self.feed_store.keyring()
    }

    async fn admission_request(
        &self,
        _descriptor: &InvitationDescriptor,
    ) -> InvitationResult<AdmissionRequest> {
        let feed = self.feed_store.create_feed().await?;
        Ok(AdmissionRequest::Space {
            member_key: self.member_key,
            feed_key: feed.key(),
        })
    }

    async fn accept(
        &self,
        request: AdmissionRequest,
        response: AdmissionResponse,
    ) -> InvitationResult<()> {
        match (request, response) {
            (
                AdmissionRequest::Space { feed_key, .. },
                AdmissionResponse::Space {
                    space_key,
                    genesis_feed_key,
                },
            ) => {
                let space = Space::join_with_feed(
                    self.feed_store.clone(),
                    self.metadata.clone(),
                    space_key,
                    genesis_feed_key,
                    self.member_key,
                    feed_key,
                )
                .await?;
                *self.space.lock().await = Some(Arc::new(space));
                Ok(())
            }
            _ => Err(InvitationError::Protocol(
                "admission response does not match a space invitation".to_string(),
            )),
        }
    }
}
