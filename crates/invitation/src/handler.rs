//! Invitation handshake over the network seam.
//!
//! # Host State Transitions
//!
//! ```text
//! Connecting ──> Connected ──> ReadyForAuthentication <──> Authenticating
//!     ^              │                                          │
//!     └── guest left ┘                                          v
//!                                                            Success
//!
//! any state ──> Cancelled | Timeout | Error
//! ```
//!
//! The host joins the swarm named in the descriptor and serves guests one
//! connection at a time until one is admitted. Failed auth attempts count
//! across connections, so reconnecting does not reset the budget.

use crate::descriptor::{InvitationDescriptor, InvitationKind};
use crate::error::{InvitationError, InvitationResult};
use crate::messages::{intro_payload, AdmissionResponse, AuthStatus, InvitationMessage};
use crate::protocol::{InvitationGuest, InvitationHost};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessel_core::config::{InvitationConfig, ReplicationConfig};
use tessel_core::{now_millis, PublicKey, Trigger};
use tessel_crypto::{generate_passcode, verify, KeyPair};
use tessel_mesh::{Connection, FrameCodec, NetworkManager, Transport};
use tessel_metadata::{InvitationRecord, MetadataStore};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Channel = Framed<Box<dyn Transport>, FrameCodec<InvitationMessage>>;

/// Progress of a hosted invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationState {
    Connecting,
    Connected,
    ReadyForAuthentication,
    Authenticating,
    Success,
    Cancelled,
    Timeout,
    Error,
}

impl InvitationState {
    /// True for states the invitation never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvitationState::Success
                | InvitationState::Cancelled
                | InvitationState::Timeout
                | InvitationState::Error
        )
    }
}

/// How to create an invitation.
#[derive(Debug, Clone)]
pub struct InvitationOptions {
    pub kind: InvitationKind,
    /// Pre-authorized guest; required for offline invitations
    pub guest_key: Option<PublicKey>,
    /// Fixed auth code instead of a generated one
    pub auth_code: Option<String>,
    /// Overrides the configured timeout
    pub timeout_ms: Option<u64>,
    /// Keep the descriptor in the metadata store until completion
    pub persistent: bool,
}

impl InvitationOptions {
    pub fn interactive() -> Self {
        Self {
            kind: InvitationKind::Interactive,
            guest_key: None,
            auth_code: None,
            timeout_ms: None,
            persistent: false,
        }
    }

    pub fn offline(guest_key: PublicKey) -> Self {
        Self {
            kind: InvitationKind::Offline,
            guest_key: Some(guest_key),
            ..Self::interactive()
        }
    }
}

impl Default for InvitationOptions {
    fn default() -> Self {
        Self::interactive()
    }
}

/// A running hosted invitation.
#[derive(Debug)]
pub struct HostInvitation {
    descriptor: InvitationDescriptor,
    auth_code: Option<String>,
    state: watch::Receiver<InvitationState>,
    done: Arc<Trigger<InvitationState>>,
    cancel: CancellationToken,
}

impl HostInvitation {
    /// Descriptor to hand to the guest.
    pub fn descriptor(&self) -> &InvitationDescriptor {
        &self.descriptor
    }

    /// Code the guest must enter; `None` for offline invitations.
    pub fn auth_code(&self) -> Option<&str> {
        self.auth_code.as_deref()
    }

    pub fn state(&self) -> InvitationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InvitationState> {
        self.state.clone()
    }

    /// Stop hosting. No effect once the invitation has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Suspend until the invitation reaches a terminal state.
    pub async fn wait(&self) -> InvitationState {
        self.done.wait().await
    }
}

/// Creates and accepts invitations.
pub struct InvitationsHandler {
    network: Arc<dyn NetworkManager>,
    config: InvitationConfig,
    max_message_size: usize,
    metadata: Option<Arc<MetadataStore>>,
}

impl std::fmt::Debug for InvitationsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitationsHandler")
            .field("config", &self.config)
            .finish()
    }
}

struct HostContext {
    host: Arc<dyn InvitationHost>,
    descriptor: InvitationDescriptor,
    auth_code: Option<String>,
    max_attempts: u32,
    max_message_size: usize,
    state: watch::Sender<InvitationState>,
}

impl InvitationsHandler {
    pub fn new(
        network: Arc<dyn NetworkManager>,
        config: InvitationConfig,
        replication: &ReplicationConfig,
    ) -> Self {
        Self {
            network,
            config,
            max_message_size: replication.max_message_size,
            metadata: None,
        }
    }

    /// Persist invitations created with `persistent` set.
    pub fn with_metadata(mut self, metadata: Arc<MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Start hosting an invitation.
    pub async fn create_invitation(
        &self,
        host: Arc<dyn InvitationHost>,
        options: InvitationOptions,
    ) -> InvitationResult<HostInvitation> {
        if options.kind == InvitationKind::Offline && options.guest_key.is_none() {
            return Err(InvitationError::InvalidState(
                "offline invitation requires a guest key".to_string(),
            ));
        }
        let keys = host.invitation_keys().await?;
        let descriptor = InvitationDescriptor::new(
            PublicKey::random(),
            options.kind,
            host.target(),
            PublicKey::random(),
            keys.identity_key,
            keys.space_key,
            options.guest_key,
            now_millis(),
        )?;
        let auth_code = match options.kind {
            InvitationKind::Interactive => Some(
                options
                    .auth_code
                    .clone()
                    .unwrap_or_else(|| generate_passcode(self.config.auth_code_length)),
            ),
            InvitationKind::Offline => None,
        };

        let persisted = match (&self.metadata, options.persistent) {
            (Some(metadata), true) => {
                metadata
                    .add_invitation(InvitationRecord {
                        invitation_id: descriptor.invitation_id,
                        kind: descriptor.kind,
                        swarm_key: descriptor.swarm_key,
                        encoded: descriptor.encode()?,
                        created: descriptor.created,
                        lifetime_ms: self.config.expiry_ms,
                    })
                    .await?;
                Some(metadata.clone())
            }
            _ => None,
        };

        let host_peer = PublicKey::random();
        let connections = self.network.join(descriptor.swarm_key, host_peer).await?;
        let (state_tx, state_rx) = watch::channel(InvitationState::Connecting);
        let done = Arc::new(Trigger::new());
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(options.timeout_ms.unwrap_or(self.config.timeout_ms));

        let ctx = HostContext {
            host,
            descriptor: descriptor.clone(),
            auth_code: auth_code.clone(),
            max_attempts: self.config.max_auth_attempts,
            max_message_size: self.max_message_size,
            state: state_tx,
        };
        let network = self.network.clone();
        let task_done = done.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = task_cancel.cancelled() => InvitationState::Cancelled,
                _ = tokio::time::sleep(timeout) => InvitationState::Timeout,
                outcome = serve_guests(&ctx, connections) => outcome,
            };
            network.leave(ctx.descriptor.swarm_key, host_peer).await;
            if let Some(metadata) = persisted {
                if let Err(e) = metadata.remove_invitation(&ctx.descriptor.invitation_id).await {
                    warn!("Failed to remove persisted invitation: {}", e);
                }
            }
            info!(
                invitation = %ctx.descriptor.invitation_id.fmt_short(),
                ?outcome,
                "Invitation finished"
            );
            ctx.state.send_replace(outcome);
            task_done.wake(outcome);
        });

        info!(
            invitation = %descriptor.invitation_id.fmt_short(),
            kind = ?descriptor.kind,
            target = ?descriptor.target,
            "Hosting invitation"
        );
        Ok(HostInvitation {
            descriptor,
            auth_code,
            state: state_rx,
            done,
            cancel,
        })
    }

    /// Join the host named by `descriptor` and go through the handshake.
    /// Auth codes are taken from `codes` until the host accepts one.
    pub async fn accept_invitation(
        &self,
        guest: &dyn InvitationGuest,
        descriptor: &InvitationDescriptor,
        mut codes: mpsc::Receiver<String>,
    ) -> InvitationResult<AdmissionResponse> {
        descriptor.verify()?;
        if descriptor.target != guest.target() {
            return Err(InvitationError::InvalidState(format!(
                "{:?} invitation offered to a {:?} guest",
                descriptor.target,
                guest.target()
            )));
        }

        let payload_for = |key: &PublicKey| intro_payload(&descriptor.invitation_id, key);
        let (guest_key, proof) = match descriptor.kind {
            InvitationKind::Offline => {
                let key = descriptor.guest_key.ok_or_else(|| {
                    InvitationError::InvalidDescriptor("offline invitation without guest key".to_string())
                })?;
                if !guest.keyring().has_key(&key).await {
                    return Err(InvitationError::InvalidState(format!(
                        "invitation is for {}, which this device does not hold",
                        key.fmt_short()
                    )));
                }
                let proof = guest.keyring().sign(&key, &payload_for(&key)).await?;
                (key, proof)
            }
            InvitationKind::Interactive => {
                let pair = KeyPair::generate();
                let proof = pair.sign(&payload_for(&pair.public_key))?;
                (pair.public_key, proof)
            }
        };

        let mut connections = self.network.join(descriptor.swarm_key, guest_key).await?;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let result = tokio::time::timeout(timeout, async {
            let connection = connections
                .recv()
                .await
                .ok_or_else(|| InvitationError::Protocol("network closed".to_string()))?;
            let mut channel = self.channel(connection);
            channel
                .send(InvitationMessage::Introduce {
                    invitation_id: descriptor.invitation_id,
                    guest_key,
                    proof,
                })
                .await?;
            guest_handshake(guest, descriptor, &mut channel, &mut codes).await
        })
        .await;
        self.network.leave(descriptor.swarm_key, guest_key).await;

        match result {
            Ok(result) => result,
            Err(_) => Err(InvitationError::Timeout),
        }
    }

    /// Descriptors of persisted invitations that have not expired. Expired
    /// ones are dropped from the store.
    pub async fn persisted_invitations(&self) -> InvitationResult<Vec<InvitationDescriptor>> {
        let Some(metadata) = &self.metadata else {
            return Ok(Vec::new());
        };
        let pruned = metadata.prune_expired_invitations(now_millis()).await?;
        if pruned > 0 {
            debug!(pruned, "Dropped expired invitations");
        }
        let mut descriptors = Vec::new();
        for record in metadata.invitations().await {
            match InvitationDescriptor::decode(&record.encoded) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!(
                    invitation = %record.invitation_id.fmt_short(),
                    "Skipping unreadable invitation: {}", e
                ),
            }
        }
        Ok(descriptors)
    }

    fn channel(&self, connection: Connection) -> Channel {
        Framed::new(connection.stream, FrameCodec::new(self.max_message_size))
    }
}

async fn recv(channel: &mut Channel) -> InvitationResult<InvitationMessage> {
    match channel.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e.into()),
        None => Err(InvitationError::Protocol("connection closed".to_string())),
    }
}

fn unexpected(message: &InvitationMessage) -> InvitationError {
    InvitationError::Protocol(format!("unexpected message: {:?}", message))
}

async fn guest_handshake(
    guest: &dyn InvitationGuest,
    descriptor: &InvitationDescriptor,
    channel: &mut Channel,
    codes: &mut mpsc::Receiver<String>,
) -> InvitationResult<AdmissionResponse> {
    let auth_required = match recv(channel).await? {
        InvitationMessage::Introduction { auth_required } => auth_required,
        InvitationMessage::Rejected { reason } => return Err(InvitationError::Rejected(reason)),
        other => return Err(unexpected(&other)),
    };

    if auth_required {
        loop {
            let code = codes.recv().await.ok_or(InvitationError::Cancelled)?;
            channel.send(InvitationMessage::Authenticate { code }).await?;
            match recv(channel).await? {
                InvitationMessage::AuthResult { status: AuthStatus::Ok } => break,
                InvitationMessage::AuthResult {
                    status: AuthStatus::InvalidCode,
                } => debug!("Host rejected auth code"),
                InvitationMessage::AuthResult {
                    status: AuthStatus::TooManyAttempts,
                } => return Err(InvitationError::TooManyAttempts),
                other => return Err(unexpected(&other)),
            }
        }
    }

    let request = guest.admission_request(descriptor).await?;
    channel.send(InvitationMessage::Admit { request }).await?;
    let response = match recv(channel).await? {
        InvitationMessage::Admitted { response } => response,
        InvitationMessage::Rejected { reason } => return Err(InvitationError::Rejected(reason)),
        other => return Err(unexpected(&other)),
    };

    let consistent = match response {
        AdmissionResponse::Device { identity_key, .. } => {
            descriptor.identity_key == Some(identity_key)
        }
        AdmissionResponse::Space { space_key, .. } => descriptor.space_key == Some(space_key),
    };
    if !consistent {
        return Err(InvitationError::Protocol(
            "admission response does not match the invitation".to_string(),
        ));
    }
    guest.accept(request, response).await?;
    info!(invitation = %descriptor.invitation_id.fmt_short(), "Invitation accepted");
    Ok(response)
}

/// Serve connections until a guest is admitted or auth attempts run out.
async fn serve_guests(
    ctx: &HostContext,
    mut connections: mpsc::UnboundedReceiver<Connection>,
) -> InvitationState {
    let mut attempts = 0u32;
    while let Some(connection) = connections.recv().await {
        ctx.state.send_replace(InvitationState::Connected);
        let mut channel = Framed::new(connection.stream, FrameCodec::new(ctx.max_message_size));
        match host_handshake(ctx, &mut channel, &mut attempts).await {
            Ok(()) => return InvitationState::Success,
            Err(InvitationError::TooManyAttempts) => {
                warn!(
                    invitation = %ctx.descriptor.invitation_id.fmt_short(),
                    "Too many authentication attempts"
                );
                return InvitationState::Error;
            }
            Err(e) => {
                debug!("Guest session failed: {}", e);
                ctx.state.send_replace(InvitationState::Connecting);
            }
        }
    }
    InvitationState::Error
}

async fn host_handshake(
    ctx: &HostContext,
    channel: &mut Channel,
    attempts: &mut u32,
) -> InvitationResult<()> {
    let descriptor = &ctx.descriptor;
    let guest_key = match recv(channel).await? {
        InvitationMessage::Introduce {
            invitation_id,
            guest_key,
            proof,
        } => {
            if invitation_id != descriptor.invitation_id {
                return reject(channel, "unknown invitation").await;
            }
            if !verify(&guest_key, &intro_payload(&invitation_id, &guest_key), &proof) {
                return reject(channel, "invalid proof").await;
            }
            if descriptor.kind == InvitationKind::Offline && descriptor.guest_key != Some(guest_key) {
                return reject(channel, "guest is not the invited key").await;
            }
            guest_key
        }
        other => return Err(unexpected(&other)),
    };
    channel
        .send(InvitationMessage::Introduction {
            auth_required: ctx.auth_code.is_some(),
        })
        .await?;

    if let Some(expected) = &ctx.auth_code {
        ctx.state.send_replace(InvitationState::ReadyForAuthentication);
        loop {
            let offered = match recv(channel).await? {
                InvitationMessage::Authenticate { code } => code,
                other => return Err(unexpected(&other)),
            };
            ctx.state.send_replace(InvitationState::Authenticating);
            *attempts += 1;
            if *attempts > ctx.max_attempts {
                let _ = channel
                    .send(InvitationMessage::AuthResult {
                        status: AuthStatus::TooManyAttempts,
                    })
                    .await;
                return Err(InvitationError::TooManyAttempts);
            }
            if offered == *expected {
                channel
                    .send(InvitationMessage::AuthResult { status: AuthStatus::Ok })
                    .await?;
                break;
            }
            debug!(attempt = *attempts, "Invalid auth code");
            channel
                .send(InvitationMessage::AuthResult {
                    status: AuthStatus::InvalidCode,
                })
                .await?;
            ctx.state.send_replace(InvitationState::ReadyForAuthentication);
        }
    }

    let request = match recv(channel).await? {
        InvitationMessage::Admit { request } => request,
        other => return Err(unexpected(&other)),
    };
    if descriptor.kind == InvitationKind::Offline && request.subject() != guest_key {
        return reject(channel, "admission requested for a different key").await;
    }
    match ctx.host.admit(request).await {
        Ok(response) => {
            channel.send(InvitationMessage::Admitted { response }).await?;
            info!(guest = %request.subject().fmt_short(), "Admitted guest");
            Ok(())
        }
        Err(e) => {
            let _ = channel
                .send(InvitationMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
            Err(e)
        }
    }
}

async fn reject(channel: &mut Channel, reason: &str) -> InvitationResult<()> {
    let _ = channel
        .send(InvitationMessage::Rejected {
            reason: reason.to_string(),
        })
        .await;
    Err(InvitationError::Rejected(reason.to_string()))
}
