//! Adversarial scenarios: forged credentials, guessed codes and tampered
//! invitations must never get a device admitted.

use crate::test_utils::*;
use std::sync::Arc;
use std::time::Duration;
use tessel_core::config::ReplicationConfig;
use tessel_core::PublicKey;
use tessel_crypto::KeyPair;
use tessel_identity::{Assertion, Credential, FeedMessage, IdentityState, JoinParams};
use tessel_invitation::{InvitationError, InvitationOptions, InvitationState};
use tessel_mesh::{MemoryNetwork, SpaceProtocol};

fn invitation_error(err: &anyhow::Error) -> &InvitationError {
    err.downcast_ref::<InvitationError>()
        .expect("failure is an invitation error")
}

#[tokio::test]
async fn test_forged_credential_blocks_ready() {
    let network = MemoryNetwork::new();
    let host = ready_device(&network).await;
    let record = host.identity_record().await.unwrap();

    // Join by hand so the guest's replication can be driven directly.
    let guest = device(&network).await;
    let guest_record = guest
        .identity()
        .accept_identity(JoinParams::from(&record))
        .await
        .unwrap();
    let protocol = SpaceProtocol::new(
        record.halo_space_key,
        guest_record.device_key,
        guest.keyring().clone(),
        Arc::new(network.clone()),
        ReplicationConfig::default(),
    );
    for feed in guest.identity().control_feeds().await {
        protocol.add_feed(feed).await;
    }
    let control_feed = guest.identity().control_feed().await.unwrap();
    protocol.add_feed(control_feed.clone()).await;
    protocol.start().await.unwrap();

    // Correctly signed, but by a key the identity never admitted.
    let outsider = KeyPair::generate();
    let forged = Credential::issue_with(
        &outsider,
        Assertion::AuthorizedDevice {
            identity_key: record.identity_key,
            device_key: guest_record.device_key,
        },
    )
    .unwrap();
    control_feed
        .append(FeedMessage::Credential(forged).encode().unwrap())
        .await
        .unwrap();

    let pending = tokio::time::timeout(Duration::from_millis(300), guest.ready()).await;
    assert!(pending.is_err());
    assert_eq!(guest.identity().state(), IdentityState::Joining);

    // A real admission replicates over and unblocks the guest.
    host.identity()
        .admit_device(guest_record.device_key, control_feed.key())
        .await
        .unwrap();
    settle(guest.ready()).await.unwrap();
    let state = guest.identity().authorization_state().await.unwrap();
    assert!(state.is_device_authorized(&guest_record.device_key));
    assert!(!state.is_device_authorized(&outsider.public_key));
    assert!(state.held >= 1);

    protocol.stop().await;
    host.close().await;
    guest.close().await;
}

#[tokio::test]
async fn test_wrong_code_then_retry() {
    let network = MemoryNetwork::new();
    let host = ready_device(&network).await;
    let guest = device(&network).await;

    let invitation = host
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    guest
        .accept_device_invitation(invitation.descriptor(), codes(&["wrong", code.as_str()]))
        .await
        .unwrap();
    settle(guest.ready()).await.unwrap();
    assert_eq!(settle(invitation.wait()).await, InvitationState::Success);

    host.close().await;
    guest.close().await;
}

#[tokio::test]
async fn test_too_many_attempts() {
    let network = MemoryNetwork::new();
    let host = ready_device(&network).await;
    let guest = device(&network).await;

    let invitation = host
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    // The right code arrives only after the attempts are used up.
    let err = guest
        .accept_device_invitation(
            invitation.descriptor(),
            codes(&["wrong-1", "wrong-2", "wrong-3", code.as_str()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(invitation_error(&err), InvitationError::TooManyAttempts));
    assert_eq!(settle(invitation.wait()).await, InvitationState::Error);
    assert!(guest.identity_record().await.is_none());

    host.close().await;
    guest.close().await;
}

#[tokio::test]
async fn test_tampered_invitation_rejected() {
    let network = MemoryNetwork::new();
    let host = ready_device(&network).await;
    let guest = device(&network).await;

    let invitation = host
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let mut tampered = invitation.descriptor().clone();
    tampered.identity_key = Some(PublicKey::random());

    let err = guest
        .accept_device_invitation(&tampered, codes(&[code.as_str()]))
        .await
        .unwrap_err();
    assert!(matches!(invitation_error(&err), InvitationError::Tampered));
    // The guest never joined the swarm.
    assert_eq!(network.members(&tampered.swarm_key).await.len(), 1);
    assert_eq!(invitation.state(), InvitationState::Connecting);
    assert!(guest.identity_record().await.is_none());

    invitation.cancel();
    assert_eq!(settle(invitation.wait()).await, InvitationState::Cancelled);
    host.close().await;
    guest.close().await;
}

#[tokio::test]
async fn test_offline_invitation_refuses_other_devices() {
    let network = MemoryNetwork::new();
    let host = ready_device(&network).await;
    let intended = device(&network).await;
    let other = device(&network).await;

    let device_key = intended.keyring().create_key().await.unwrap();
    let invitation = host
        .create_device_invitation(InvitationOptions::offline(device_key))
        .await
        .unwrap();

    // Another device cannot prove it holds the invited key.
    let err = other
        .accept_device_invitation(invitation.descriptor(), codes(&[]))
        .await
        .unwrap_err();
    assert!(matches!(invitation_error(&err), InvitationError::InvalidState(_)));

    intended
        .accept_device_invitation(invitation.descriptor(), codes(&[]))
        .await
        .unwrap();
    settle(intended.ready()).await.unwrap();

    for ctx in [host, intended, other] {
        ctx.close().await;
    }
}
