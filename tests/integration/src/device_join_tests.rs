//! Devices joining an identity through invitations.

use crate::test_utils::*;
use tessel_identity::IdentityState;
use tessel_invitation::{InvitationDescriptor, InvitationOptions, InvitationState};
use tessel_mesh::MemoryNetwork;

#[tokio::test]
async fn test_interactive_device_join() {
    let network = MemoryNetwork::new();
    let first = ready_device(&network).await;
    let second = device(&network).await;
    assert_eq!(second.identity().state(), IdentityState::Uninitialized);

    let invitation = first
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let joined = second
        .accept_device_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    assert_eq!(settle(invitation.wait()).await, InvitationState::Success);
    settle(second.ready()).await.unwrap();

    let host = first.identity_record().await.unwrap();
    assert_eq!(joined.identity_key, host.identity_key);
    assert_eq!(joined.halo_space_key, host.halo_space_key);
    assert_ne!(joined.device_key, host.device_key);

    // Both sides see both devices.
    let seen_by_second = second.identity().authorization_state().await.unwrap();
    assert!(seen_by_second.is_device_authorized(&host.device_key));
    assert!(seen_by_second.is_device_authorized(&joined.device_key));
    let pipeline = first.identity().pipeline().await.unwrap();
    let seen_by_first = settle(pipeline.wait_until(|s| s.is_device_authorized(&joined.device_key)))
        .await
        .unwrap();
    assert!(seen_by_first.is_device_authorized(&host.device_key));

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_offline_device_join() {
    let network = MemoryNetwork::new();
    let first = ready_device(&network).await;
    let second = device(&network).await;

    // The new device shares its key out of band ahead of time.
    let device_key = second.keyring().create_key().await.unwrap();
    let invitation = first
        .create_device_invitation(InvitationOptions::offline(device_key))
        .await
        .unwrap();
    assert!(invitation.auth_code().is_none());

    let encoded = invitation.descriptor().encode().unwrap();
    let descriptor: InvitationDescriptor = encoded.parse().unwrap();
    let joined = second
        .accept_device_invitation(&descriptor, codes(&[]))
        .await
        .unwrap();
    assert_eq!(joined.device_key, device_key);
    settle(second.ready()).await.unwrap();
    assert_eq!(settle(invitation.wait()).await, InvitationState::Success);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_joined_device_admits_the_next() {
    let network = MemoryNetwork::new();
    let first = ready_device(&network).await;
    let second = device(&network).await;
    let third = device(&network).await;

    let invitation = first
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    second
        .accept_device_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(second.ready()).await.unwrap();

    let invitation = second
        .create_device_invitation(InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let joined = third
        .accept_device_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(third.ready()).await.unwrap();

    // The first device learns of the third through the second's feed.
    let pipeline = first.identity().pipeline().await.unwrap();
    settle(pipeline.wait_until(|s| s.is_device_authorized(&joined.device_key)))
        .await
        .unwrap();

    for ctx in [first, second, third] {
        ctx.close().await;
    }
}

#[tokio::test]
async fn test_device_invitation_persisted_until_used() {
    let network = MemoryNetwork::new();
    let first = ready_device(&network).await;
    let second = device(&network).await;

    let options = InvitationOptions {
        persistent: true,
        ..InvitationOptions::interactive()
    };
    let invitation = first.create_device_invitation(options).await.unwrap();
    let pending = first.invitations().persisted_invitations().await.unwrap();
    assert_eq!(pending, vec![invitation.descriptor().clone()]);

    let code = invitation.auth_code().unwrap().to_string();
    second
        .accept_device_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(invitation.wait()).await;
    assert!(first
        .invitations()
        .persisted_invitations()
        .await
        .unwrap()
        .is_empty());

    first.close().await;
    second.close().await;
}
