//! Space replication between devices of different identities.

use crate::test_utils::*;
use tessel_invitation::InvitationOptions;
use tessel_mesh::MemoryNetwork;

#[tokio::test]
async fn test_two_members_converge() {
    let network = MemoryNetwork::new();
    let alice = ready_device(&network).await;
    let bob = ready_device(&network).await;

    let space = alice.create_space().await.unwrap();
    space.ready().await.unwrap();
    space.write_data(b"alice-1".to_vec()).await.unwrap();

    let invitation = alice
        .create_space_invitation(&space.key(), InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let joined = bob
        .accept_space_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(joined.ready()).await.unwrap();

    space.write_data(b"alice-2".to_vec()).await.unwrap();
    joined.write_data(b"bob-1".to_vec()).await.unwrap();

    let alice_feed = space.data_feed().key();
    let bob_feed = joined.data_feed().key();
    assert_ne!(alice_feed, bob_feed);
    assert_eq!(
        read_payloads(&joined, &alice_feed, 2).await,
        vec![b"alice-1".to_vec(), b"alice-2".to_vec()]
    );

    // Alice reads Bob's feed once her pipeline has admitted it.
    let bob_member = bob.identity_record().await.unwrap().device_key;
    settle(space.pipeline().wait_until(|s| s.is_feed_admitted(&bob_feed)))
        .await
        .unwrap();
    assert!(space.state().is_member(&bob_member));
    assert_eq!(read_payloads(&space, &bob_feed, 1).await, vec![b"bob-1".to_vec()]);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_member_writes_reach_late_joiner() {
    let network = MemoryNetwork::new();
    let alice = ready_device(&network).await;
    let bob = ready_device(&network).await;
    let carol = ready_device(&network).await;

    let space = alice.create_space().await.unwrap();
    space.ready().await.unwrap();

    let invitation = alice
        .create_space_invitation(&space.key(), InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let bob_space = bob
        .accept_space_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(bob_space.ready()).await.unwrap();
    bob_space.write_data(b"from bob".to_vec()).await.unwrap();

    // Bob is a member, so he can admit Carol himself.
    let invitation = bob
        .create_space_invitation(&space.key(), InvitationOptions::interactive())
        .await
        .unwrap();
    let code = invitation.auth_code().unwrap().to_string();
    let carol_space = carol
        .accept_space_invitation(invitation.descriptor(), codes(&[code.as_str()]))
        .await
        .unwrap();
    settle(carol_space.ready()).await.unwrap();

    let bob_feed = bob_space.data_feed().key();
    settle(carol_space.pipeline().wait_until(|s| s.is_feed_admitted(&bob_feed)))
        .await
        .unwrap();
    assert_eq!(
        read_payloads(&carol_space, &bob_feed, 1).await,
        vec![b"from bob".to_vec()]
    );

    for ctx in [alice, bob, carol] {
        ctx.close().await;
    }
}
