//! Restarts over filesystem storage.

use crate::test_utils::*;
use std::fs::OpenOptions;
use tessel_core::config::KeyringConfig;
use tessel_core::Config;
use tessel_crypto::CryptoError;
use tessel_mesh::MemoryNetwork;

fn encrypted(root: &std::path::Path, passphrase: &str) -> Config {
    let mut config = Config::persistent(root);
    config.keyring = KeyringConfig {
        encrypt_at_rest: true,
        passphrase: Some(passphrase.to_string()),
    };
    config
}

#[tokio::test]
async fn test_wrong_passphrase_refused() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();

    let ctx = device_with(&network, encrypted(dir.path(), "correct horse")).await;
    let record = ctx.create_identity().await.unwrap();
    ctx.ready().await.unwrap();
    ctx.close().await;

    let err = tessel_service::ServiceContext::open(
        encrypted(dir.path(), "battery staple"),
        std::sync::Arc::new(network.clone()),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CryptoError>(),
        Some(CryptoError::Decryption(_))
    ));

    let ctx = device_with(&network, encrypted(dir.path(), "correct horse")).await;
    assert_eq!(ctx.identity_record().await, Some(record));
    settle(ctx.ready()).await.unwrap();
    ctx.close().await;
}

#[tokio::test]
async fn test_truncated_feed_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let config = Config::persistent(dir.path());

    let ctx = device_with(&network, config.clone()).await;
    ctx.create_identity().await.unwrap();
    ctx.ready().await.unwrap();
    let space = ctx.create_space().await.unwrap();
    space.ready().await.unwrap();
    space.write_data(b"kept".to_vec()).await.unwrap();
    space.write_data(b"torn".to_vec()).await.unwrap();
    let space_key = space.key();
    let feed_key = space.data_feed().key();
    let length = space.data_feed().length();
    ctx.close().await;

    // Simulate a crash halfway through the last record.
    let path = dir.path().join("feeds").join(feed_key.to_hex());
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let size = file.metadata().unwrap().len();
    file.set_len(size - 3).unwrap();

    let ctx = device_with(&network, config).await;
    settle(ctx.ready()).await.unwrap();
    let space = ctx.space(&space_key).await.unwrap();
    settle(space.ready()).await.unwrap();
    assert_eq!(space.data_feed().length(), length - 1);
    assert_eq!(space.write_data(b"again".to_vec()).await.unwrap(), length - 1);
    assert_eq!(
        read_payloads(&space, &feed_key, 2).await,
        vec![b"kept".to_vec(), b"again".to_vec()]
    );
    ctx.close().await;
}
