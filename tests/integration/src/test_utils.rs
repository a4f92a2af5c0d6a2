//! Fixtures shared by the integration scenarios.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tessel_core::{logging, Config, PublicKey};
use tessel_identity::Space;
use tessel_mesh::MemoryNetwork;
use tessel_service::ServiceContext;
use tokio::sync::mpsc;

/// Upper bound for anything that should converge promptly.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Open an in-memory device on `network`.
pub async fn device(network: &MemoryNetwork) -> ServiceContext {
    device_with(network, Config::default_config()).await
}

/// Open a device with an explicit configuration.
pub async fn device_with(network: &MemoryNetwork, config: Config) -> ServiceContext {
    logging::init_test();
    ServiceContext::open(config, Arc::new(network.clone()))
        .await
        .expect("device opens")
}

/// A device that has bootstrapped its own identity.
pub async fn ready_device(network: &MemoryNetwork) -> ServiceContext {
    let ctx = device(network).await;
    ctx.create_identity().await.expect("identity created");
    ctx.ready().await.expect("identity ready");
    ctx
}

/// Auth codes a guest will offer, in order. The channel closes after the
/// last one.
pub fn codes(values: &[&str]) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(values.len().max(1));
    for value in values {
        tx.try_send(value.to_string()).expect("channel has capacity");
    }
    rx
}

/// Await `future`, failing the test if it does not finish within
/// [`SETTLE`].
pub async fn settle<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(SETTLE, future)
        .await
        .expect("did not settle in time")
}

/// Collect the first `count` payloads of one feed of `space`.
pub async fn read_payloads(space: &Space, feed_key: &PublicKey, count: usize) -> Vec<Vec<u8>> {
    let stream = space.read_data(feed_key, 0).await.expect("feed is part of space");
    settle(stream.take(count).map(|(_, payload)| payload).collect()).await
}
