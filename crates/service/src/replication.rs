//! Keeps a space protocol's feed set in step with a control pipeline.

use std::sync::Arc;
use tessel_core::config::ReplicationConfig;
use tessel_core::PublicKey;
use tessel_crypto::Keyring;
use tessel_feed::Feed;
use tessel_identity::ControlPipeline;
use tessel_mesh::{MeshResult, NetworkManager, SpaceProtocol};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A running space protocol plus the task feeding it newly admitted feeds.
pub(crate) struct Replication {
    protocol: Arc<SpaceProtocol>,
    cancel: CancellationToken,
    follower: JoinHandle<()>,
}

impl Replication {
    /// Start replicating every feed of `pipeline` on `topic`, plus `local`
    /// feeds the pipeline may not list yet.
    pub(crate) async fn start(
        topic: PublicKey,
        local_peer: PublicKey,
        pipeline: Arc<ControlPipeline>,
        local: Vec<Feed>,
        keyring: Arc<Keyring>,
        network: Arc<dyn NetworkManager>,
        config: ReplicationConfig,
    ) -> MeshResult<Self> {
        let protocol = Arc::new(SpaceProtocol::new(
            topic, local_peer, keyring, network, config,
        ));
        // Subscribe before listing so no feed falls in between.
        let mut added = pipeline.subscribe_feeds();
        for feed in local.into_iter().chain(pipeline.feeds().await) {
            protocol.add_feed(feed).await;
        }
        protocol.start().await?;

        let cancel = CancellationToken::new();
        let follower = {
            let protocol = protocol.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = added.recv() => match received {
                            Ok(feed) => protocol.add_feed(feed).await,
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(skipped, "Feed notifications lagged, resyncing");
                                for feed in pipeline.feeds().await {
                                    protocol.add_feed(feed).await;
                                }
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        Ok(Self {
            protocol,
            cancel,
            follower,
        })
    }

    pub(crate) fn protocol(&self) -> &Arc<SpaceProtocol> {
        &self.protocol
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.follower.await;
        self.protocol.stop().await;
    }
}
