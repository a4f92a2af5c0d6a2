//! Network manager seam.
//!
//! The replication layer needs only an ordered, reliable, bidirectional
//! byte channel to each peer that shares a topic. Discovery and transport
//! sit behind [`NetworkManager`]; [`MemoryNetwork`] wires peers in the same
//! process together and is what tests and single-host setups use.

use crate::error::MeshResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessel_core::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Byte channel to a single peer.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A connection to a peer discovered on a topic.
pub struct Connection {
    /// Key the remote peer joined the topic with. Still has to prove it.
    pub remote_peer: PublicKey,
    /// True on the side that dialed
    pub initiator: bool,
    /// The byte channel
    pub stream: Box<dyn Transport>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer)
            .field("initiator", &self.initiator)
            .finish()
    }
}

/// Discovers peers per topic and hands out connections to them.
#[async_trait]
pub trait NetworkManager: Send + Sync + fmt::Debug {
    /// Start discovering peers for `topic`. Each connection to another
    /// peer on the topic arrives on the returned channel.
    async fn join(
        &self,
        topic: PublicKey,
        local_peer: PublicKey,
    ) -> MeshResult<mpsc::UnboundedReceiver<Connection>>;

    /// Stop advertising `local_peer` on `topic`. Open connections are left
    /// for their owners to close.
    async fn leave(&self, topic: PublicKey, local_peer: PublicKey);
}

type Topics = HashMap<PublicKey, HashMap<PublicKey, mpsc::UnboundedSender<Connection>>>;

/// In-process network: every pair of peers on a topic gets one pipe.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    topics: Arc<Mutex<Topics>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently joined to `topic`.
    pub async fn members(&self, topic: &PublicKey) -> Vec<PublicKey> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NetworkManager for MemoryNetwork {
    async fn join(
        &self,
        topic: PublicKey,
        local_peer: PublicKey,
    ) -> MeshResult<mpsc::UnboundedReceiver<Connection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().await;
        let peers = topics.entry(topic).or_default();

        // Drop senders whose receiver is gone so they are not dialed.
        peers.retain(|_, sender| !sender.is_closed());
        for (remote, remote_tx) in peers.iter() {
            if *remote == local_peer {
                continue;
            }
            let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
            let initiator = local_peer < *remote;
            let _ = remote_tx.send(Connection {
                remote_peer: local_peer,
                initiator: !initiator,
                stream: Box::new(remote_end),
            });
            let _ = tx.send(Connection {
                remote_peer: *remote,
                initiator,
                stream: Box::new(local_end),
            });
            debug!(
                topic = %topic.fmt_short(),
                local = %local_peer.fmt_short(),
                remote = %remote.fmt_short(),
                "Connected peers"
            );
        }
        peers.insert(local_peer, tx);
        Ok(rx)
    }

    async fn leave(&self, topic: PublicKey, local_peer: PublicKey) {
        let mut topics = self.topics.lock().await;
        if let Some(peers) = topics.get_mut(&topic) {
            peers.remove(&local_peer);
            if peers.is_empty() {
                topics.remove(&topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pairs_connect_once() {
        let network = MemoryNetwork::new();
        let topic = PublicKey::random();
        let a = PublicKey::random();
        let b = PublicKey::random();

        let mut a_rx = network.join(topic, a).await.unwrap();
        let mut b_rx = network.join(topic, b).await.unwrap();

        let mut a_conn = a_rx.recv().await.unwrap();
        let mut b_conn = b_rx.recv().await.unwrap();
        assert_eq!(a_conn.remote_peer, b);
        assert_eq!(b_conn.remote_peer, a);
        assert_ne!(a_conn.initiator, b_conn.initiator);
        assert_eq!(a_conn.initiator, a < b);

        a_conn.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let network = MemoryNetwork::new();
        let a = PublicKey::random();
        let b = PublicKey::random();
        let mut a_rx = network.join(PublicKey::random(), a).await.unwrap();
        let _b_rx = network.join(PublicKey::random(), b).await.unwrap();
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave() {
        let network = MemoryNetwork::new();
        let topic = PublicKey::random();
        let a = PublicKey::random();
        let _rx = network.join(topic, a).await.unwrap();
        assert_eq!(network.members(&topic).await, vec![a]);
        network.leave(topic, a).await;
        assert!(network.members(&topic).await.is_empty());
    }
}
