//! Space protocol: replicate a set of feeds with every peer on a topic.

use crate::error::{MeshError, MeshResult};
use crate::network::{Connection, NetworkManager};
use crate::session::{self, Shared};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tessel_core::config::ReplicationConfig;
use tessel_core::PublicKey;
use tessel_crypto::Keyring;
use tessel_feed::Feed;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FEED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Replicates feeds with peers that joined the same topic.
///
/// Feeds may be added before or after [`start`](Self::start); peers learn
/// about late additions on live sessions. Replication is continuous: an
/// open session keeps streaming entries as they are appended.
pub struct SpaceProtocol {
    shared: Arc<Shared>,
    network: Arc<dyn NetworkManager>,
    state: Mutex<RunState>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SpaceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceProtocol")
            .field("topic", &self.shared.topic)
            .field("local_peer", &self.shared.local_peer)
            .finish()
    }
}

impl SpaceProtocol {
    /// Protocol for `topic`, authenticating as `local_peer`, whose secret
    /// the keyring must hold.
    pub fn new(
        topic: PublicKey,
        local_peer: PublicKey,
        keyring: Arc<Keyring>,
        network: Arc<dyn NetworkManager>,
        config: ReplicationConfig,
    ) -> Self {
        let (feed_added, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        let (peers, _) = watch::channel(BTreeSet::new());
        Self {
            shared: Arc::new(Shared {
                topic,
                local_peer,
                keyring,
                config,
                feeds: Mutex::new(HashMap::new()),
                feed_added,
                peers,
            }),
            network,
            state: Mutex::new(RunState::Idle),
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Topic peers are discovered on.
    pub fn topic(&self) -> PublicKey {
        self.shared.topic
    }

    /// Key this side authenticates with.
    pub fn local_peer(&self) -> PublicKey {
        self.shared.local_peer
    }

    /// Join the topic and replicate with every peer found. Idempotent while
    /// running; fails once stopped.
    pub async fn start(&self) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            RunState::Running => return Ok(()),
            RunState::Stopped => return Err(MeshError::Stopped),
            RunState::Idle => {}
        }
        if !self.shared.keyring.has_key(&self.shared.local_peer).await {
            return Err(MeshError::Crypto(tessel_crypto::CryptoError::KeyNotFound(
                self.shared.local_peer,
            )));
        }

        let connections = self
            .network
            .join(self.shared.topic, self.shared.local_peer)
            .await?;
        self.tasks.lock().await.spawn(accept_loop(
            self.shared.clone(),
            connections,
            self.cancel.clone(),
        ));
        *state = RunState::Running;
        info!(
            topic = %self.shared.topic.fmt_short(),
            peer = %self.shared.local_peer.fmt_short(),
            "Space protocol started"
        );
        Ok(())
    }

    /// Offer `feed` to peers and accept their entries for it. Adding the
    /// same feed twice is a no-op.
    pub async fn add_feed(&self, feed: Feed) {
        {
            let mut feeds = self.shared.feeds.lock().await;
            if feeds.contains_key(&feed.key()) {
                return;
            }
            feeds.insert(feed.key(), feed.clone());
        }
        debug!(topic = %self.shared.topic.fmt_short(), feed = %feed.key().fmt_short(), "Added feed");
        let _ = self.shared.feed_added.send(feed);
    }

    /// Feeds being replicated.
    pub async fn feeds(&self) -> Vec<Feed> {
        self.shared.feeds.lock().await.values().cloned().collect()
    }

    /// Authenticated peers with a live session.
    pub fn peers(&self) -> BTreeSet<PublicKey> {
        self.shared.peers.borrow().clone()
    }

    /// Watch the peer set.
    pub fn subscribe_peers(&self) -> watch::Receiver<BTreeSet<PublicKey>> {
        self.shared.peers.subscribe()
    }

    /// Leave the topic and tear down every session. Idempotent. Feeds are
    /// left open; entries are either fully stored or not at all.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, RunState::Stopped) {
            return;
        }
        let was_running = matches!(*state, RunState::Running);
        *state = RunState::Stopped;
        self.cancel.cancel();
        if was_running {
            self.network
                .leave(self.shared.topic, self.shared.local_peer)
                .await;
        }
        self.tasks.lock().await.shutdown().await;
        self.shared.peers.send_modify(|peers| peers.clear());
        info!(topic = %self.shared.topic.fmt_short(), "Space protocol stopped");
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    mut connections: mpsc::UnboundedReceiver<Connection>,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            connection = connections.recv() => {
                let Some(connection) = connection else {
                    break;
                };
                let peer = connection.remote_peer;
                let shared = shared.clone();
                let cancel = cancel.clone();
                sessions.spawn(async move {
                    if let Err(e) = session::run(shared, connection, cancel).await {
                        warn!(peer = %peer.fmt_short(), "Session ended: {}", e);
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    sessions.shutdown().await;
}
