//! One authenticated replication session with one peer.
//!
//! # Session Flow
//!
//! ```text
//! Hello ──> <── Hello
//! Auth  ──> <── Auth         (each signs the other's challenge)
//! Feeds ──> <── Feeds        (key + length of every local feed)
//! Request ─> for feeds both know and the local copy is a replica
//! <── Data ... Data           (live, one sender task per requested feed)
//! Have ──>  when a feed is added locally mid-session
//! ```
//!
//! Reads happen on the session task. Writes go through a dedicated writer
//! task so a slow peer can never stall processing of inbound frames.

use crate::codec::FrameCodec;
use crate::error::{MeshError, MeshResult};
use crate::message::{auth_payload, Message, CHALLENGE_SIZE};
use crate::network::Connection;
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tessel_core::config::ReplicationConfig;
use tessel_core::PublicKey;
use tessel_crypto::{verify, Keyring};
use tessel_feed::{Feed, InsertOutcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DATA_CHANNEL_CAPACITY: usize = 256;

/// State shared by every session of one protocol instance.
#[derive(Debug)]
pub(crate) struct Shared {
    pub topic: PublicKey,
    pub local_peer: PublicKey,
    pub keyring: Arc<Keyring>,
    pub config: ReplicationConfig,
    pub feeds: Mutex<HashMap<PublicKey, Feed>>,
    pub feed_added: broadcast::Sender<Feed>,
    pub peers: watch::Sender<BTreeSet<PublicKey>>,
}

impl Shared {
    async fn feed(&self, key: &PublicKey) -> Option<Feed> {
        self.feeds.lock().await.get(key).cloned()
    }
}

type Reader<R> = FramedRead<R, FrameCodec<Message>>;

/// Run a session until the peer disconnects, the transport fails or
/// `cancel` fires. The peer is listed in `peers` only between a successful
/// handshake and the end of the session.
pub(crate) async fn run(
    shared: Arc<Shared>,
    connection: Connection,
    cancel: CancellationToken,
) -> MeshResult<()> {
    let remote = connection.remote_peer;
    let codec = FrameCodec::<Message>::new(shared.config.max_message_size);
    let (read_half, write_half) = tokio::io::split(connection.stream);
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);

    let timeout = Duration::from_millis(shared.config.handshake_timeout_ms);
    match tokio::time::timeout(timeout, handshake(&shared, remote, &mut reader, &mut writer)).await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(MeshError::Timeout(format!(
                "handshake with {}",
                remote.fmt_short()
            )))
        }
    }

    shared.peers.send_modify(|peers| {
        peers.insert(remote);
    });
    debug!(topic = %shared.topic.fmt_short(), peer = %remote.fmt_short(), "Peer connected");

    let session = cancel.child_token();
    let result = replicate(&shared, remote, reader, writer, session.clone()).await;
    session.cancel();

    shared.peers.send_modify(|peers| {
        peers.remove(&remote);
    });
    debug!(topic = %shared.topic.fmt_short(), peer = %remote.fmt_short(), "Peer disconnected");
    result
}

async fn handshake<R, W>(
    shared: &Shared,
    remote: PublicKey,
    reader: &mut Reader<R>,
    writer: &mut FramedWrite<W, FrameCodec<Message>>,
) -> MeshResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let fail = |reason: &str| MeshError::Handshake {
        peer: remote,
        reason: reason.to_string(),
    };

    let challenge: [u8; CHALLENGE_SIZE] = rand::random();
    writer
        .send(Message::Hello {
            peer_key: shared.local_peer,
            topic: shared.topic,
            challenge,
        })
        .await?;

    let their_challenge = match reader.next().await.transpose()? {
        Some(Message::Hello {
            peer_key,
            topic,
            challenge,
        }) => {
            if peer_key != remote {
                return Err(fail("peer key does not match the connection"));
            }
            if topic != shared.topic {
                return Err(fail("topic mismatch"));
            }
            challenge
        }
        Some(_) => return Err(fail("expected hello")),
        None => return Err(fail("connection closed")),
    };

    let signature = shared
        .keyring
        .sign(&shared.local_peer, &auth_payload(&shared.topic, &their_challenge))
        .await?;
    writer.send(Message::Auth { signature }).await?;

    match reader.next().await.transpose()? {
        Some(Message::Auth { signature }) => {
            if !verify(&remote, &auth_payload(&shared.topic, &challenge), &signature) {
                return Err(fail("bad signature"));
            }
        }
        Some(_) => return Err(fail("expected auth")),
        None => return Err(fail("connection closed")),
    }
    Ok(())
}

async fn replicate<R, W>(
    shared: &Arc<Shared>,
    remote: PublicKey,
    mut reader: Reader<R>,
    writer: FramedWrite<W, FrameCodec<Message>>,
    cancel: CancellationToken,
) -> MeshResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let mut tasks = JoinSet::new();
    tasks.spawn(write_loop(writer, control_rx, data_rx, cancel.clone()));

    // Subscribe before announcing so no addition falls in between.
    let mut added = shared.feed_added.subscribe();
    let announced: Vec<(PublicKey, u64)> = shared
        .feeds
        .lock()
        .await
        .values()
        .map(|feed| (feed.key(), feed.length()))
        .collect();
    let _ = control_tx.send(Message::Feeds { feeds: announced });

    let mut state = SessionState {
        remote,
        remote_feeds: HashSet::new(),
        requested: HashSet::new(),
        rerequested: HashMap::new(),
        sending: HashMap::new(),
        control_tx,
        data_tx,
    };

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = reader.next() => match frame {
                Some(Ok(message)) => state.handle(shared, message, &mut tasks, &cancel).await,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
            feed = added.recv() => match feed {
                Ok(feed) => state.announce(feed).await,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let feeds: Vec<Feed> = shared.feeds.lock().await.values().cloned().collect();
                    for feed in feeds {
                        state.announce(feed).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    cancel.cancel();
    tasks.shutdown().await;
    result
}

struct SessionState {
    remote: PublicKey,
    /// Feeds the peer told us about
    remote_feeds: HashSet<PublicKey>,
    /// Feeds we asked the peer to stream
    requested: HashSet<PublicKey>,
    /// Local length at the last repeated request, per feed
    rerequested: HashMap<PublicKey, u64>,
    /// Feeds we stream to the peer
    sending: HashMap<PublicKey, AbortHandle>,
    control_tx: mpsc::UnboundedSender<Message>,
    data_tx: mpsc::Sender<Message>,
}

impl SessionState {
    async fn handle(
        &mut self,
        shared: &Arc<Shared>,
        message: Message,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        match message {
            Message::Feeds { feeds } => {
                for (key, _) in feeds {
                    self.remote_has(shared, key).await;
                }
            }
            Message::Have { feed, .. } => self.remote_has(shared, feed).await,
            Message::Request { feed, from } => {
                let Some(local) = shared.feed(&feed).await else {
                    trace!(feed = %feed.fmt_short(), "Request for unknown feed");
                    return;
                };
                // A repeated request restarts the stream at the new position.
                if let Some(previous) = self.sending.remove(&feed) {
                    previous.abort();
                }
                trace!(peer = %self.remote.fmt_short(), feed = %feed.fmt_short(), from, "Streaming feed");
                let handle = tasks.spawn(send_feed(local, from, self.data_tx.clone(), cancel.clone()));
                self.sending.insert(feed, handle);
            }
            Message::Data { feed, entry } => {
                let Some(local) = shared.feed(&feed).await else {
                    trace!(feed = %feed.fmt_short(), "Data for unknown feed");
                    return;
                };
                let seq = entry.seq;
                match local.insert_replicated(entry).await {
                    Ok(InsertOutcome::Rejected) => {
                        warn!(
                            peer = %self.remote.fmt_short(),
                            feed = %feed.fmt_short(),
                            seq,
                            "Dropping entry with invalid signature"
                        );
                        self.rerequest(&local);
                    }
                    Ok(InsertOutcome::Conflict) => warn!(
                        peer = %self.remote.fmt_short(),
                        feed = %feed.fmt_short(),
                        seq,
                        "Dropping conflicting entry"
                    ),
                    // Entries arrive in order, so a gap means one was lost.
                    Ok(InsertOutcome::Buffered) => {
                        trace!(feed = %feed.fmt_short(), seq, "Buffered entry past a gap");
                        self.rerequest(&local);
                    }
                    Ok(outcome) => trace!(feed = %feed.fmt_short(), seq, ?outcome, "Replicated entry"),
                    Err(e) => warn!(feed = %feed.fmt_short(), seq, "Failed to store entry: {}", e),
                }
            }
            Message::Hello { .. } | Message::Auth { .. } => {
                warn!(peer = %self.remote.fmt_short(), "Ignoring handshake message after handshake");
            }
        }
    }

    /// The peer replicates `key`. Ask for what we are missing.
    async fn remote_has(&mut self, shared: &Shared, key: PublicKey) {
        self.remote_feeds.insert(key);
        if let Some(local) = shared.feed(&key).await {
            self.request(&local);
        }
    }

    fn request(&mut self, feed: &Feed) {
        if feed.is_writable() || !self.remote_feeds.contains(&feed.key()) {
            return;
        }
        if self.requested.insert(feed.key()) {
            let _ = self.control_tx.send(Message::Request {
                feed: feed.key(),
                from: feed.length(),
            });
        }
    }

    /// Ask the peer to stream `feed` again from the local length. At most
    /// once per length, so a peer serving a bad entry cannot loop us.
    fn rerequest(&mut self, feed: &Feed) {
        let key = feed.key();
        if !self.requested.contains(&key) {
            return;
        }
        let from = feed.length();
        if self.rerequested.insert(key, from) == Some(from) {
            return;
        }
        debug!(peer = %self.remote.fmt_short(), feed = %key.fmt_short(), from, "Requesting feed again");
        let _ = self.control_tx.send(Message::Request { feed: key, from });
    }

    /// A feed was added locally.
    async fn announce(&mut self, feed: Feed) {
        let _ = self.control_tx.send(Message::Have {
            feed: feed.key(),
            length: feed.length(),
        });
        self.request(&feed);
    }
}

/// Stream `feed` from `from` onwards until the feed closes or the session
/// ends.
async fn send_feed(
    feed: Feed,
    from: u64,
    data_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let key = feed.key();
    let mut entries = Box::pin(feed.read_from(from));
    loop {
        let entry = tokio::select! {
            entry = entries.next() => entry,
            _ = cancel.cancelled() => return,
        };
        let Some(entry) = entry else {
            return;
        };
        if data_tx.send(Message::Data { feed: key, entry }).await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec<Message>>,
    mut control_rx: mpsc::UnboundedReceiver<Message>,
    mut data_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(message) = control_rx.recv() => message,
            Some(message) = data_rx.recv() => message,
            else => break,
        };
        if let Err(e) = writer.send(message).await {
            debug!("Session write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
    let _ = writer.close().await;
}
