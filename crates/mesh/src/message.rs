//! Wire messages of the replication session.

use serde::{Deserialize, Serialize};
use tessel_core::PublicKey;
use tessel_crypto::Signature;
use tessel_feed::FeedEntry;

/// Size of the handshake challenge.
pub const CHALLENGE_SIZE: usize = 32;

/// Domain tag for handshake signatures.
pub const AUTH_DOMAIN: &[u8] = b"tessel.auth.v1";

/// Session messages.
///
/// - `Hello`, then `Auth`: mutual authentication, once per connection
/// - `Feeds`: every feed this side replicates on the topic, with its length
/// - `Have`: a feed added or grown after `Feeds`
/// - `Request`: stream entries of `feed` starting at `from`
/// - `Data`: one entry, sent in seq order per feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opening message
    Hello {
        /// Key the sender claims
        peer_key: PublicKey,
        /// Topic the sender joined
        topic: PublicKey,
        /// Random bytes the receiver must sign
        challenge: [u8; CHALLENGE_SIZE],
    },
    /// Answer to the other side's challenge
    Auth {
        /// Signature over the auth payload
        signature: Signature,
    },
    /// Feed announcement
    Feeds {
        /// `(feed key, length)` pairs
        feeds: Vec<(PublicKey, u64)>,
    },
    /// Watermark of a single feed
    Have {
        /// Feed key
        feed: PublicKey,
        /// Local length
        length: u64,
    },
    /// Request entries
    Request {
        /// Feed key
        feed: PublicKey,
        /// First seq wanted
        from: u64,
    },
    /// A feed entry
    Data {
        /// Feed key
        feed: PublicKey,
        /// The signed entry
        entry: FeedEntry,
    },
}

/// Bytes signed to answer `challenge` on `topic`.
pub fn auth_payload(topic: &PublicKey, challenge: &[u8; CHALLENGE_SIZE]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(AUTH_DOMAIN.len() + 32 + CHALLENGE_SIZE);
    buf.extend_from_slice(AUTH_DOMAIN);
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(challenge);
    buf
}
