//! Feed entries and their signing payload.

use serde::{Deserialize, Serialize};
use tessel_core::PublicKey;
use tessel_crypto::{verify, Signature};

const DOMAIN: &[u8] = b"tessel.feed.v1";

/// One signed entry of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Position in the feed, starting at zero
    pub seq: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Owner signature over [`signing_bytes`]
    pub signature: Signature,
}

/// Bytes covered by an entry signature: domain tag, feed key, seq, payload.
pub fn signing_bytes(feed_key: &PublicKey, seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DOMAIN.len() + 32 + 8 + payload.len());
    buf.extend_from_slice(DOMAIN);
    buf.extend_from_slice(feed_key.as_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

impl FeedEntry {
    /// True if the entry is signed by the owner of `feed_key`.
    pub fn verify(&self, feed_key: &PublicKey) -> bool {
        verify(
            feed_key,
            &signing_bytes(feed_key, self.seq, &self.payload),
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_crypto::KeyPair;

    #[test]
    fn test_signature_binds_feed_and_seq() {
        let owner = KeyPair::generate();
        let sig = owner
            .sign(&signing_bytes(&owner.public_key, 3, b"data"))
            .unwrap();
        let entry = FeedEntry {
            seq: 3,
            payload: b"data".to_vec(),
            signature: sig,
        };
        assert!(entry.verify(&owner.public_key));

        let moved = FeedEntry { seq: 4, ..entry.clone() };
        assert!(!moved.verify(&owner.public_key));

        let other = KeyPair::generate().public_key;
        assert!(!entry.verify(&other));
    }
}
