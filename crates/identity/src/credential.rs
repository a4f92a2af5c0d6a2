//! Credentials: signed authorization assertions carried in control feeds.
//!
//! A credential binds an `issuer` key to an [`Assertion`] about a `subject`.
//! The signature covers a domain tag followed by the postcard encoding of
//! `(issuer, subject, assertion)`.

use crate::error::IdentityResult;
use serde::{Deserialize, Serialize};
use tessel_core::PublicKey;
use tessel_crypto::{verify, KeyPair, Keyring, Signature};

const DOMAIN: &[u8] = b"tessel.credential.v1";

/// The closed set of statements a credential can make.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Assertion {
    /// `device_key` acts on behalf of `identity_key`.
    AuthorizedDevice {
        identity_key: PublicKey,
        device_key: PublicKey,
    },
    /// `feed_key` belongs to the space (or HALO) `space_key`.
    AuthorizedFeed {
        space_key: PublicKey,
        feed_key: PublicKey,
    },
    /// `member_key` may write to and admit others into `space_key`.
    SpaceMember {
        space_key: PublicKey,
        member_key: PublicKey,
    },
}

impl Assertion {
    /// The key this assertion is about.
    pub fn subject(&self) -> PublicKey {
        match self {
            Assertion::AuthorizedDevice { device_key, .. } => *device_key,
            Assertion::AuthorizedFeed { feed_key, .. } => *feed_key,
            Assertion::SpaceMember { member_key, .. } => *member_key,
        }
    }
}

/// A signed assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub issuer: PublicKey,
    pub subject: PublicKey,
    pub assertion: Assertion,
    pub signature: Signature,
}

#[derive(Serialize)]
struct Signed<'a> {
    issuer: &'a PublicKey,
    subject: &'a PublicKey,
    assertion: &'a Assertion,
}

fn signing_bytes(
    issuer: &PublicKey,
    subject: &PublicKey,
    assertion: &Assertion,
) -> IdentityResult<Vec<u8>> {
    let mut buf = DOMAIN.to_vec();
    let body = postcard::to_stdvec(&Signed {
        issuer,
        subject,
        assertion,
    })?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

impl Credential {
    /// Issue `assertion` signed by `issuer`, whose secret the keyring holds.
    pub async fn issue(
        keyring: &Keyring,
        issuer: PublicKey,
        assertion: Assertion,
    ) -> IdentityResult<Self> {
        let subject = assertion.subject();
        let payload = signing_bytes(&issuer, &subject, &assertion)?;
        let signature = keyring.sign(&issuer, &payload).await?;
        Ok(Self {
            issuer,
            subject,
            assertion,
            signature,
        })
    }

    /// Issue `assertion` with a key pair held outside any keyring.
    pub fn issue_with(pair: &KeyPair, assertion: Assertion) -> IdentityResult<Self> {
        let subject = assertion.subject();
        let payload = signing_bytes(&pair.public_key, &subject, &assertion)?;
        let signature = pair.sign(&payload)?;
        Ok(Self {
            issuer: pair.public_key,
            subject,
            assertion,
            signature,
        })
    }

    /// True if the signature matches the issuer and the subject matches
    /// the assertion. Never errors.
    pub fn verify(&self) -> bool {
        if self.subject != self.assertion.subject() {
            return false;
        }
        match signing_bytes(&self.issuer, &self.subject, &self.assertion) {
            Ok(payload) => verify(&self.issuer, &payload, &self.signature),
            Err(_) => false,
        }
    }
}

/// Payload envelope for entries in space and HALO feeds.
///
/// Control processing only inspects `Credential` entries; `Data` payloads
/// are opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMessage {
    Credential(Credential),
    Data(Vec<u8>),
}

impl FeedMessage {
    /// Encode for appending to a feed.
    pub fn encode(&self) -> IdentityResult<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Decode a feed payload.
    pub fn decode(bytes: &[u8]) -> IdentityResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_assertion(identity: &KeyPair, device: &KeyPair) -> Assertion {
        Assertion::AuthorizedDevice {
            identity_key: identity.public_key,
            device_key: device.public_key,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let identity = KeyPair::generate();
        let device = KeyPair::generate();
        let credential =
            Credential::issue_with(&identity, device_assertion(&identity, &device)).unwrap();
        assert_eq!(credential.subject, device.public_key);
        assert!(credential.verify());
    }

    #[test]
    fn test_tampered_credential_fails() {
        let identity = KeyPair::generate();
        let device = KeyPair::generate();
        let mut credential =
            Credential::issue_with(&identity, device_assertion(&identity, &device)).unwrap();

        credential.assertion = Assertion::AuthorizedDevice {
            identity_key: identity.public_key,
            device_key: KeyPair::generate().public_key,
        };
        assert!(!credential.verify());
    }

    #[test]
    fn test_subject_mismatch_fails() {
        let identity = KeyPair::generate();
        let device = KeyPair::generate();
        let mut credential =
            Credential::issue_with(&identity, device_assertion(&identity, &device)).unwrap();
        credential.subject = identity.public_key;
        assert!(!credential.verify());
    }

    #[tokio::test]
    async fn test_keyring_issue_matches() {
        let keyring = Keyring::new();
        let issuer = keyring.create_key().await.unwrap();
        let credential = Credential::issue(
            &keyring,
            issuer,
            Assertion::AuthorizedFeed {
                space_key: issuer,
                feed_key: KeyPair::generate().public_key,
            },
        )
        .await
        .unwrap();
        assert!(credential.verify());

        let message = FeedMessage::Credential(credential.clone());
        let decoded = FeedMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, FeedMessage::Credential(credential));
    }
}
