//! Invitation descriptors.
//!
//! A descriptor carries everything a guest needs to find the host and
//! start the handshake. It is self-verifying: `hash` covers every other
//! field, so a descriptor altered after creation is refused on decode,
//! before the guest touches the network.
//!
//! The text form is `"tinv"` followed by lowercase unpadded base32 of the
//! postcard encoding.

use crate::error::{InvitationError, InvitationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tessel_core::PublicKey;
pub use tessel_metadata::InvitationKind;

/// Text prefix of encoded descriptors.
pub const KIND: &str = "tinv";

const HASH_DOMAIN: &[u8] = b"tessel.invitation.v1";

/// What the guest is admitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationTarget {
    /// Another device of the host's identity
    Device,
    /// A member of a space
    Space,
}

/// Out-of-band invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationDescriptor {
    pub invitation_id: PublicKey,
    pub kind: InvitationKind,
    pub target: InvitationTarget,
    /// Topic host and guest meet on
    pub swarm_key: PublicKey,
    pub identity_key: Option<PublicKey>,
    pub space_key: Option<PublicKey>,
    pub guest_key: Option<PublicKey>,
    /// Creation time, Unix epoch millis
    pub created: u64,
    pub hash: [u8; 32],
}

#[derive(Serialize)]
struct Canonical<'a> {
    invitation_id: &'a PublicKey,
    kind: InvitationKind,
    target: InvitationTarget,
    swarm_key: &'a PublicKey,
    identity_key: &'a Option<PublicKey>,
    space_key: &'a Option<PublicKey>,
    guest_key: &'a Option<PublicKey>,
    created: u64,
}

impl InvitationDescriptor {
    /// Build a descriptor and seal it with its hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invitation_id: PublicKey,
        kind: InvitationKind,
        target: InvitationTarget,
        swarm_key: PublicKey,
        identity_key: Option<PublicKey>,
        space_key: Option<PublicKey>,
        guest_key: Option<PublicKey>,
        created: u64,
    ) -> InvitationResult<Self> {
        let mut descriptor = Self {
            invitation_id,
            kind,
            target,
            swarm_key,
            identity_key,
            space_key,
            guest_key,
            created,
            hash: [0; 32],
        };
        descriptor.hash = descriptor.compute_hash()?;
        Ok(descriptor)
    }

    fn compute_hash(&self) -> InvitationResult<[u8; 32]> {
        let body = postcard::to_stdvec(&Canonical {
            invitation_id: &self.invitation_id,
            kind: self.kind,
            target: self.target,
            swarm_key: &self.swarm_key,
            identity_key: &self.identity_key,
            space_key: &self.space_key,
            guest_key: &self.guest_key,
            created: self.created,
        })?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(&body);
        Ok(*hasher.finalize().as_bytes())
    }

    /// Recompute the hash and check the fields are consistent.
    pub fn verify(&self) -> InvitationResult<()> {
        if self.compute_hash()? != self.hash {
            return Err(InvitationError::Tampered);
        }
        if self.kind == InvitationKind::Offline && self.guest_key.is_none() {
            return Err(InvitationError::InvalidDescriptor(
                "offline invitation without guest key".to_string(),
            ));
        }
        match self.target {
            InvitationTarget::Device if self.identity_key.is_none() => Err(
                InvitationError::InvalidDescriptor("device invitation without identity key".to_string()),
            ),
            InvitationTarget::Space if self.space_key.is_none() => Err(
                InvitationError::InvalidDescriptor("space invitation without space key".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_bytes(&self) -> InvitationResult<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Decode and verify.
    pub fn from_bytes(bytes: &[u8]) -> InvitationResult<Self> {
        let descriptor: Self = postcard::from_bytes(bytes)
            .map_err(|e| InvitationError::InvalidDescriptor(e.to_string()))?;
        descriptor.verify()?;
        Ok(descriptor)
    }

    /// Text form.
    pub fn encode(&self) -> InvitationResult<String> {
        let mut out = KIND.to_string();
        data_encoding::BASE32_NOPAD.encode_append(&self.to_bytes()?, &mut out);
        Ok(out.to_ascii_lowercase())
    }

    /// Parse and verify the text form.
    pub fn decode(text: &str) -> InvitationResult<Self> {
        let Some(rest) = text.trim().strip_prefix(KIND) else {
            return Err(InvitationError::InvalidDescriptor(format!(
                "expected prefix {}",
                KIND
            )));
        };
        let bytes = data_encoding::BASE32_NOPAD
            .decode(rest.to_ascii_uppercase().as_bytes())
            .map_err(|e| InvitationError::InvalidDescriptor(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for InvitationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl FromStr for InvitationDescriptor {
    type Err = InvitationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
