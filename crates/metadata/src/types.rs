//! Catalog record types.

use serde::{Deserialize, Serialize};
use tessel_core::{PublicKey, Timeframe};

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

/// Whether a space is being replicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceState {
    #[default]
    Active,
    Inactive,
}

/// Catalog entry for a space and the feeds that belong to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMetadata {
    pub key: PublicKey,
    pub genesis_feed_key: PublicKey,
    /// Feeds admitted after genesis, in admission order
    pub additional_feed_keys: Vec<PublicKey>,
    /// Progress of credential processing over the control feeds
    pub control_timeframe: Timeframe,
    /// Progress of the consuming layer over data feeds
    pub data_timeframe: Timeframe,
    pub state: SpaceState,
}

impl SpaceMetadata {
    /// Fresh entry with only the genesis feed.
    pub fn new(key: PublicKey, genesis_feed_key: PublicKey) -> Self {
        Self {
            key,
            genesis_feed_key,
            additional_feed_keys: Vec::new(),
            control_timeframe: Timeframe::new(),
            data_timeframe: Timeframe::new(),
            state: SpaceState::Active,
        }
    }

    /// Genesis feed followed by every additional feed.
    pub fn feed_keys(&self) -> impl Iterator<Item = PublicKey> + '_ {
        std::iter::once(self.genesis_feed_key).chain(self.additional_feed_keys.iter().copied())
    }
}

/// Durable bootstrap facts for this device's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_key: PublicKey,
    pub device_key: PublicKey,
    pub halo_space_key: PublicKey,
    pub halo_genesis_feed_key: PublicKey,
}

/// How an invitation's guest proves it is the intended one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationKind {
    /// Guest must present the code shown on the host
    Interactive,
    /// Admission is pre-authorized for a known guest key
    Offline,
}

/// An invitation this device is hosting, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationRecord {
    pub invitation_id: PublicKey,
    pub kind: InvitationKind,
    /// Rendezvous topic the host listens on
    pub swarm_key: PublicKey,
    /// Text-encoded descriptor handed to the guest
    pub encoded: String,
    pub created: u64,
    pub lifetime_ms: u64,
}

impl InvitationRecord {
    /// True once `now` (epoch millis) is past the record's lifetime.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.created.saturating_add(self.lifetime_ms)
    }
}

/// Everything persisted in the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub version: u32,
    pub spaces: Vec<SpaceMetadata>,
    pub identity: Option<IdentityRecord>,
    pub invitations: Vec<InvitationRecord>,
    /// Epoch millis of first save
    pub created: u64,
    /// Epoch millis of last save
    pub updated: u64,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            spaces: Vec::new(),
            identity: None,
            invitations: Vec::new(),
            created: 0,
            updated: 0,
        }
    }
}
