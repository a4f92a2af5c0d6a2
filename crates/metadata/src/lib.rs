//! Persistent catalog of known spaces and the local identity record.
//!
//! The catalog lives in a single file: a 4-byte little-endian length
//! followed by the postcard-encoded [`StoreMetadata`]. A file whose declared
//! length runs past its end, or whose body does not decode, is reported as
//! [`MetadataError::Corrupted`]; the store then serves an empty catalog and
//! refuses to overwrite the file until [`MetadataStore::clear`] is called.

pub mod error;
pub mod store;
pub mod types;

pub use error::{MetadataError, MetadataResult};
pub use store::MetadataStore;
pub use types::{
    IdentityRecord, InvitationKind, InvitationRecord, SpaceMetadata, SpaceState, StoreMetadata,
    STORE_VERSION,
};
