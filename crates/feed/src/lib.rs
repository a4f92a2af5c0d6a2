//! Append-only, owner-signed feeds.
//!
//! A feed is an ordered log of entries identified by a public key. Exactly
//! one peer holds the secret half and may append; every other copy is a
//! read-only replica filled by replication. Every entry is verified against
//! the feed key before it is stored, and again before it is handed to a
//! reader, so consumers only ever observe entries signed by the feed owner.
//!
//! # Ordering
//!
//! Entries are numbered from zero. Readers see a contiguous prefix of the
//! log and wait for the next missing entry; they never skip. Replicated
//! entries that arrive ahead of the local length are buffered until the
//! gap is filled.

pub mod entry;
pub mod error;
pub mod feed;
pub mod store;

pub use entry::FeedEntry;
pub use error::{FeedError, FeedResult};
pub use feed::{Feed, FeedStatus, InsertOutcome};
pub use store::{FeedOptions, FeedStore};
