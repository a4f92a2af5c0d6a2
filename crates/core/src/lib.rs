//! Core functionality for the Tessel replication and trust layer.
//!
//! This crate provides the fundamental types, traits, and utilities used
//! across the Tessel crates: public key identifiers, timeframes, the
//! storage abstraction, configuration, and logging.

pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod storage;
pub mod timeframe;
pub mod trigger;

pub use config::Config;
pub use error::{CoreError, Result, StorageError, StorageResult};
pub use keys::PublicKey;
pub use storage::{create_storage, Directory, File, FileStat, FsDirectory, MemoryDirectory};
pub use timeframe::Timeframe;
pub use trigger::Trigger;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
