//! Tessel Mesh - feed replication between authenticated peers
//!
//! Peers that share a topic (a space key) find each other through a
//! [`NetworkManager`], prove their device keys to each other, and then keep
//! the feeds they both know in sync.
//!
//! # Core Components
//!
//! - **Network seam**: [`NetworkManager`] hands out byte channels per topic;
//!   [`MemoryNetwork`] connects peers inside one process
//! - **Framing**: [`FrameCodec`], length-prefixed postcard frames
//! - **Space Protocol**: [`SpaceProtocol`], one authenticated session per
//!   peer with continuous per-feed streaming
//!
//! # Guarantees
//!
//! 1. A peer is listed in [`SpaceProtocol::peers`] only after it signed a
//!    fresh challenge with the key it claims
//! 2. Every received entry is verified against its feed key before it is
//!    stored; a bad entry is dropped and the session continues
//! 3. Entries reach a reader in seq order with no gaps
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessel_core::config::ReplicationConfig;
//! use tessel_crypto::Keyring;
//! use tessel_mesh::{MemoryNetwork, SpaceProtocol};
//!
//! # async fn run(topic: tessel_core::PublicKey) -> Result<(), Box<dyn std::error::Error>> {
//! let keyring = Arc::new(Keyring::new());
//! let device = keyring.create_key().await?;
//! let protocol = SpaceProtocol::new(
//!     topic,
//!     device,
//!     keyring,
//!     Arc::new(MemoryNetwork::new()),
//!     ReplicationConfig::default(),
//! );
//! protocol.start().await?;
//! println!("Connected peers: {:?}", protocol.peers());
//! protocol.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod message;
pub mod network;
pub mod protocol;
mod session;

pub use codec::FrameCodec;
pub use error::{MeshError, MeshResult};
pub use message::Message;
pub use network::{Connection, MemoryNetwork, NetworkManager, Transport};
pub use protocol::SpaceProtocol;
