//! Tessel Service
//!
//! Wires the keyring, feed store, metadata store, identity manager,
//! replication and invitations of one device into a [`ServiceContext`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessel_core::{logging, Config};
//! use tessel_mesh::MemoryNetwork;
//! use tessel_service::ServiceContext;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_file("tessel.toml")?;
//! logging::init_from_config(&config.logging);
//!
//! let ctx = ServiceContext::open(config, Arc::new(MemoryNetwork::new())).await?;
//! if ctx.identity_record().await.is_none() {
//!     ctx.create_identity().await?;
//! }
//! ctx.ready().await?;
//! let space = ctx.create_space().await?;
//! space.write_data(b"hello".to_vec()).await?;
//! ctx.close().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
mod replication;

pub use context::ServiceContext;
