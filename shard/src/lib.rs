//! Shard service
//!
//! A shard owns one key range of accounts and is replicated over a group of
//! nodes. Each node runs a [`Shard`] (balances, ordered apply of the decided
//! log, two-phase participant) behind a [`TransferCoordinator`] (transfers,
//! cross-shard two-phase commit, recovery).
//!
//! # Request path
//!
//! ```text
//! RPC → ownership check → ordered account locks → consensus → apply → unlock
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shard::{config::NodeConfig, node::Node};
//!
//! #[tokio::main]
//! async fn main() -> shard::Result<()> {
//!     let config = NodeConfig::from_env()?;
//!     let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//!     let node = Node::open(config).await?;
//!     node.serve(listener).await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod node;
pub mod router;
pub mod rpc;
pub mod shard;

// Re-exports
pub use config::NodeConfig;
pub use coordinator::TransferCoordinator;
pub use error::{Error, Result};
pub use metrics::ShardMetrics;
pub use router::{LocalRouter, ShardRouter};
pub use shard::Shard;
