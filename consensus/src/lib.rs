//! Multi-slot Paxos for a shard's replica group
//!
//! Each replica runs one [`ConsensusPeer`]. Every state-changing operation is
//! proposed into a log slot; a slot is decided once a strict majority of
//! replicas accepts the same value, and every replica applies decided slots in
//! order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                ConsensusPeer::propose                 │
//! │   lowest undecided slot → Prepare → Accept → Learn   │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ PeerTransport (RPC / in-process)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                 Acceptor (every replica)              │
//! │   per-slot InstanceState, persisted before replying  │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                PaxosStore (RocksDB)                   │
//! │   min_proposal / accepted_proposal / accepted_value  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Safety
//!
//! - Proposal numbers are `round * peer_count + node_id`, unique across nodes
//! - A proposer that sees a previously accepted value must propose it
//! - Promises and acceptances are durable before the reply leaves the node;
//!   a failed write poisons the peer instead of answering
//!
//! Only crash faults are tolerated.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod acceptor;
pub mod config;
pub mod error;
pub mod local;
pub mod messages;
pub mod peer;
pub mod persistence;
pub mod state;
pub mod transport;

// Re-exports
pub use acceptor::Acceptor;
pub use config::ConsensusConfig;
pub use error::{Error, Result};
pub use messages::{AcceptReply, AcceptRequest, LearnRequest, PrepareReply, PrepareRequest};
pub use peer::ConsensusPeer;
pub use persistence::{MemoryPaxosStore, PaxosStore, PersistedState, RocksPaxosStore};
pub use state::InstanceState;
pub use transport::PeerTransport;

use serde::{de::DeserializeOwned, Serialize};

/// Replica index within its group, `0..peer_count`
pub type NodeId = u32;

/// Proposal number; `0` means "none"
pub type Ballot = u64;

/// Log position
pub type Slot = u64;

/// Anything a replica group can agree on
pub trait Value:
    Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Value for T where
    T: Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
