//! Error types for consensus

use crate::{NodeId, Slot};
use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus errors
#[derive(Error, Debug)]
pub enum Error {
    /// Fewer than a majority promised or accepted, retries exhausted
    #[error("No quorum for slot {slot} after {attempts} attempts")]
    NoQuorum {
        /// Slot that could not be decided
        slot: Slot,
        /// Rounds tried
        attempts: u32,
    },

    /// Durable write of ballot state failed
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Peer stopped answering after a persistence failure
    #[error("Peer {node_id} is poisoned after a persistence failure")]
    Poisoned {
        /// Poisoned replica
        node_id: NodeId,
    },

    /// A second, different value was reported decided for a slot
    #[error("Conflicting decision for slot {slot}")]
    ConflictingDecision {
        /// Affected slot
        slot: Slot,
    },

    /// Peer unreachable or RPC failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer did not answer in time
    #[error("Peer RPC timed out")]
    Timeout,

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
