//! Error types for the shard service

use thiserror::Error;

/// Result type for shard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Consensus error other than unavailability
    #[error("Consensus error: {0}")]
    Consensus(consensus::Error),

    /// The replica group cannot decide right now
    #[error("Shard unavailable: {0}")]
    Unavailable(String),

    /// Remote call failed
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<consensus::Error> for Error {
    fn from(err: consensus::Error) -> Self {
        match err {
            consensus::Error::NoQuorum { .. }
            | consensus::Error::Poisoned { .. }
            | consensus::Error::Persistence(_) => {
                Error::Unavailable(err.to_string())
            }
            other => Error::Consensus(other),
        }
    }
}
