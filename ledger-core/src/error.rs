//! Error types for the ledger

use crate::types::{AccountId, Amount, ShardId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Account key outside the shard's owned range
    #[error("Account {account} is not owned by shard {shard}")]
    WrongShard {
        /// Offending account
        account: AccountId,
        /// Shard that rejected it
        shard: ShardId,
    },

    /// Debit exceeds the available balance
    #[error("Insufficient funds in {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Debited account
        account: AccountId,
        /// Balance at the time of the check
        balance: Amount,
        /// Amount that was requested
        requested: Amount,
    },

    /// Invalid amount or account id
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invariant violation (apply order, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

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
