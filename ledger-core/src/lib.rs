//! Sharded Ledger Core
//!
//! Account state, key ownership and the per-account locking discipline shared by
//! every replica of a shard.
//!
//! # Architecture
//!
//! - **Key ownership**: the key space is split into contiguous, non-overlapping
//!   shard ranges by the first character of an account id
//! - **Ordered locking**: multi-account operations lock accounts in canonical
//!   order, so overlapping operations never deadlock
//! - **Ordered apply**: balances change only by applying decided operations in
//!   slot order, atomically with the apply cursor
//!
//! # Invariants
//!
//! - Conservation: a same-shard transfer never changes the sum of balances
//! - No overdraft: a committed debit never drives a balance negative
//! - Exactly once: an operation id is applied at most once per replica

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod locks;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use locks::{AccountLocks, LockManager};
pub use storage::Storage;
pub use types::{
    AccountId, Amount, ApplyOutcome, InFlightTransfer, Operation, PreparedEntry, ShardId,
    ShardMap, TransferPhase,
};
