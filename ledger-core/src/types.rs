//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode), so every replica decodes a decided
//!   operation identically
//! - Exact arithmetic (integer balances)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Signed balance / amount in minor units
pub type Amount = i64;

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upper-cased first character, used for shard routing
    pub fn routing_char(&self) -> Option<char> {
        self.0.chars().next().map(|c| c.to_ascii_uppercase())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Shard identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition of the key space by first character.
///
/// Each split point `(c, shard)` assigns every routing character `>= c` (up to
/// the next split point) to `shard`. The first split point must start at
/// `'\0'`, which makes the ranges exhaustive; strictly increasing split points
/// make them non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    splits: Vec<(char, ShardId)>,
}

impl ShardMap {
    /// Build a shard map from ordered split points
    pub fn new(splits: Vec<(char, ShardId)>) -> Result<Self> {
        match splits.first() {
            Some(('\0', _)) => {}
            _ => {
                return Err(Error::Config(
                    "shard map must start at '\\0' to cover the whole key space".to_string(),
                ))
            }
        }

        if splits.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(Error::Config(
                "shard map split points must be strictly increasing".to_string(),
            ));
        }

        Ok(Self { splits })
    }

    /// Shard owning `account`, `None` for an empty id
    pub fn shard_of(&self, account: &AccountId) -> Option<ShardId> {
        let c = account.routing_char()?;
        self.splits
            .iter()
            .rev()
            .find(|(start, _)| *start <= c)
            .map(|(_, shard)| *shard)
    }

    /// Whether `account` falls inside `shard`'s range
    pub fn belongs_to_shard(&self, account: &AccountId, shard: ShardId) -> bool {
        self.shard_of(account) == Some(shard)
    }

    /// All shards named by the map
    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.splits.iter().map(|(_, shard)| *shard)
    }
}

impl Default for ShardMap {
    /// Two shards: `[..M]` and `[N..]`
    fn default() -> Self {
        Self {
            splits: vec![('\0', ShardId(1)), ('N', ShardId(2))],
        }
    }
}

/// A state change agreed on by a shard's replica group.
///
/// This is the value type decided by each consensus slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Same-shard transfer
    Transfer {
        /// Operation id
        id: Uuid,
        /// Debited account
        from: AccountId,
        /// Credited account
        to: AccountId,
        /// Positive amount
        amount: Amount,
    },

    /// One side of a committed cross-shard transfer, or a balance set by `Put`
    /// expressed relative to the balance it replaces
    SignedAdjustment {
        /// Cross-shard transfer id
        txn_id: Uuid,
        /// Adjusted account
        account: AccountId,
        /// Negative for the debit side, positive for the credit side
        delta: Amount,
    },
}

impl Operation {
    /// New same-shard transfer with a fresh id
    pub fn transfer(from: AccountId, to: AccountId, amount: Amount) -> Self {
        Operation::Transfer {
            id: Uuid::now_v7(),
            from,
            to,
            amount,
        }
    }

    /// Unique id, used to apply the operation at most once
    pub fn id(&self) -> Uuid {
        match self {
            Operation::Transfer { id, .. } => *id,
            Operation::SignedAdjustment { txn_id, .. } => *txn_id,
        }
    }

    /// Accounts touched by the operation
    pub fn accounts(&self) -> Vec<&AccountId> {
        match self {
            Operation::Transfer { from, to, .. } => vec![from, to],
            Operation::SignedAdjustment { account, .. } => vec![account],
        }
    }
}

/// Result of applying a decided operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// Balances were updated
    Applied,
    /// Decided, but rejected for insufficient funds; no balance changed
    Rejected,
}

impl ApplyOutcome {
    /// Whether balances were updated
    pub fn is_applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Persisted part of a participant's pending two-phase entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedEntry {
    /// Cross-shard transfer id
    pub txn_id: Uuid,
    /// Locked account
    pub account: AccountId,
    /// Signed amount pending application
    pub delta: Amount,
    /// Whether the balance covered the debit at prepare time
    pub covered: bool,
}

/// Coordinator progress of a cross-shard transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    /// Prepares sent, no decision yet
    Preparing,
    /// Both sides promised; the decision is commit
    Committing,
}

/// Coordinator record of a cross-shard transfer not yet fully resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightTransfer {
    /// Transfer id
    pub txn_id: Uuid,
    /// Debited account (coordinator's shard)
    pub from: AccountId,
    /// Credited account (counterpart shard)
    pub to: AccountId,
    /// Counterpart shard
    pub to_shard: ShardId,
    /// Positive amount
    pub amount: Amount,
    /// Current phase
    pub phase: TransferPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_map_splits_at_n() {
        let map = ShardMap::default();
        assert_eq!(map.shard_of(&"Alice".into()), Some(ShardId(1)));
        assert_eq!(map.shard_of(&"Mallory".into()), Some(ShardId(1)));
        assert_eq!(map.shard_of(&"Nadia".into()), Some(ShardId(2)));
        assert_eq!(map.shard_of(&"Zelda".into()), Some(ShardId(2)));
    }

    #[test]
    fn test_routing_is_case_insensitive_and_exhaustive() {
        let map = ShardMap::default();
        assert_eq!(map.shard_of(&"alice".into()), Some(ShardId(1)));
        assert_eq!(map.shard_of(&"zelda".into()), Some(ShardId(2)));
        assert_eq!(map.shard_of(&"42".into()), Some(ShardId(1)));
        assert_eq!(map.shard_of(&"~tilde".into()), Some(ShardId(2)));
        assert_eq!(map.shard_of(&"".into()), None);
    }

    #[test]
    fn test_belongs_to_shard() {
        let map = ShardMap::default();
        assert!(map.belongs_to_shard(&"Bob".into(), ShardId(1)));
        assert!(!map.belongs_to_shard(&"Xander".into(), ShardId(1)));
        assert!(!map.belongs_to_shard(&"".into(), ShardId(1)));
    }

    #[test]
    fn test_shard_map_validation() {
        assert!(ShardMap::new(vec![('A', ShardId(1))]).is_err());
        assert!(ShardMap::new(vec![('\0', ShardId(1)), ('N', ShardId(2)), ('N', ShardId(3))]).is_err());
        let map = ShardMap::new(vec![('\0', ShardId(1)), ('H', ShardId(2)), ('Q', ShardId(3))]).unwrap();
        assert_eq!(map.shard_of(&"Kim".into()), Some(ShardId(2)));
        assert_eq!(map.shards().count(), 3);
    }

    #[test]
    fn test_operation_id_and_accounts() {
        let op = Operation::transfer("Alice".into(), "Bob".into(), 10);
        assert_eq!(op.accounts().len(), 2);

        let txn_id = Uuid::now_v7();
        let adj = Operation::SignedAdjustment {
            txn_id,
            account: "Alice".into(),
            delta: -10,
        };
        assert_eq!(adj.id(), txn_id);
    }
}
