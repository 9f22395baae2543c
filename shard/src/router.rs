//! Reaching the participant of another shard

use crate::{shard::Shard, Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use ledger_core::{AccountId, Amount, ShardId};
use std::sync::Arc;
use uuid::Uuid;

/// Two-phase calls to a counterpart shard.
///
/// All calls for one shard go to the same replica, the one holding the
/// prepared entry.
#[async_trait]
pub trait ShardRouter: Send + Sync {
    /// Reserve `account` on `shard` for an adjustment of `delta`
    async fn prepare(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool>;

    /// Apply the prepared adjustment
    async fn commit(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool>;

    /// Drop the prepared adjustment
    async fn abort(&self, shard: ShardId, txn_id: Uuid, account: AccountId) -> Result<bool>;
}

/// In-process router over shards living in the same process
#[derive(Debug, Default)]
pub struct LocalRouter {
    shards: DashMap<ShardId, Arc<Shard>>,
}

impl LocalRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Route two-phase traffic for `shard.id()` to `shard`
    pub fn register(&self, shard: Arc<Shard>) {
        self.shards.insert(shard.id(), shard);
    }

    fn shard(&self, id: ShardId) -> Result<Arc<Shard>> {
        self.shards
            .get(&id)
            .map(|shard| shard.clone())
            .ok_or_else(|| Error::Rpc(format!("no route to shard {}", id)))
    }
}

#[async_trait]
impl ShardRouter for LocalRouter {
    async fn prepare(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        self.shard(shard)?.prepare(txn_id, account, delta).await
    }

    async fn commit(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        self.shard(shard)?.commit(txn_id, account, delta).await
    }

    async fn abort(&self, shard: ShardId, txn_id: Uuid, account: AccountId) -> Result<bool> {
        self.shard(shard)?.abort(txn_id, account)
    }
}
