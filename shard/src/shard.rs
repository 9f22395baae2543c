//! One replica of a shard
//!
//! Every balance change follows the same path: lock the touched accounts,
//! get the operation decided by the replica group, apply the decided log in
//! slot order, release. The decided log is also applied in the background as
//! slots are learned from other replicas.
//!
//! The participant side of two-phase commit lives here too. A successful
//! `prepare` keeps the account lock inside a [`PendingTwoPhase`] entry until
//! the matching `commit` or `abort` arrives; the entry is persisted and
//! restored, lock included, when the replica reopens. An abort is remembered
//! by transaction id, so a prepare delivered after its abort is refused.

use crate::{error::Result, metrics::ShardMetrics, Error};
use consensus::ConsensusPeer;
use dashmap::DashMap;
use ledger_core::{
    AccountId, AccountLocks, Amount, ApplyOutcome, LockManager, Operation, PreparedEntry, ShardId,
    ShardMap, Storage,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A prepared cross-shard adjustment waiting for its resolution
#[derive(Debug)]
pub struct PendingTwoPhase {
    entry: PreparedEntry,
    locks: AccountLocks,
}

impl PendingTwoPhase {
    /// Persisted part of the entry
    pub fn entry(&self) -> &PreparedEntry {
        &self.entry
    }
}

/// Shard replica state
pub struct Shard {
    id: ShardId,
    map: ShardMap,
    storage: Storage,
    locks: LockManager,
    consensus: Arc<ConsensusPeer<Operation>>,
    pending: DashMap<AccountId, PendingTwoPhase>,
    /// Orders a prepare's final check against a concurrent abort
    resolution: parking_lot::Mutex<()>,
    /// Commits in progress, keyed by transfer id
    committing: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Serializes appliers of the decided log
    apply_guard: Mutex<()>,
    metrics: ShardMetrics,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("node_id", &self.consensus.node_id())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Shard {
    /// Open the replica: catch up on the decided log and restore prepared entries
    pub async fn open(
        id: ShardId,
        map: ShardMap,
        storage: Storage,
        consensus: Arc<ConsensusPeer<Operation>>,
        metrics: ShardMetrics,
    ) -> Result<Arc<Self>> {
        if !map.shards().any(|shard| shard == id) {
            return Err(Error::Config(format!("shard {} owns no key range", id)));
        }

        let shard = Self {
            id,
            map,
            storage,
            locks: LockManager::new(),
            consensus,
            pending: DashMap::new(),
            resolution: parking_lot::Mutex::new(()),
            committing: DashMap::new(),
            apply_guard: Mutex::new(()),
            metrics,
        };

        let cursor = shard.apply_decided().await?;
        shard.restore_prepared()?;

        info!(
            shard = %id,
            node_id = shard.consensus.node_id(),
            cursor,
            pending = shard.pending.len(),
            "Shard opened"
        );
        Ok(Arc::new(shard))
    }

    fn restore_prepared(&self) -> Result<()> {
        for entry in self.storage.prepared_entries()? {
            // Resolved before the crash, only the cleanup was lost
            if self.is_resolved(entry.txn_id)? {
                self.storage.remove_prepared(&entry.account)?;
                debug!(shard = %self.id, txn_id = %entry.txn_id, "Dropped resolved prepared entry");
                continue;
            }

            let locks = self.locks.try_acquire([&entry.account]).ok_or_else(|| {
                ledger_core::Error::InvariantViolation(format!(
                    "two prepared entries for account {}",
                    entry.account
                ))
            })?;

            info!(shard = %self.id, txn_id = %entry.txn_id, account = %entry.account, delta = entry.delta, "Restored prepared entry");
            self.pending
                .insert(entry.account.clone(), PendingTwoPhase { entry, locks });
        }
        Ok(())
    }

    /// Whether `txn_id` was already committed or aborted here
    fn is_resolved(&self, txn_id: Uuid) -> Result<bool> {
        Ok(self.storage.outcome(txn_id)?.is_some() || self.storage.is_aborted(txn_id)?)
    }

    /// Apply newly learned slots as soon as they are decided
    pub fn spawn_applier(self: &Arc<Self>) -> JoinHandle<()> {
        let shard = Arc::downgrade(self);
        let mut decided = self.consensus.subscribe();

        tokio::spawn(async move {
            while decided.changed().await.is_ok() {
                let Some(shard) = shard.upgrade() else {
                    break;
                };
                if let Err(e) = shard.apply_decided().await {
                    error!(shard = %shard.id, error = %e, "Failed to apply decided slots");
                }
            }
        })
    }

    // Accessors

    /// Shard id
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Key map of the deployment
    pub fn map(&self) -> &ShardMap {
        &self.map
    }

    /// Ledger storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Per-account locks
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Consensus endpoint of this replica
    pub fn consensus(&self) -> &Arc<ConsensusPeer<Operation>> {
        &self.consensus
    }

    /// Metrics collector
    pub fn metrics(&self) -> &ShardMetrics {
        &self.metrics
    }

    /// Whether `account` falls in this shard's key range
    pub fn owns(&self, account: &AccountId) -> bool {
        self.map.belongs_to_shard(account, self.id)
    }

    /// Reject accounts outside the key range before any lock or consensus work
    pub fn check_owned(&self, account: &AccountId) -> ledger_core::Result<()> {
        if self.owns(account) {
            Ok(())
        } else {
            Err(ledger_core::Error::WrongShard {
                account: account.clone(),
                shard: self.id,
            })
        }
    }

    /// Prepared entry currently held on `account`
    pub fn pending(&self, account: &AccountId) -> Option<PreparedEntry> {
        self.pending.get(account).map(|p| p.entry().clone())
    }

    // Replicated log

    /// Apply every decided slot not yet applied, in order. Returns the new cursor.
    pub async fn apply_decided(&self) -> Result<u64> {
        let _guard = self.apply_guard.lock().await;

        let mut cursor = self.storage.apply_cursor()?;
        let decided = self.consensus.first_undecided();

        while cursor < decided {
            let operation = self.consensus.decided(cursor).ok_or_else(|| {
                ledger_core::Error::InvariantViolation(format!(
                    "slot {} inside the decided prefix has no value",
                    cursor
                ))
            })?;

            let outcome = self.storage.apply_operation(cursor, &operation)?;
            debug!(shard = %self.id, slot = cursor, operation_id = %operation.id(), ?outcome, "Applied decided slot");
            self.metrics.applied_slots.inc();
            cursor += 1;
        }

        Ok(cursor)
    }

    /// Get `operation` decided and applied; returns its outcome.
    ///
    /// Callers hold the locks of every account the operation touches.
    pub async fn execute(&self, operation: Operation) -> Result<ApplyOutcome> {
        let id = operation.id();
        let slot = self.consensus.propose(operation).await?;
        self.apply_decided().await?;

        let outcome = self.storage.outcome(id)?.ok_or_else(|| {
            ledger_core::Error::InvariantViolation(format!(
                "operation {} decided in slot {} but not applied",
                id, slot
            ))
        })?;
        Ok(outcome)
    }

    // Balance store

    /// Set the balance of `account`
    pub async fn put(&self, account: AccountId, amount: Amount) -> Result<bool> {
        if let Err(e) = self.check_owned(&account) {
            warn!(error = %e, "Put rejected");
            return Ok(false);
        }
        if amount < 0 {
            warn!(shard = %self.id, account = %account, amount, "Put rejected: negative balance");
            return Ok(false);
        }

        let locks = self.locks.acquire([&account]).await;
        let result = self.put_locked(&account, amount).await;
        locks.release();

        let outcome = result?;
        info!(shard = %self.id, account = %account, amount, ?outcome, "Balance set");
        Ok(outcome.is_applied())
    }

    async fn put_locked(&self, account: &AccountId, amount: Amount) -> Result<ApplyOutcome> {
        self.apply_decided().await?;
        let current = self.storage.balance(account)?.unwrap_or(0);

        // Replicated as a relative adjustment so every replica converges
        self.execute(Operation::SignedAdjustment {
            txn_id: Uuid::now_v7(),
            account: account.clone(),
            delta: amount - current,
        })
        .await
    }

    /// Balance of `account`, `0` if it was never set
    pub async fn get(&self, account: &AccountId) -> Result<Amount> {
        self.check_owned(account)?;
        self.apply_decided().await?;
        Ok(self.storage.balance(account)?.unwrap_or(0))
    }

    // Two-phase participant

    /// Reserve `account` for a cross-shard adjustment of `delta`.
    ///
    /// On `true` the account stays locked until [`commit`](Self::commit) or
    /// [`abort`](Self::abort) names the same `txn_id`.
    pub async fn prepare(&self, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        if let Err(e) = self.check_owned(&account) {
            warn!(%txn_id, error = %e, "Prepare rejected");
            return Ok(false);
        }
        if delta == 0 || delta == Amount::MIN {
            warn!(shard = %self.id, %txn_id, account = %account, delta, "Prepare rejected: amount out of range");
            return Ok(false);
        }

        if let Some(pending) = self.pending.get(&account) {
            if pending.entry.txn_id == txn_id {
                debug!(shard = %self.id, %txn_id, account = %account, "Duplicate prepare");
                return Ok(true);
            }
        }

        let locks = self.locks.acquire([&account]).await;
        self.apply_decided().await?;

        // Held until the entry is in `pending`, so an abort either sees the
        // entry or leaves a record this check sees
        let resolution = self.resolution.lock();
        if self.is_resolved(txn_id)? {
            drop(resolution);
            locks.release();
            warn!(shard = %self.id, %txn_id, account = %account, "Prepare for a resolved transfer refused");
            return Ok(false);
        }

        let balance = self.storage.balance(&account)?.unwrap_or(0);
        let covered = delta > 0 || balance >= -delta;
        if !covered {
            drop(resolution);
            locks.release();
            let err = ledger_core::Error::InsufficientFunds {
                account,
                balance,
                requested: -delta,
            };
            warn!(shard = %self.id, %txn_id, error = %err, "Prepare refused");
            return Ok(false);
        }

        let entry = PreparedEntry {
            txn_id,
            account: account.clone(),
            delta,
            covered,
        };
        self.storage.put_prepared(&entry)?;
        self.pending.insert(account.clone(), PendingTwoPhase { entry, locks });
        drop(resolution);

        info!(shard = %self.id, %txn_id, account = %account, delta, "Prepared");
        Ok(true)
    }

    /// Apply the prepared adjustment of `txn_id` and release the account.
    ///
    /// Without a matching prepare this is a no-op that reports the recorded
    /// outcome of `txn_id`: `false` once aborted, `true` when nothing is known.
    /// A commit repeated while the first one is still being decided waits for
    /// it.
    pub async fn commit(&self, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        if let Err(e) = self.check_owned(&account) {
            warn!(%txn_id, error = %e, "Commit rejected");
            return Ok(false);
        }

        let gate = self.committing.entry(txn_id).or_default().clone();
        let turn = gate.lock().await;
        let result = self.commit_prepared(txn_id, account, delta).await;
        drop(turn);

        // Last one out removes the gate; `entry` above cannot clone it meanwhile
        self.committing.remove_if(&txn_id, |_, current| {
            Arc::ptr_eq(current, &gate) && Arc::strong_count(current) == 2
        });
        result
    }

    async fn commit_prepared(&self, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        let Some((_, pending)) = self
            .pending
            .remove_if(&account, |_, pending| pending.entry.txn_id == txn_id)
        else {
            let previous = self.storage.outcome(txn_id)?;
            let aborted = self.storage.is_aborted(txn_id)?;
            warn!(shard = %self.id, %txn_id, account = %account, ?previous, aborted, "Commit without matching prepare, ignoring");
            return Ok(match previous {
                Some(outcome) => outcome.is_applied(),
                None => !aborted,
            });
        };

        if pending.entry.delta != delta {
            let prepared = pending.entry.delta;
            self.pending.insert(account, pending);
            return Err(ledger_core::Error::InvalidRequest(format!(
                "commit of {} for txn {} but {} was prepared",
                delta, txn_id, prepared
            ))
            .into());
        }

        let operation = Operation::SignedAdjustment {
            txn_id,
            account: account.clone(),
            delta,
        };

        match self.execute(operation).await {
            Ok(outcome) => {
                self.storage.remove_prepared(&account)?;
                pending.locks.release();
                info!(shard = %self.id, %txn_id, account = %account, delta, ?outcome, "Committed");
                Ok(outcome.is_applied())
            }
            Err(e) => {
                warn!(shard = %self.id, %txn_id, account = %account, error = %e, "Commit not decided, keeping prepared entry");
                self.pending.insert(account, pending);
                Err(e)
            }
        }
    }

    /// Drop the prepared adjustment of `txn_id` and release the account.
    ///
    /// Without a matching prepare nothing is released, but `txn_id` is still
    /// recorded as aborted so a late prepare for it is refused. An abort never
    /// undoes a transfer already committed here.
    pub fn abort(&self, txn_id: Uuid, account: AccountId) -> Result<bool> {
        if let Err(e) = self.check_owned(&account) {
            warn!(%txn_id, error = %e, "Abort rejected");
            return Ok(false);
        }

        let _resolution = self.resolution.lock();
        match self
            .pending
            .remove_if(&account, |_, pending| pending.entry.txn_id == txn_id)
        {
            Some((_, pending)) => {
                self.storage.abort_prepared(&pending.entry)?;
                pending.locks.release();
                info!(shard = %self.id, %txn_id, account = %account, "Aborted");
            }
            None if self.storage.outcome(txn_id)?.is_some() => {
                warn!(shard = %self.id, %txn_id, account = %account, "Abort of a committed transfer, ignoring");
            }
            None => {
                self.storage.put_aborted(txn_id)?;
                warn!(shard = %self.id, %txn_id, account = %account, "Abort without matching prepare, recorded");
            }
        }
        Ok(true)
    }
}
