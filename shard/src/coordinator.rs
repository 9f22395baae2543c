//! Transfer orchestration
//!
//! # Same-shard transfers
//!
//! Lock `{from, to}` in canonical order, get `Transfer(from, to, amount)`
//! decided, apply, release. An overdraft is decided like any other operation
//! and applied as a rejection, so every replica agrees on it.
//!
//! # Cross-shard transfers
//!
//! The shard owning `from` coordinates:
//!
//! ```text
//! record(Preparing) → Prepare(from, -amount) locally, Prepare(to, +amount) remotely
//!   both promised  → record(Committing) → Commit debit → Commit credit (or Abort it
//!                                          when the debit was rejected at apply time)
//!   otherwise      → Abort both
//! ```
//!
//! The two sides are prepared in canonical account order, the order every
//! same-shard operation locks in, so transfers running in opposite directions
//! between two shards never wait on each other in a cycle.
//!
//! Each side's `SignedAdjustment` is decided by that shard's replica group
//! before it is applied. The in-flight record lets [`TransferCoordinator::recover`]
//! finish the protocol after a crash: `Preparing` aborts, `Committing`
//! re-proposes the debit (operation ids make it idempotent) and resolves the
//! credit according to its outcome. The debit always commits first, so the
//! credit side is never applied alone.
//!
//! Every call to another shard is bounded by the participant timeout. A
//! prepare that times out counts as refused and the transfer aborts.

use crate::{router::ShardRouter, shard::Shard, Error, Result};
use dashmap::DashMap;
use ledger_core::{AccountId, Amount, InFlightTransfer, Operation, ShardId, TransferPhase};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Default bound on a single call to another shard
pub const DEFAULT_PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(5);

/// One endpoint of a cross-shard transfer
#[derive(Debug, Clone, Copy)]
enum Side {
    Debit,
    Credit,
}

/// Transfer entry point of a shard replica
pub struct TransferCoordinator {
    shard: Arc<Shard>,
    router: Arc<dyn ShardRouter>,
    participant_timeout: Duration,
    /// Cross-shard transfers being driven right now, skipped by recovery
    active: DashMap<Uuid, ()>,
}

impl std::fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("shard", &self.shard.id())
            .field("participant_timeout", &self.participant_timeout)
            .field("active", &self.active.len())
            .finish()
    }
}

impl TransferCoordinator {
    /// Coordinator for `shard`, reaching other shards through `router`
    pub fn new(shard: Arc<Shard>, router: Arc<dyn ShardRouter>) -> Self {
        Self {
            shard,
            router,
            participant_timeout: DEFAULT_PARTICIPANT_TIMEOUT,
            active: DashMap::new(),
        }
    }

    /// Bound every call to another shard by `timeout`
    pub fn with_participant_timeout(mut self, timeout: Duration) -> Self {
        self.participant_timeout = timeout;
        self
    }

    /// Local shard
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Move `amount` from `from` to `to`.
    ///
    /// `Ok(false)` covers every rejection: wrong shard, bad amount,
    /// insufficient funds, a refused prepare. `Err` means the outcome could not
    /// be decided (for example no quorum); a cross-shard transfer left in that
    /// state is finished by [`recover`](Self::recover).
    pub async fn transfer(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<bool> {
        let started = Instant::now();
        let result = self.route(from, to, amount).await;

        let metrics = self.shard.metrics();
        metrics
            .transfer_duration
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(committed) => metrics.record_transfer(*committed),
            Err(_) => metrics.record_failure(),
        }
        result
    }

    async fn route(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<bool> {
        if amount <= 0 {
            warn!(shard = %self.shard.id(), from = %from, to = %to, amount, "Transfer rejected: amount must be positive");
            return Ok(false);
        }
        if let Err(e) = self.shard.check_owned(&from) {
            warn!(error = %e, "Transfer rejected");
            return Ok(false);
        }
        let Some(to_shard) = self.shard.map().shard_of(&to) else {
            warn!(shard = %self.shard.id(), from = %from, "Transfer rejected: empty destination account");
            return Ok(false);
        };

        if to_shard == self.shard.id() {
            self.transfer_local(from, to, amount).await
        } else {
            self.transfer_cross(from, to, to_shard, amount).await
        }
    }

    async fn transfer_local(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<bool> {
        let locks = self.shard.locks().acquire([&from, &to]).await;
        let result = self
            .shard
            .execute(Operation::transfer(from.clone(), to.clone(), amount))
            .await;
        locks.release();

        let outcome = result?;
        if outcome.is_applied() {
            info!(shard = %self.shard.id(), from = %from, to = %to, amount, "Transfer committed");
        } else {
            warn!(shard = %self.shard.id(), from = %from, to = %to, amount, "Transfer rejected: insufficient funds");
        }
        Ok(outcome.is_applied())
    }

    async fn transfer_cross(
        &self,
        from: AccountId,
        to: AccountId,
        to_shard: ShardId,
        amount: Amount,
    ) -> Result<bool> {
        let mut record = InFlightTransfer {
            txn_id: Uuid::now_v7(),
            from,
            to,
            to_shard,
            amount,
            phase: TransferPhase::Preparing,
        };

        self.active.insert(record.txn_id, ());
        let result = self.two_phase(&mut record).await;
        self.active.remove(&record.txn_id);
        result
    }

    async fn two_phase(&self, record: &mut InFlightTransfer) -> Result<bool> {
        self.shard.storage().put_in_flight(record)?;
        info!(
            txn_id = %record.txn_id,
            from = %record.from,
            to = %record.to,
            to_shard = %record.to_shard,
            amount = record.amount,
            "Cross-shard transfer started"
        );

        let (first, second) = if record.from <= record.to {
            (Side::Debit, Side::Credit)
        } else {
            (Side::Credit, Side::Debit)
        };

        let first = self.prepare_side(record, first).await;
        let second = match first {
            Ok(true) => self.prepare_side(record, second).await,
            _ => Ok(false),
        };

        match (first, second) {
            (Ok(true), Ok(true)) => {
                record.phase = TransferPhase::Committing;
                self.shard.storage().put_in_flight(record)?;
                self.commit(record).await
            }
            (first, second) => {
                self.abort(record).await?;
                first?;
                second?;
                Ok(false)
            }
        }
    }

    async fn prepare_side(&self, record: &InFlightTransfer, side: Side) -> Result<bool> {
        match side {
            Side::Debit => {
                self.shard
                    .prepare(record.txn_id, record.from.clone(), -record.amount)
                    .await
            }
            Side::Credit => {
                self.bounded(
                    "prepare",
                    record.to_shard,
                    self.router
                        .prepare(record.to_shard, record.txn_id, record.to.clone(), record.amount),
                )
                .await
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: &str,
        shard: ShardId,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.participant_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::Rpc(format!(
                "{} on shard {} timed out after {:?}",
                call, shard, self.participant_timeout
            ))),
        }
    }

    /// Commit the debit, then resolve the credit by the debit's outcome
    async fn commit(&self, record: &InFlightTransfer) -> Result<bool> {
        let debited = self
            .shard
            .commit(record.txn_id, record.from.clone(), -record.amount)
            .await?;

        if debited {
            let credited = self
                .bounded(
                    "commit",
                    record.to_shard,
                    self.router
                        .commit(record.to_shard, record.txn_id, record.to.clone(), record.amount),
                )
                .await?;
            if !credited {
                warn!(txn_id = %record.txn_id, to = %record.to, "Credit side reported a rejected adjustment");
            }
        } else {
            warn!(txn_id = %record.txn_id, from = %record.from, "Debit rejected at apply time, aborting credit");
            self.bounded(
                "abort",
                record.to_shard,
                self.router.abort(record.to_shard, record.txn_id, record.to.clone()),
            )
            .await?;
        }

        self.shard.storage().remove_in_flight(record.txn_id)?;
        self.shard.metrics().record_cross_shard(debited);
        info!(txn_id = %record.txn_id, committed = debited, "Cross-shard transfer resolved");
        Ok(debited)
    }

    async fn abort(&self, record: &InFlightTransfer) -> Result<()> {
        self.shard.abort(record.txn_id, record.from.clone())?;
        self.bounded(
            "abort",
            record.to_shard,
            self.router.abort(record.to_shard, record.txn_id, record.to.clone()),
        )
        .await?;

        self.shard.storage().remove_in_flight(record.txn_id)?;
        self.shard.metrics().record_cross_shard(false);
        info!(txn_id = %record.txn_id, "Cross-shard transfer aborted");
        Ok(())
    }

    /// Finish every cross-shard transfer left unresolved by a crash or an
    /// unavailable participant. Returns how many were resolved.
    pub async fn recover(&self) -> Result<usize> {
        let mut resolved = 0;

        for record in self.shard.storage().in_flight_transfers()? {
            if self.active.insert(record.txn_id, ()).is_some() {
                continue;
            }

            let result = match record.phase {
                TransferPhase::Preparing => self.abort(&record).await.map(|_| false),
                TransferPhase::Committing => self.commit(&record).await,
            };
            self.active.remove(&record.txn_id);

            match result {
                Ok(committed) => {
                    resolved += 1;
                    self.shard.metrics().recovered.inc();
                    info!(txn_id = %record.txn_id, phase = ?record.phase, committed, "Recovered in-flight transfer");
                }
                Err(e) => {
                    warn!(txn_id = %record.txn_id, phase = ?record.phase, error = %e, "Recovery attempt failed, will retry");
                }
            }
        }

        Ok(resolved)
    }

    /// Run [`recover`](Self::recover) every `interval`
    pub fn spawn_recovery(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.recover().await {
                    warn!(error = %e, "Recovery sweep failed");
                }
            }
        })
    }
}
