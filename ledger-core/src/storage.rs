//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `balances` - Account balances (key: account id)
//! - `applied` - Outcome of every applied operation (key: operation id)
//! - `prepared` - Pending two-phase entries of this participant (key: account id)
//! - `aborted` - Cross-shard transfers this participant aborted (key: txn id)
//! - `in_flight` - Unresolved cross-shard transfers coordinated here (key: txn id)
//! - `meta` - Apply cursor (next slot to apply)
//!
//! Balance changes from the decided log are written in one `WriteBatch`
//! together with the operation outcome and the advanced cursor, so a crash
//! never leaves a half-applied operation or applies one twice.

use crate::{
    error::{Error, Result},
    types::{AccountId, Amount, ApplyOutcome, InFlightTransfer, Operation, PreparedEntry},
    Config,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_APPLIED: &str = "applied";
const CF_PREPARED: &str = "prepared";
const CF_ABORTED: &str = "aborted";
const CF_IN_FLIGHT: &str = "in_flight";
const CF_META: &str = "meta";

const KEY_APPLY_CURSOR: &[u8] = b"apply_cursor";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_APPLIED, Options::default()),
            ColumnFamilyDescriptor::new(CF_PREPARED, Options::default()),
            ColumnFamilyDescriptor::new(CF_ABORTED, Options::default()),
            ColumnFamilyDescriptor::new(CF_IN_FLIGHT, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger storage");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf_options_balances() -> Options {
        let mut opts = Options::default();
        // Balances are read on every transfer, keep lookups cheap
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    // Balance operations

    /// Balance of `account`, `None` if it was never written
    pub fn balance(&self, account: &AccountId) -> Result<Option<Amount>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(cf, account.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the balance of `account`
    pub fn put_balance(&self, account: &AccountId, balance: Amount) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, account.as_str().as_bytes(), bincode::serialize(&balance)?);
        self.write(batch)?;

        tracing::debug!(account = %account, balance, "Balance written");
        Ok(())
    }

    /// Every account with its balance
    pub fn balances(&self) -> Result<Vec<(AccountId, Amount)>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Storage(format!("Corrupt account key: {}", e)))?;
            accounts.push((AccountId::new(id), bincode::deserialize(&value)?));
        }
        Ok(accounts)
    }

    // Decided log application

    /// Next slot to apply
    pub fn apply_cursor(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, KEY_APPLY_CURSOR)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(0),
        }
    }

    /// Outcome of a previously applied operation
    pub fn outcome(&self, operation_id: Uuid) -> Result<Option<ApplyOutcome>> {
        let cf = self.cf_handle(CF_APPLIED)?;
        match self.db.get_cf(cf, operation_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Apply the operation decided in `slot` (atomic).
    ///
    /// `slot` must equal the apply cursor. An operation id that was already
    /// applied in an earlier slot only advances the cursor and returns the
    /// recorded outcome.
    pub fn apply_operation(&self, slot: u64, operation: &Operation) -> Result<ApplyOutcome> {
        let cursor = self.apply_cursor()?;
        if slot != cursor {
            return Err(Error::InvariantViolation(format!(
                "apply out of order: slot {} but cursor is {}",
                slot, cursor
            )));
        }

        let cf_balances = self.cf_handle(CF_BALANCES)?;
        let cf_applied = self.cf_handle(CF_APPLIED)?;
        let cf_meta = self.cf_handle(CF_META)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_meta, KEY_APPLY_CURSOR, bincode::serialize(&(slot + 1))?);

        if let Some(previous) = self.outcome(operation.id())? {
            self.write(batch)?;
            tracing::debug!(slot, operation_id = %operation.id(), "Duplicate operation skipped");
            return Ok(previous);
        }

        let outcome = match operation {
            Operation::Transfer { from, to, amount, .. } => {
                let from_balance = self.balance(from)?.unwrap_or(0);
                let to_balance = self.balance(to)?.unwrap_or(0);
                let debited = from_balance.checked_sub(*amount);
                let credited = to_balance.checked_add(*amount);

                match (debited, credited) {
                    _ if *amount <= 0 || from_balance < *amount => ApplyOutcome::Rejected,
                    _ if from == to => ApplyOutcome::Applied,
                    (Some(debited), Some(credited)) => {
                        batch.put_cf(cf_balances, from.as_str().as_bytes(), bincode::serialize(&debited)?);
                        batch.put_cf(cf_balances, to.as_str().as_bytes(), bincode::serialize(&credited)?);
                        ApplyOutcome::Applied
                    }
                    _ => ApplyOutcome::Rejected,
                }
            }

            Operation::SignedAdjustment { account, delta, .. } => {
                let balance = self.balance(account)?.unwrap_or(0);
                match balance.checked_add(*delta) {
                    Some(adjusted) if adjusted >= 0 => {
                        batch.put_cf(cf_balances, account.as_str().as_bytes(), bincode::serialize(&adjusted)?);
                        ApplyOutcome::Applied
                    }
                    _ => ApplyOutcome::Rejected,
                }
            }
        };

        batch.put_cf(cf_applied, operation.id().as_bytes(), bincode::serialize(&outcome)?);
        self.write(batch)?;

        tracing::debug!(slot, operation_id = %operation.id(), ?outcome, "Operation applied");
        Ok(outcome)
    }

    // Two-phase participant state

    /// Persist a pending prepare
    pub fn put_prepared(&self, entry: &PreparedEntry) -> Result<()> {
        let cf = self.cf_handle(CF_PREPARED)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, entry.account.as_str().as_bytes(), bincode::serialize(entry)?);
        self.write(batch)
    }

    /// Drop the pending prepare on `account`
    pub fn remove_prepared(&self, account: &AccountId) -> Result<()> {
        let cf = self.cf_handle(CF_PREPARED)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, account.as_str().as_bytes());
        self.write(batch)
    }

    /// All pending prepares (restored on open)
    pub fn prepared_entries(&self) -> Result<Vec<PreparedEntry>> {
        let cf = self.cf_handle(CF_PREPARED)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Drop the pending prepare of `entry` and remember its transfer as aborted
    pub fn abort_prepared(&self, entry: &PreparedEntry) -> Result<()> {
        let cf_prepared = self.cf_handle(CF_PREPARED)?;
        let cf_aborted = self.cf_handle(CF_ABORTED)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_prepared, entry.account.as_str().as_bytes());
        batch.put_cf(cf_aborted, entry.txn_id.as_bytes(), b"");
        self.write(batch)
    }

    /// Remember `txn_id` as aborted without a prepare to drop
    pub fn put_aborted(&self, txn_id: Uuid) -> Result<()> {
        let cf = self.cf_handle(CF_ABORTED)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, txn_id.as_bytes(), b"");
        self.write(batch)
    }

    /// Whether `txn_id` was aborted on this participant
    pub fn is_aborted(&self, txn_id: Uuid) -> Result<bool> {
        let cf = self.cf_handle(CF_ABORTED)?;
        Ok(self.db.get_pinned_cf(cf, txn_id.as_bytes())?.is_some())
    }

    // Coordinator state

    /// Persist a coordinator record
    pub fn put_in_flight(&self, transfer: &InFlightTransfer) -> Result<()> {
        let cf = self.cf_handle(CF_IN_FLIGHT)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, transfer.txn_id.as_bytes(), bincode::serialize(transfer)?);
        self.write(batch)
    }

    /// Drop a resolved coordinator record
    pub fn remove_in_flight(&self, txn_id: Uuid) -> Result<()> {
        let cf = self.cf_handle(CF_IN_FLIGHT)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, txn_id.as_bytes());
        self.write(batch)
    }

    /// All unresolved coordinator records
    pub fn in_flight_transfers(&self) -> Result<Vec<InFlightTransfer>> {
        let cf = self.cf_handle(CF_IN_FLIGHT)?;
        let mut transfers = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            transfers.push(bincode::deserialize(&value)?);
        }
        Ok(transfers)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("Ledger storage closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ShardId, TransferPhase};
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (config, temp_dir)
    }

    fn alice() -> AccountId {
        AccountId::new("Alice")
    }

    fn bob() -> AccountId {
        AccountId::new("Bob")
    }

    #[test]
    fn test_balance_roundtrip() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        assert_eq!(storage.balance(&alice()).unwrap(), None);
        storage.put_balance(&alice(), 100).unwrap();
        assert_eq!(storage.balance(&alice()).unwrap(), Some(100));
    }

    #[test]
    fn test_apply_transfer() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.put_balance(&alice(), 100).unwrap();
        storage.put_balance(&bob(), 0).unwrap();

        let op = Operation::transfer(alice(), bob(), 50);
        assert_eq!(storage.apply_operation(0, &op).unwrap(), ApplyOutcome::Applied);
        assert_eq!(storage.balance(&alice()).unwrap(), Some(50));
        assert_eq!(storage.balance(&bob()).unwrap(), Some(50));
        assert_eq!(storage.apply_cursor().unwrap(), 1);
        assert_eq!(storage.outcome(op.id()).unwrap(), Some(ApplyOutcome::Applied));
    }

    #[test]
    fn test_apply_rejects_overdraft() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.put_balance(&alice(), 100).unwrap();

        let op = Operation::transfer(alice(), bob(), 150);
        assert_eq!(storage.apply_operation(0, &op).unwrap(), ApplyOutcome::Rejected);
        assert_eq!(storage.balance(&alice()).unwrap(), Some(100));
        assert_eq!(storage.balance(&bob()).unwrap(), None);
        // A rejected operation still consumes its slot
        assert_eq!(storage.apply_cursor().unwrap(), 1);
    }

    #[test]
    fn test_apply_out_of_order_is_refused() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let op = Operation::transfer(alice(), bob(), 1);
        let err = storage.apply_operation(3, &op).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_duplicate_operation_applied_once() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.put_balance(&alice(), 100).unwrap();

        let adj = Operation::SignedAdjustment {
            txn_id: Uuid::now_v7(),
            account: alice(),
            delta: -30,
        };
        assert_eq!(storage.apply_operation(0, &adj).unwrap(), ApplyOutcome::Applied);
        assert_eq!(storage.apply_operation(1, &adj).unwrap(), ApplyOutcome::Applied);
        assert_eq!(storage.balance(&alice()).unwrap(), Some(70));
        assert_eq!(storage.apply_cursor().unwrap(), 2);
    }

    #[test]
    fn test_negative_adjustment_cannot_overdraw() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        storage.put_balance(&alice(), 10).unwrap();

        let adj = Operation::SignedAdjustment {
            txn_id: Uuid::now_v7(),
            account: alice(),
            delta: -11,
        };
        assert_eq!(storage.apply_operation(0, &adj).unwrap(), ApplyOutcome::Rejected);
        assert_eq!(storage.balance(&alice()).unwrap(), Some(10));
    }

    #[test]
    fn test_state_survives_reopen() {
        let (config, _temp) = test_config();
        let txn_id = Uuid::now_v7();
        {
            let storage = Storage::open(&config).unwrap();
            storage.put_balance(&alice(), 5).unwrap();
            storage
                .put_prepared(&PreparedEntry {
                    txn_id,
                    account: alice(),
                    delta: -5,
                    covered: true,
                })
                .unwrap();
            storage
                .put_in_flight(&InFlightTransfer {
                    txn_id,
                    from: alice(),
                    to: AccountId::new("Zelda"),
                    to_shard: ShardId(2),
                    amount: 5,
                    phase: TransferPhase::Preparing,
                })
                .unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.balance(&alice()).unwrap(), Some(5));
        assert_eq!(storage.prepared_entries().unwrap().len(), 1);
        assert_eq!(storage.in_flight_transfers().unwrap()[0].txn_id, txn_id);

        storage.remove_prepared(&alice()).unwrap();
        storage.remove_in_flight(txn_id).unwrap();
        assert!(storage.prepared_entries().unwrap().is_empty());
        assert!(storage.in_flight_transfers().unwrap().is_empty());
    }

    #[test]
    fn test_aborted_transfers_are_remembered() {
        let (config, _temp) = test_config();
        let txn_id = Uuid::now_v7();
        let unmatched = Uuid::now_v7();

        {
            let storage = Storage::open(&config).unwrap();
            let entry = PreparedEntry {
                txn_id,
                account: alice(),
                delta: 7,
                covered: true,
            };
            storage.put_prepared(&entry).unwrap();
            assert!(!storage.is_aborted(txn_id).unwrap());

            storage.abort_prepared(&entry).unwrap();
            storage.put_aborted(unmatched).unwrap();
            assert!(storage.prepared_entries().unwrap().is_empty());
            storage.close().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert!(storage.is_aborted(txn_id).unwrap());
        assert!(storage.is_aborted(unmatched).unwrap());
        assert!(!storage.is_aborted(Uuid::now_v7()).unwrap());
    }
}
