//! Durable ballot state
//!
//! One record per `(node, slot)` holding `min_proposal`, `accepted_proposal`
//! and `accepted_value`, plus the decided value of every slot the node has
//! learned. A write returns only once it is durable; the acceptor persists
//! before replying, so a restarted node never contradicts a promise or an
//! acceptance it made before the crash.

use crate::{
    error::{Error, Result},
    state::InstanceState,
    NodeId, Slot, Value,
};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteOptions, DB};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything a node persisted, as read back on start-up
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState<V> {
    /// Ballot state per slot
    pub instances: BTreeMap<Slot, InstanceState<V>>,
    /// Decided values per slot
    pub decided: BTreeMap<Slot, V>,
}

impl<V> Default for PersistedState<V> {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            decided: BTreeMap::new(),
        }
    }
}

/// Write-ahead store for a peer's ballot state
pub trait PaxosStore<V: Value>: Send + Sync {
    /// Durably overwrite the ballot state of `slot`
    fn save(&self, node_id: NodeId, slot: Slot, state: &InstanceState<V>) -> Result<()>;

    /// Durably record the decided value of `slot`
    fn save_decided(&self, node_id: NodeId, slot: Slot, value: &V) -> Result<()>;

    /// Everything saved for `node_id`, `None` on first run
    fn load(&self, node_id: NodeId) -> Result<Option<PersistedState<V>>>;
}

/// Column family names
const CF_INSTANCES: &str = "paxos_instances";
const CF_DECIDED: &str = "paxos_decided";

/// RocksDB-backed store; every write is fsynced
pub struct RocksPaxosStore {
    db: DB,
}

impl std::fmt::Debug for RocksPaxosStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksPaxosStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksPaxosStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_INSTANCES, Options::default()),
            ColumnFamilyDescriptor::new(CF_DECIDED, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened paxos store");

        Ok(Self { db })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn key(node_id: NodeId, slot: Slot) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..4].copy_from_slice(&node_id.to_be_bytes());
        key[4..].copy_from_slice(&slot.to_be_bytes());
        key
    }

    fn put_sync(&self, cf: &ColumnFamily, key: &[u8], value: &[u8]) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.put_cf_opt(cf, key, value, &opts)?;
        Ok(())
    }

    fn scan<T: serde::de::DeserializeOwned>(
        &self,
        cf: &ColumnFamily,
        node_id: NodeId,
    ) -> Result<BTreeMap<Slot, T>> {
        let prefix = node_id.to_be_bytes();
        let mut entries = BTreeMap::new();

        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let slot_bytes: [u8; 8] = key[4..]
                .try_into()
                .map_err(|_| Error::Storage("Corrupt paxos key".to_string()))?;
            entries.insert(Slot::from_be_bytes(slot_bytes), bincode::deserialize(&value)?);
        }

        Ok(entries)
    }
}

impl<V: Value> PaxosStore<V> for RocksPaxosStore {
    fn save(&self, node_id: NodeId, slot: Slot, state: &InstanceState<V>) -> Result<()> {
        let cf = self.cf_handle(CF_INSTANCES)?;
        self.put_sync(cf, &Self::key(node_id, slot), &bincode::serialize(state)?)
    }

    fn save_decided(&self, node_id: NodeId, slot: Slot, value: &V) -> Result<()> {
        let cf = self.cf_handle(CF_DECIDED)?;
        self.put_sync(cf, &Self::key(node_id, slot), &bincode::serialize(value)?)
    }

    fn load(&self, node_id: NodeId) -> Result<Option<PersistedState<V>>> {
        let instances = self.scan(self.cf_handle(CF_INSTANCES)?, node_id)?;
        let decided = self.scan(self.cf_handle(CF_DECIDED)?, node_id)?;

        if instances.is_empty() && decided.is_empty() {
            return Ok(None);
        }
        Ok(Some(PersistedState { instances, decided }))
    }
}

/// In-memory store that outlives the peers using it.
///
/// Dropping a peer and opening a new one on the same store simulates a crash
/// and restart. Writes can be made to fail on demand.
#[derive(Debug)]
pub struct MemoryPaxosStore<V> {
    states: Mutex<HashMap<NodeId, PersistedState<V>>>,
    failing: AtomicBool,
}

impl<V> Default for MemoryPaxosStore<V> {
    fn default() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }
}

impl<V: Value> MemoryPaxosStore<V> {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl<V: Value> PaxosStore<V> for MemoryPaxosStore<V> {
    fn save(&self, node_id: NodeId, slot: Slot, state: &InstanceState<V>) -> Result<()> {
        self.check_writable()?;
        self.states
            .lock()
            .entry(node_id)
            .or_default()
            .instances
            .insert(slot, state.clone());
        Ok(())
    }

    fn save_decided(&self, node_id: NodeId, slot: Slot, value: &V) -> Result<()> {
        self.check_writable()?;
        self.states
            .lock()
            .entry(node_id)
            .or_default()
            .decided
            .insert(slot, value.clone());
        Ok(())
    }

    fn load(&self, node_id: NodeId) -> Result<Option<PersistedState<V>>> {
        Ok(self.states.lock().get(&node_id).cloned())
    }
}
