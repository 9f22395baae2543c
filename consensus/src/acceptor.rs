//! Acceptor side of the protocol
//!
//! Holds the per-slot ballot state and the decided log of one replica. All
//! ballot state is mutated under one guard and persisted before the reply is
//! built. A failed write poisons the acceptor: it answers every later request
//! with [`Error::Poisoned`] rather than risk a promise it could forget.

use crate::{
    error::{Error, Result},
    messages::{AcceptReply, AcceptRequest, LearnRequest, PrepareReply, PrepareRequest},
    persistence::PaxosStore,
    state::InstanceState,
    Ballot, NodeId, Slot, Value,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Acceptor and learner state of one replica
pub struct Acceptor<V: Value> {
    node_id: NodeId,
    store: Arc<dyn PaxosStore<V>>,
    instances: Mutex<BTreeMap<Slot, InstanceState<V>>>,
    decided: Mutex<BTreeMap<Slot, V>>,
    poisoned: AtomicBool,
    /// Length of the contiguous decided prefix
    decided_prefix: watch::Sender<Slot>,
}

impl<V: Value> std::fmt::Debug for Acceptor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("node_id", &self.node_id)
            .field("decided_prefix", &*self.decided_prefix.borrow())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl<V: Value> Acceptor<V> {
    /// Restore the acceptor from `store`; nothing is served before this returns
    pub fn open(node_id: NodeId, store: Arc<dyn PaxosStore<V>>) -> Result<Self> {
        let persisted = store.load(node_id)?.unwrap_or_default();

        if !persisted.instances.is_empty() || !persisted.decided.is_empty() {
            info!(
                node_id,
                instances = persisted.instances.len(),
                decided = persisted.decided.len(),
                "Restored ballot state"
            );
        }

        let prefix = contiguous_prefix(&persisted.decided, 0);
        let (decided_prefix, _) = watch::channel(prefix);

        Ok(Self {
            node_id,
            store,
            instances: Mutex::new(persisted.instances),
            decided: Mutex::new(persisted.decided),
            poisoned: AtomicBool::new(false),
            decided_prefix,
        })
    }

    /// Replica id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Whether a persistence failure stopped this acceptor
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Fail fast once poisoned
    pub fn ensure_healthy(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::Poisoned {
                node_id: self.node_id,
            });
        }
        Ok(())
    }

    fn poison(&self, slot: Slot, err: Error) -> Error {
        self.poisoned.store(true, Ordering::SeqCst);
        error!(node_id = self.node_id, slot, error = %err, "Ballot state write failed, refusing further consensus traffic");
        Error::Persistence(err.to_string())
    }

    /// Highest `min_proposal` across every slot
    pub fn highest_promised(&self) -> Ballot {
        self.instances
            .lock()
            .values()
            .map(|state| state.min_proposal)
            .max()
            .unwrap_or(0)
    }

    /// Ballot state of `slot`
    pub fn instance(&self, slot: Slot) -> InstanceState<V> {
        self.instances.lock().get(&slot).cloned().unwrap_or_default()
    }

    /// Handle phase 1a
    pub fn handle_prepare(&self, request: PrepareRequest) -> Result<PrepareReply<V>> {
        self.ensure_healthy()?;
        let decided = self.decided(request.slot);

        let mut instances = self.instances.lock();
        let current = instances.get(&request.slot).cloned().unwrap_or_default();

        match current.on_prepare(request.ballot) {
            Some(next) => {
                self.store
                    .save(self.node_id, request.slot, &next)
                    .map_err(|e| self.poison(request.slot, e))?;

                debug!(
                    node_id = self.node_id,
                    slot = request.slot,
                    ballot = request.ballot,
                    from = request.node_id,
                    "Promised"
                );

                let reply = PrepareReply {
                    promise: true,
                    highest_seen: next.min_proposal,
                    accepted: next.accepted(),
                    decided,
                };
                instances.insert(request.slot, next);
                Ok(reply)
            }
            None => {
                debug!(
                    node_id = self.node_id,
                    slot = request.slot,
                    ballot = request.ballot,
                    highest_seen = current.min_proposal,
                    "Rejected stale prepare"
                );

                Ok(PrepareReply {
                    promise: false,
                    highest_seen: current.min_proposal,
                    accepted: None,
                    decided,
                })
            }
        }
    }

    /// Handle phase 2a
    pub fn handle_accept(&self, request: AcceptRequest<V>) -> Result<AcceptReply> {
        self.ensure_healthy()?;

        let mut instances = self.instances.lock();
        let current = instances.get(&request.slot).cloned().unwrap_or_default();

        match current.on_accept(request.ballot, request.value) {
            Some(next) => {
                self.store
                    .save(self.node_id, request.slot, &next)
                    .map_err(|e| self.poison(request.slot, e))?;

                debug!(
                    node_id = self.node_id,
                    slot = request.slot,
                    ballot = request.ballot,
                    from = request.node_id,
                    "Accepted"
                );

                let reply = AcceptReply {
                    accepted: true,
                    highest_seen: next.min_proposal,
                };
                instances.insert(request.slot, next);
                Ok(reply)
            }
            None => {
                debug!(
                    node_id = self.node_id,
                    slot = request.slot,
                    ballot = request.ballot,
                    highest_seen = current.min_proposal,
                    "Rejected stale accept"
                );

                Ok(AcceptReply {
                    accepted: false,
                    highest_seen: current.min_proposal,
                })
            }
        }
    }

    /// Handle a decision broadcast
    pub fn handle_learn(&self, request: LearnRequest<V>) -> Result<()> {
        self.learn(request.slot, request.value)
    }

    /// Record `value` as decided for `slot` (idempotent)
    pub fn learn(&self, slot: Slot, value: V) -> Result<()> {
        self.ensure_healthy()?;

        let mut decided = self.decided.lock();
        if let Some(existing) = decided.get(&slot) {
            if *existing != value {
                error!(node_id = self.node_id, slot, "Conflicting decision reported");
                return Err(Error::ConflictingDecision { slot });
            }
            return Ok(());
        }

        self.store
            .save_decided(self.node_id, slot, &value)
            .map_err(|e| self.poison(slot, e))?;
        decided.insert(slot, value);

        let prefix = contiguous_prefix(&decided, *self.decided_prefix.borrow());
        self.decided_prefix.send_replace(prefix);

        if prefix <= slot {
            warn!(node_id = self.node_id, slot, prefix, "Learned slot beyond a gap");
        }
        Ok(())
    }

    /// Decided value of `slot`
    pub fn decided(&self, slot: Slot) -> Option<V> {
        self.decided.lock().get(&slot).cloned()
    }

    /// Lowest slot not yet known decided
    pub fn first_undecided(&self) -> Slot {
        *self.decided_prefix.borrow()
    }

    /// Watch the length of the contiguous decided prefix
    pub fn subscribe(&self) -> watch::Receiver<Slot> {
        self.decided_prefix.subscribe()
    }
}

fn contiguous_prefix<V>(decided: &BTreeMap<Slot, V>, from: Slot) -> Slot {
    let mut prefix = from;
    while decided.contains_key(&prefix) {
        prefix += 1;
    }
    prefix
}
