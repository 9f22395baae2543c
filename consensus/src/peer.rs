//! Proposer side of the protocol
//!
//! ```text
//! Idle → Preparing → (Promised | Rejected) → Accepting → (Accepted | Rejected) → Decided
//! ```
//!
//! A proposal is driven into the lowest slot this peer does not yet know to be
//! decided. If a different value wins that slot (an earlier proposer's
//! acceptance, or a concurrent proposer), the peer learns it and moves on to
//! the next slot until its own value is decided somewhere.

use crate::{
    acceptor::Acceptor,
    config::ConsensusConfig,
    error::{Error, Result},
    messages::{AcceptReply, AcceptRequest, LearnRequest, PrepareReply, PrepareRequest},
    persistence::PaxosStore,
    transport::PeerTransport,
    Ballot, NodeId, Slot, Value,
};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One replica's consensus endpoint
pub struct ConsensusPeer<V: Value> {
    node_id: NodeId,
    peer_count: u32,
    acceptor: Acceptor<V>,
    transport: Arc<dyn PeerTransport<V>>,
    config: ConsensusConfig,
    /// Highest ballot issued or observed
    max_seen: AtomicU64,
}

impl<V: Value> std::fmt::Debug for ConsensusPeer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusPeer")
            .field("node_id", &self.node_id)
            .field("peer_count", &self.peer_count)
            .field("acceptor", &self.acceptor)
            .finish()
    }
}

impl<V: Value> ConsensusPeer<V> {
    /// Open a peer, reloading persisted ballot state first
    pub fn open(
        node_id: NodeId,
        peer_count: u32,
        store: Arc<dyn PaxosStore<V>>,
        transport: Arc<dyn PeerTransport<V>>,
        config: ConsensusConfig,
    ) -> Result<Self> {
        if peer_count == 0 || node_id >= peer_count {
            return Err(Error::Config(format!(
                "node id {} outside a group of {} peers",
                node_id, peer_count
            )));
        }

        let acceptor = Acceptor::open(node_id, store)?;
        let max_seen = AtomicU64::new(acceptor.highest_promised());

        Ok(Self {
            node_id,
            peer_count,
            acceptor,
            transport,
            config,
            max_seen,
        })
    }

    /// Replica id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Group size, including this peer
    pub fn peer_count(&self) -> u32 {
        self.peer_count
    }

    /// Whether a persistence failure stopped this peer
    pub fn is_poisoned(&self) -> bool {
        self.acceptor.is_poisoned()
    }

    /// Local acceptor state
    pub fn acceptor(&self) -> &Acceptor<V> {
        &self.acceptor
    }

    // Inbound RPCs

    /// Serve a peer's Prepare
    pub fn handle_prepare(&self, request: PrepareRequest) -> Result<PrepareReply<V>> {
        self.observe(request.ballot);
        self.acceptor.handle_prepare(request)
    }

    /// Serve a peer's Accept
    pub fn handle_accept(&self, request: AcceptRequest<V>) -> Result<AcceptReply> {
        self.observe(request.ballot);
        self.acceptor.handle_accept(request)
    }

    /// Serve a peer's decision broadcast
    pub fn handle_learn(&self, request: LearnRequest<V>) -> Result<()> {
        self.acceptor.handle_learn(request)
    }

    // Decided log

    /// Decided value of `slot`
    pub fn decided(&self, slot: Slot) -> Option<V> {
        self.acceptor.decided(slot)
    }

    /// Lowest slot not yet known decided
    pub fn first_undecided(&self) -> Slot {
        self.acceptor.first_undecided()
    }

    /// Watch the length of the contiguous decided prefix
    pub fn subscribe(&self) -> watch::Receiver<Slot> {
        self.acceptor.subscribe()
    }

    // Proposer

    fn is_quorum(&self, votes: u32) -> bool {
        votes > self.peer_count / 2
    }

    fn observe(&self, ballot: Ballot) {
        self.max_seen.fetch_max(ballot, Ordering::SeqCst);
    }

    /// Next proposal number: unique to this node and above anything seen
    fn next_ballot(&self) -> Ballot {
        let n = u64::from(self.peer_count);
        let id = u64::from(self.node_id);
        let step = |seen: Ballot| (seen / n + 1) * n + id;

        // fetch_update never fails when the closure always returns Some
        let previous = self
            .max_seen
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seen| Some(step(seen)))
            .unwrap_or_else(|seen| seen);
        step(previous)
    }

    /// Get `value` decided in some slot and return that slot.
    ///
    /// Fails with [`Error::NoQuorum`] when a slot cannot gather a majority
    /// within the configured attempts.
    pub async fn propose(&self, value: V) -> Result<Slot> {
        self.acceptor.ensure_healthy()?;

        loop {
            let slot = self.acceptor.first_undecided();
            let chosen = self.decide(slot, &value).await?;

            self.acceptor.learn(slot, chosen.clone())?;
            self.broadcast_learn(slot, &chosen).await;

            if chosen == value {
                info!(node_id = self.node_id, slot, "Value decided");
                return Ok(slot);
            }
            debug!(node_id = self.node_id, slot, "Slot taken by another value, moving on");
        }
    }

    /// Run rounds on `slot` until some value is decided there
    async fn decide(&self, slot: Slot, candidate: &V) -> Result<V> {
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }

            self.acceptor.ensure_healthy()?;
            if let Some(value) = self.acceptor.decided(slot) {
                return Ok(value);
            }

            let ballot = self.next_ballot();

            // Phase 1
            let mut promises = 0;
            let mut prior: Option<(Ballot, V)> = None;
            for reply in self.broadcast_prepare(slot, ballot).await {
                if let Some(value) = reply.decided {
                    debug!(node_id = self.node_id, slot, "Peer reported slot already decided");
                    return Ok(value);
                }
                self.observe(reply.highest_seen);

                if reply.promise {
                    promises += 1;
                    if let Some((accepted_ballot, value)) = reply.accepted {
                        if prior.as_ref().map_or(true, |(b, _)| accepted_ballot > *b) {
                            prior = Some((accepted_ballot, value));
                        }
                    }
                }
            }

            if !self.is_quorum(promises) {
                warn!(node_id = self.node_id, slot, ballot, promises, attempt, "Prepare without quorum, retrying");
                continue;
            }

            // Never override a value a majority may already have chosen
            let value = match prior {
                Some((_, value)) => value,
                None => candidate.clone(),
            };

            // Phase 2
            let mut accepts = 0;
            for reply in self.broadcast_accept(slot, ballot, &value).await {
                self.observe(reply.highest_seen);
                if reply.accepted {
                    accepts += 1;
                }
            }

            if self.is_quorum(accepts) {
                debug!(node_id = self.node_id, slot, ballot, accepts, "Slot decided");
                return Ok(value);
            }
            warn!(node_id = self.node_id, slot, ballot, accepts, attempt, "Accept without quorum, retrying");
        }

        Err(Error::NoQuorum {
            slot,
            attempts: self.config.max_attempts,
        })
    }

    async fn broadcast_prepare(&self, slot: Slot, ballot: Ballot) -> Vec<PrepareReply<V>> {
        let request = PrepareRequest {
            slot,
            ballot,
            node_id: self.node_id,
        };

        let calls = (0..self.peer_count).map(|to| async move {
            let reply = if to == self.node_id {
                self.acceptor.handle_prepare(request)
            } else {
                match timeout(self.config.rpc_timeout(), self.transport.prepare(to, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                }
            };
            reply.map_err(|e| {
                debug!(node_id = self.node_id, to, slot, error = %e, "Prepare counted as non-vote");
                e
            })
        });

        join_all(calls).await.into_iter().filter_map(|r| r.ok()).collect()
    }

    async fn broadcast_accept(&self, slot: Slot, ballot: Ballot, value: &V) -> Vec<AcceptReply> {
        let calls = (0..self.peer_count).map(|to| {
            let request = AcceptRequest {
                slot,
                ballot,
                node_id: self.node_id,
                value: value.clone(),
            };
            async move {
                let reply = if to == self.node_id {
                    self.acceptor.handle_accept(request)
                } else {
                    match timeout(self.config.rpc_timeout(), self.transport.accept(to, request)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout),
                    }
                };
                reply.map_err(|e| {
                    debug!(node_id = self.node_id, to, slot, error = %e, "Accept counted as non-vote");
                    e
                })
            }
        });

        join_all(calls).await.into_iter().filter_map(|r| r.ok()).collect()
    }

    async fn broadcast_learn(&self, slot: Slot, value: &V) {
        let calls = (0..self.peer_count)
            .filter(|to| *to != self.node_id)
            .map(|to| {
                let request = LearnRequest {
                    slot,
                    value: value.clone(),
                };
                async move {
                    let sent = timeout(self.config.rpc_timeout(), self.transport.learn(to, request)).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        debug!(node_id = self.node_id, to, slot, "Learn not delivered, peer will catch up lazily");
                    }
                }
            });

        join_all(calls).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNetwork;
    use crate::persistence::MemoryPaxosStore;

    fn group(n: u32) -> (Arc<LocalNetwork<String>>, Vec<Arc<ConsensusPeer<String>>>) {
        let network = Arc::new(LocalNetwork::new());
        let config = ConsensusConfig {
            rpc_timeout_ms: 100,
            max_attempts: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        };
        let peers = (0..n)
            .map(|id| {
                let store = Arc::new(MemoryPaxosStore::new()) as Arc<dyn PaxosStore<String>>;
                let peer = Arc::new(
                    ConsensusPeer::open(id, n, store, network.clone(), config.clone()).unwrap(),
                );
                network.register(&peer);
                peer
            })
            .collect();
        (network, peers)
    }

    #[test]
    fn test_ballots_are_unique_and_increasing() {
        let (_network, peers) = group(3);
        let a1 = peers[0].next_ballot();
        let a2 = peers[0].next_ballot();
        let b1 = peers[1].next_ballot();
        assert!(a2 > a1);
        assert_eq!(a1 % 3, 0);
        assert_eq!(b1 % 3, 1);

        peers[1].observe(100);
        assert!(peers[1].next_ballot() > 100);
    }

    #[test]
    fn test_open_rejects_bad_node_id() {
        let network = Arc::new(LocalNetwork::<String>::new());
        let store = Arc::new(MemoryPaxosStore::new()) as Arc<dyn PaxosStore<String>>;
        let result = ConsensusPeer::open(3, 3, store, network, ConsensusConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_single_proposer_decides_in_order() {
        let (_network, peers) = group(3);

        assert_eq!(peers[0].propose("a".to_string()).await.unwrap(), 0);
        assert_eq!(peers[0].propose("b".to_string()).await.unwrap(), 1);

        for peer in &peers {
            assert_eq!(peer.decided(0).as_deref(), Some("a"));
            assert_eq!(peer.decided(1).as_deref(), Some("b"));
            assert_eq!(peer.first_undecided(), 2);
        }
    }

    #[tokio::test]
    async fn test_lagging_proposer_learns_then_moves_on() {
        let (network, peers) = group(3);
        network.isolate(2);
        peers[0].propose("a".to_string()).await.unwrap();
        network.heal(2);

        // Node 2 missed the learn; its proposal first rediscovers slot 0
        assert_eq!(peers[2].first_undecided(), 0);
        assert_eq!(peers[2].propose("c".to_string()).await.unwrap(), 1);
        assert_eq!(peers[2].decided(0).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_minority_failure_still_decides() {
        let (network, peers) = group(3);
        network.isolate(2);
        assert_eq!(peers[0].propose("a".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_majority_failure_is_unavailable() {
        let (network, peers) = group(3);
        network.isolate(1);
        network.isolate(2);

        let err = peers[0].propose("a".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::NoQuorum { slot: 0, attempts: 5 }));
        assert_eq!(peers[0].decided(0), None);
    }

    #[tokio::test]
    async fn test_proposer_adopts_previously_accepted_value() {
        let (_network, peers) = group(3);

        // Node 1 got "old" accepted by a majority but crashed before learning
        for peer in &peers[..2] {
            peer.handle_prepare(PrepareRequest { slot: 0, ballot: 4, node_id: 1 }).unwrap();
            let reply = peer
                .handle_accept(AcceptRequest { slot: 0, ballot: 4, node_id: 1, value: "old".to_string() })
                .unwrap();
            assert!(reply.accepted);
        }

        // Node 2 must finish "old" in slot 0 and place its own value after it
        assert_eq!(peers[2].propose("new".to_string()).await.unwrap(), 1);
        assert_eq!(peers[2].decided(0).as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_poisoned_peer_refuses_to_propose() {
        let network = Arc::new(LocalNetwork::new());
        let store = Arc::new(MemoryPaxosStore::<String>::new());
        let peer = Arc::new(
            ConsensusPeer::open(
                0,
                1,
                store.clone() as Arc<dyn PaxosStore<String>>,
                network.clone(),
                ConsensusConfig::default(),
            )
            .unwrap(),
        );
        network.register(&peer);

        store.set_failing(true);
        assert!(peer.propose("a".to_string()).await.is_err());
        assert!(peer.is_poisoned());

        store.set_failing(false);
        assert!(matches!(
            peer.propose("b".to_string()).await,
            Err(Error::Poisoned { node_id: 0 })
        ));
    }
}
