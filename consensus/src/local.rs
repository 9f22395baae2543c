//! In-process transport for tests and single-binary deployments
//!
//! Peers are held weakly so a dropped peer behaves like a crashed one. A node
//! can be isolated: every call to or from it fails until it is healed.

use crate::{
    error::{Error, Result},
    messages::{AcceptReply, AcceptRequest, LearnRequest, PrepareReply, PrepareRequest},
    peer::ConsensusPeer,
    transport::PeerTransport,
    NodeId, Value,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Routing table of one replica group
pub struct LocalNetwork<V: Value> {
    peers: RwLock<HashMap<NodeId, Weak<ConsensusPeer<V>>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl<V: Value> std::fmt::Debug for LocalNetwork<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("peers", &self.peers.read().len())
            .field("down", &*self.down.read())
            .finish()
    }
}

impl<V: Value> Default for LocalNetwork<V> {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
        }
    }
}

impl<V: Value> LocalNetwork<V> {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` reachable, replacing an earlier incarnation with the same id
    pub fn register(&self, peer: &Arc<ConsensusPeer<V>>) {
        self.peers.write().insert(peer.node_id(), Arc::downgrade(peer));
    }

    /// Cut `node_id` off from the group
    pub fn isolate(&self, node_id: NodeId) {
        self.down.write().insert(node_id);
    }

    /// Reconnect `node_id`
    pub fn heal(&self, node_id: NodeId) {
        self.down.write().remove(&node_id);
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<ConsensusPeer<V>>> {
        {
            let down = self.down.read();
            if down.contains(&to) || down.contains(&from) {
                return Err(Error::Transport(format!("node {} unreachable", to)));
            }
        }
        self.peers
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Transport(format!("node {} not running", to)))
    }
}

#[async_trait]
impl<V: Value> PeerTransport<V> for LocalNetwork<V> {
    async fn prepare(&self, to: NodeId, request: PrepareRequest) -> Result<PrepareReply<V>> {
        let peer = self.route(request.node_id, to)?;
        tokio::task::yield_now().await;
        peer.handle_prepare(request)
    }

    async fn accept(&self, to: NodeId, request: AcceptRequest<V>) -> Result<AcceptReply> {
        let peer = self.route(request.node_id, to)?;
        tokio::task::yield_now().await;
        peer.handle_accept(request)
    }

    async fn learn(&self, to: NodeId, request: LearnRequest<V>) -> Result<()> {
        let peer = self.route(to, to)?;
        tokio::task::yield_now().await;
        peer.handle_learn(request)
    }
}
