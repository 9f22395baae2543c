//! Peer-to-peer consensus messages

use crate::{Ballot, NodeId, Slot};
use serde::{Deserialize, Serialize};

/// Phase 1a
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Log slot
    pub slot: Slot,
    /// Proposal number
    pub ballot: Ballot,
    /// Proposing replica
    pub node_id: NodeId,
}

/// Phase 1b
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareReply<V> {
    /// Whether the acceptor promised
    pub promise: bool,
    /// Highest proposal number the acceptor has seen for the slot
    pub highest_seen: Ballot,
    /// Previously accepted `(ballot, value)`, if any
    pub accepted: Option<(Ballot, V)>,
    /// Value already known decided for the slot
    pub decided: Option<V>,
}

/// Phase 2a
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptRequest<V> {
    /// Log slot
    pub slot: Slot,
    /// Proposal number
    pub ballot: Ballot,
    /// Proposing replica
    pub node_id: NodeId,
    /// Proposed value
    pub value: V,
}

/// Phase 2b
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptReply {
    /// Whether the acceptor accepted
    pub accepted: bool,
    /// Highest proposal number the acceptor has seen for the slot
    pub highest_seen: Ballot,
}

/// Decision broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnRequest<V> {
    /// Log slot
    pub slot: Slot,
    /// Decided value
    pub value: V,
}
