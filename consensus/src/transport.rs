//! Outbound peer RPCs

use crate::{
    messages::{AcceptReply, AcceptRequest, LearnRequest, PrepareReply, PrepareRequest},
    NodeId, Result, Value,
};
use async_trait::async_trait;

/// How a proposer reaches the other replicas of its group.
///
/// Any error is counted as a non-vote, never as a hard failure of the round.
#[async_trait]
pub trait PeerTransport<V: Value>: Send + Sync {
    /// Send phase 1a to `to`
    async fn prepare(&self, to: NodeId, request: PrepareRequest) -> Result<PrepareReply<V>>;

    /// Send phase 2a to `to`
    async fn accept(&self, to: NodeId, request: AcceptRequest<V>) -> Result<AcceptReply>;

    /// Tell `to` about a decided slot
    async fn learn(&self, to: NodeId, request: LearnRequest<V>) -> Result<()>;
}
