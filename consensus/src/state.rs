//! Per-slot acceptor state
//!
//! Pure transitions, no I/O: the caller persists the returned state before
//! exposing it to anyone.

use crate::{Ballot, Value};
use serde::{Deserialize, Serialize};

/// Ballot state of one slot on one acceptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState<V> {
    /// Highest proposal number promised or accepted
    pub min_proposal: Ballot,
    /// Proposal number of the accepted value, `0` if none
    pub accepted_proposal: Ballot,
    /// Accepted value
    pub accepted_value: Option<V>,
}

impl<V> Default for InstanceState<V> {
    fn default() -> Self {
        Self {
            min_proposal: 0,
            accepted_proposal: 0,
            accepted_value: None,
        }
    }
}

impl<V: Value> InstanceState<V> {
    /// State after promising `ballot`, or `None` if it is stale
    pub fn on_prepare(&self, ballot: Ballot) -> Option<Self> {
        if ballot > self.min_proposal {
            Some(Self {
                min_proposal: ballot,
                ..self.clone()
            })
        } else {
            None
        }
    }

    /// State after accepting `value` at `ballot`, or `None` if it is stale
    pub fn on_accept(&self, ballot: Ballot, value: V) -> Option<Self> {
        if ballot >= self.min_proposal {
            Some(Self {
                min_proposal: ballot,
                accepted_proposal: ballot,
                accepted_value: Some(value),
            })
        } else {
            None
        }
    }

    /// Accepted `(ballot, value)` pair
    pub fn accepted(&self) -> Option<(Ballot, V)> {
        self.accepted_value
            .clone()
            .map(|value| (self.accepted_proposal, value))
    }
}
