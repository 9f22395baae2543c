//! Configuration for a consensus peer

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and retry settings of a proposer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Per-RPC timeout (ms); a late reply counts as a non-vote
    pub rpc_timeout_ms: u64,

    /// Rounds tried per slot before reporting no quorum
    pub max_attempts: u32,

    /// Base of the randomized exponential backoff (ms)
    pub backoff_base_ms: u64,

    /// Backoff ceiling (ms)
    pub backoff_max_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 500,
            max_attempts: 10,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
        }
    }
}

impl ConsensusConfig {
    /// Per-RPC timeout
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Randomized delay before retry `attempt` (full jitter)
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.backoff_max_ms);
        let delay = rand::thread_rng().gen_range(0..=exp);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let config = ConsensusConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 40,
            ..Default::default()
        };
        for attempt in 0..40 {
            assert!(config.backoff(attempt) <= Duration::from_millis(40));
        }
    }
}
