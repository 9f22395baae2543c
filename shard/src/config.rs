//! Configuration for a shard replica

use crate::{Error, Result};
use consensus::ConsensusConfig;
use ledger_core::{config::RocksDBConfig, ShardId, ShardMap};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Shard this replica belongs to
    pub shard_id: u32,

    /// Index of this replica in `peers`
    pub node_id: u32,

    /// Address the RPC server binds to
    pub listen_addr: String,

    /// RPC addresses of every replica of this shard, indexed by node id
    pub peers: Vec<String>,

    /// Contact address of every shard, for cross-shard transfers
    pub shards: Vec<ShardEndpoint>,

    /// Key ranges, as ordered split points
    pub shard_map: Vec<SplitPoint>,

    /// Data directory (ledger and consensus state live below it)
    pub data_dir: PathBuf,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Consensus timing
    pub consensus: ConsensusConfig,

    /// Interval of the coordinator recovery sweep (ms)
    pub recovery_interval_ms: u64,

    /// Bound on a single two-phase call to another shard (ms)
    pub participant_timeout_ms: u64,
}

/// Where to reach a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEndpoint {
    /// Shard id
    pub id: u32,
    /// Replica handling two-phase traffic for the shard
    pub addr: String,
}

/// Start of a key range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPoint {
    /// First routing character of the range
    pub start: char,
    /// Owning shard
    pub shard: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            shard_id: 1,
            node_id: 0,
            listen_addr: "127.0.0.1:8001".to_string(),
            peers: vec![
                "127.0.0.1:8001".to_string(),
                "127.0.0.1:8002".to_string(),
                "127.0.0.1:8003".to_string(),
            ],
            shards: vec![
                ShardEndpoint {
                    id: 1,
                    addr: "127.0.0.1:8001".to_string(),
                },
                ShardEndpoint {
                    id: 2,
                    addr: "127.0.0.1:9001".to_string(),
                },
            ],
            shard_map: vec![
                SplitPoint { start: '\0', shard: 1 },
                SplitPoint { start: 'N', shard: 2 },
            ],
            data_dir: PathBuf::from("./data/shard"),
            rocksdb: RocksDBConfig::default(),
            consensus: ConsensusConfig::default(),
            recovery_interval_ms: 5_000,
            participant_timeout_ms: 5_000,
        }
    }
}

impl NodeConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = NodeConfig::default();

        if let Ok(shard) = std::env::var("SHARD_ID") {
            config.shard_id = parse_var("SHARD_ID", &shard)?;
        }

        if let Ok(node) = std::env::var("SHARD_NODE_ID") {
            config.node_id = parse_var("SHARD_NODE_ID", &node)?;
        }

        if let Ok(addr) = std::env::var("SHARD_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(peers) = std::env::var("SHARD_PEERS") {
            config.peers = split_list(&peers);
        }

        // "1=host:port,2=host:port"
        if let Ok(shards) = std::env::var("SHARD_ENDPOINTS") {
            config.shards = split_list(&shards)
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((id, addr)) => Ok(ShardEndpoint {
                        id: parse_var("SHARD_ENDPOINTS", id)?,
                        addr: addr.to_string(),
                    }),
                    None => Err(Error::Config(format!("SHARD_ENDPOINTS: bad entry {}", entry))),
                })
                .collect::<Result<_>>()?;
        }

        if let Ok(data_dir) = std::env::var("SHARD_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interval) = std::env::var("SHARD_RECOVERY_INTERVAL_MS") {
            config.recovery_interval_ms = parse_var("SHARD_RECOVERY_INTERVAL_MS", &interval)?;
        }

        if let Ok(timeout) = std::env::var("SHARD_PARTICIPANT_TIMEOUT_MS") {
            config.participant_timeout_ms = parse_var("SHARD_PARTICIPANT_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(sync) = std::env::var("SHARD_SYNC_WRITES") {
            config.rocksdb.sync_writes = parse_var("SHARD_SYNC_WRITES", &sync)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.node_id as usize >= self.peers.len() {
            return Err(Error::Config(format!(
                "node_id {} but only {} peers listed",
                self.node_id,
                self.peers.len()
            )));
        }

        let map = self.shard_map()?;
        if !map.shards().any(|shard| shard == ShardId(self.shard_id)) {
            return Err(Error::Config(format!(
                "shard {} owns no key range",
                self.shard_id
            )));
        }

        Ok(())
    }

    /// This replica's shard
    pub fn shard(&self) -> ShardId {
        ShardId(self.shard_id)
    }

    /// Key map built from the split points
    pub fn shard_map(&self) -> Result<ShardMap> {
        let splits = self
            .shard_map
            .iter()
            .map(|split| (split.start, ShardId(split.shard)))
            .collect();
        Ok(ShardMap::new(splits)?)
    }

    /// Storage settings of the ledger database
    pub fn ledger_config(&self) -> ledger_core::Config {
        ledger_core::Config {
            data_dir: self.data_dir.join("ledger"),
            rocksdb: self.rocksdb.clone(),
        }
    }

    /// Directory of the ballot-state database
    pub fn paxos_dir(&self) -> PathBuf {
        self.data_dir.join("paxos")
    }

    /// Interval of the coordinator recovery sweep
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    /// Bound on a single two-phase call to another shard
    pub fn participant_timeout(&self) -> Duration {
        Duration::from_millis(self.participant_timeout_ms)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}: {}", name, e)))
}
