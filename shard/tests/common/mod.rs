//! In-process deployments for integration tests

#![allow(dead_code)]

use consensus::{local::LocalNetwork, ConsensusConfig, ConsensusPeer, MemoryPaxosStore, PaxosStore};
use ledger_core::{config::RocksDBConfig, AccountId, Amount, Config, Operation, ShardId, ShardMap, Storage};
use shard::{LocalRouter, Shard, ShardMetrics, TransferCoordinator};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub fn ledger_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        rocksdb: RocksDBConfig {
            sync_writes: false,
            ..Default::default()
        },
    }
}

pub fn consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        rpc_timeout_ms: 200,
        max_attempts: 50,
        backoff_base_ms: 1,
        backoff_max_ms: 10,
    }
}

/// Open one replica on `dir` with ballot state in `store`
pub async fn open_replica(
    id: ShardId,
    node_id: u32,
    peer_count: u32,
    dir: &Path,
    store: Arc<dyn PaxosStore<Operation>>,
    network: &Arc<LocalNetwork<Operation>>,
) -> Arc<Shard> {
    let storage = Storage::open(&ledger_config(dir)).unwrap();
    let peer = Arc::new(
        ConsensusPeer::open(node_id, peer_count, store, network.clone(), consensus_config()).unwrap(),
    );
    network.register(&peer);
    Shard::open(id, ShardMap::default(), storage, peer, ShardMetrics::new().unwrap())
        .await
        .unwrap()
}

pub struct Replica {
    pub shard: Arc<Shard>,
    pub coordinator: Arc<TransferCoordinator>,
}

pub struct TestShard {
    pub network: Arc<LocalNetwork<Operation>>,
    pub replicas: Vec<Replica>,
    _dirs: Vec<TempDir>,
}

impl TestShard {
    /// Replica receiving client and two-phase traffic
    pub fn contact(&self) -> &Replica {
        &self.replicas[0]
    }

    pub async fn put(&self, account: &str, amount: Amount) {
        assert!(self.contact().shard.put(AccountId::new(account), amount).await.unwrap());
    }

    pub async fn get(&self, account: &str) -> Amount {
        self.contact().shard.get(&AccountId::new(account)).await.unwrap()
    }

    pub async fn transfer(&self, from: &str, to: &str, amount: Amount) -> bool {
        self.contact()
            .coordinator
            .transfer(AccountId::new(from), AccountId::new(to), amount)
            .await
            .unwrap()
    }
}

/// A shard replicated `replicas` times, its contact replica registered in `router`
pub async fn open_shard(id: u32, replicas: u32, router: &Arc<LocalRouter>) -> TestShard {
    let network = Arc::new(LocalNetwork::new());
    let mut dirs = Vec::new();
    let mut opened = Vec::new();

    for node_id in 0..replicas {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryPaxosStore::new()) as Arc<dyn PaxosStore<Operation>>;
        let shard = open_replica(ShardId(id), node_id, replicas, dir.path(), store, &network).await;
        let coordinator = Arc::new(TransferCoordinator::new(shard.clone(), router.clone()));
        opened.push(Replica { shard, coordinator });
        dirs.push(dir);
    }

    router.register(opened[0].shard.clone());
    TestShard {
        network,
        replicas: opened,
        _dirs: dirs,
    }
}

/// Default key map: shard 1 owns `[A-M]`, shard 2 owns `[N-Z]`
pub struct Cluster {
    pub router: Arc<LocalRouter>,
    pub shard1: TestShard,
    pub shard2: TestShard,
}

pub async fn cluster(replicas: u32) -> Cluster {
    let router = Arc::new(LocalRouter::new());
    let shard1 = open_shard(1, replicas, &router).await;
    let shard2 = open_shard(2, replicas, &router).await;
    Cluster {
        router,
        shard1,
        shard2,
    }
}
