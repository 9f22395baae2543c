//! Two single-replica shards talking over real sockets

use ledger_core::{config::RocksDBConfig, AccountId};
use shard::{
    config::{NodeConfig, ShardEndpoint},
    node::Node,
    rpc::RpcClient,
    Error,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Deployment {
    shard1: RpcClient,
    shard2: RpcClient,
    nodes: Vec<Arc<Node>>,
    _dirs: Vec<TempDir>,
}

async fn deploy() -> Deployment {
    let listeners = [
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
    ];
    let addrs: Vec<String> = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().to_string())
        .collect();
    let shards: Vec<ShardEndpoint> = addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| ShardEndpoint {
            id: i as u32 + 1,
            addr: addr.clone(),
        })
        .collect();

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            shard_id: i as u32 + 1,
            node_id: 0,
            listen_addr: addrs[i].clone(),
            peers: vec![addrs[i].clone()],
            shards: shards.clone(),
            data_dir: dir.path().to_path_buf(),
            rocksdb: RocksDBConfig {
                sync_writes: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let node = Arc::new(Node::open(config).await.unwrap());
        let server = node.clone();
        tokio::spawn(async move { server.serve(listener).await });
        nodes.push(node);
        dirs.push(dir);
    }

    Deployment {
        shard1: RpcClient::new(addrs[0].clone()),
        shard2: RpcClient::new(addrs[1].clone()),
        nodes,
        _dirs: dirs,
    }
}

fn account(name: &str) -> AccountId {
    AccountId::new(name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_get_transfer_over_tcp() {
    let deployment = deploy().await;
    let shard1 = &deployment.shard1;

    assert!(shard1.put(account("Alice"), 100).await.unwrap());
    assert!(shard1.put(account("Bob"), 50).await.unwrap());
    assert!(shard1.transfer(account("Alice"), account("Bob"), 30).await.unwrap());

    assert_eq!(shard1.get(account("Alice")).await.unwrap(), 70);
    assert_eq!(shard1.get(account("Bob")).await.unwrap(), 80);

    // Wrong shard: Put refused, Get reported as an error
    assert!(!shard1.put(account("Zelda"), 10).await.unwrap());
    let err = shard1.get(account("Zelda")).await.unwrap_err();
    assert!(matches!(err, Error::Rpc(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_shard_transfer_over_tcp() {
    let deployment = deploy().await;
    let (shard1, shard2) = (&deployment.shard1, &deployment.shard2);

    assert!(shard1.put(account("Alice"), 100).await.unwrap());
    assert!(shard2.put(account("Xander"), 10).await.unwrap());

    assert!(shard1.transfer(account("Alice"), account("Xander"), 25).await.unwrap());
    assert!(!shard1.transfer(account("Alice"), account("Xander"), 500).await.unwrap());
    assert!(shard2.transfer(account("Xander"), account("Alice"), 5).await.unwrap());

    assert_eq!(shard1.get(account("Alice")).await.unwrap(), 80);
    assert_eq!(shard2.get(account("Xander")).await.unwrap(), 30);

    for node in &deployment.nodes {
        let storage = node.coordinator().shard().storage();
        assert!(storage.in_flight_transfers().unwrap().is_empty());
        assert!(storage.prepared_entries().unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metrics_exposed_over_tcp() {
    let deployment = deploy().await;
    let shard1 = &deployment.shard1;

    assert!(shard1.put(account("Alice"), 10).await.unwrap());
    assert!(shard1.transfer(account("Alice"), account("Bob"), 5).await.unwrap());

    let text = shard1.metrics().await.unwrap();
    assert!(text.contains("shard_transfers_total"));
}
