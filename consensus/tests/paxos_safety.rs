//! Safety and liveness of the replicated log
//!
//! - Agreement: no two replicas decide different values for a slot
//! - Validity: every decided value was proposed by someone
//! - Durability: a restarted replica keeps its promises and decisions

use consensus::{
    local::LocalNetwork, ConsensusConfig, ConsensusPeer, Error, MemoryPaxosStore, PaxosStore,
    RocksPaxosStore,
};
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        rpc_timeout_ms: 200,
        max_attempts: 50,
        backoff_base_ms: 1,
        backoff_max_ms: 20,
    }
}

struct Group {
    network: Arc<LocalNetwork<String>>,
    stores: Vec<Arc<dyn PaxosStore<String>>>,
    peers: Vec<Arc<ConsensusPeer<String>>>,
}

impl Group {
    fn with_stores(stores: Vec<Arc<dyn PaxosStore<String>>>) -> Self {
        let network = Arc::new(LocalNetwork::new());
        let n = stores.len() as u32;
        let peers = stores
            .iter()
            .enumerate()
            .map(|(id, store)| {
                let peer = Arc::new(
                    ConsensusPeer::open(id as u32, n, store.clone(), network.clone(), test_config())
                        .unwrap(),
                );
                network.register(&peer);
                peer
            })
            .collect();

        Self {
            network,
            stores,
            peers,
        }
    }

    fn in_memory(n: u32) -> Self {
        Self::with_stores(
            (0..n)
                .map(|_| Arc::new(MemoryPaxosStore::new()) as Arc<dyn PaxosStore<String>>)
                .collect(),
        )
    }

    /// Drop replica `id` and start it again on the same store
    fn restart(&mut self, id: usize) {
        let n = self.peers.len() as u32;
        let peer = Arc::new(
            ConsensusPeer::open(
                id as u32,
                n,
                self.stores[id].clone(),
                self.network.clone(),
                test_config(),
            )
            .unwrap(),
        );
        self.network.register(&peer);
        self.peers[id] = peer;
    }

    fn assert_agreement(&self, slots: u64) {
        for slot in 0..slots {
            let decided: HashSet<String> = self.peers.iter().filter_map(|p| p.decided(slot)).collect();
            assert!(decided.len() <= 1, "slot {} decided as {:?}", slot, decided);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: concurrent proposers never split a slot
    #[test]
    fn prop_concurrent_proposers_agree(peer_count in prop::sample::select(vec![3u32, 5]), proposals in 1usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let group = Group::in_memory(peer_count);

            let tasks = (0..proposals).map(|i| {
                let peer = group.peers[i % group.peers.len()].clone();
                let value = format!("v{}", i);
                tokio::spawn(async move { (value.clone(), peer.propose(value).await) })
            });

            let mut slots = HashSet::new();
            for joined in join_all(tasks).await {
                let (value, result) = joined.unwrap();
                let slot = result.unwrap();

                // Each proposal owns its own slot
                prop_assert!(slots.insert(slot));
                let holders: Vec<_> = group.peers.iter().filter_map(|p| p.decided(slot)).collect();
                prop_assert!(!holders.is_empty());
                prop_assert!(holders.iter().all(|v| *v == value));
            }

            group.assert_agreement(proposals as u64 + 1);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_decided_values_are_proposed_values() {
    let group = Group::in_memory(3);
    let proposed: HashSet<String> = (0..4).map(|i| format!("op-{}", i)).collect();

    for (i, value) in proposed.iter().enumerate() {
        group.peers[i % 3].propose(value.clone()).await.unwrap();
    }

    for slot in 0..4 {
        let value = group.peers[0].decided(slot).unwrap();
        assert!(proposed.contains(&value));
    }
    assert_eq!(group.peers[0].first_undecided(), 4);
}

#[tokio::test]
async fn test_two_of_five_down_still_decides() {
    let group = Group::in_memory(5);
    group.network.isolate(3);
    group.network.isolate(4);

    let slot = group.peers[0].propose("a".to_string()).await.unwrap();
    assert_eq!(slot, 0);
    assert_eq!(group.peers[3].decided(0), None);
}

#[tokio::test]
async fn test_three_of_five_down_reports_no_quorum() {
    let group = Group::in_memory(5);
    for id in 2..5 {
        group.network.isolate(id);
    }

    let err = group.peers[0].propose("a".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::NoQuorum { slot: 0, .. }));
}

#[tokio::test]
async fn test_isolated_replica_catches_up_when_it_proposes() {
    let group = Group::in_memory(3);
    group.network.isolate(2);
    group.peers[0].propose("a".to_string()).await.unwrap();
    group.peers[1].propose("b".to_string()).await.unwrap();
    group.network.heal(2);

    assert_eq!(group.peers[2].propose("c".to_string()).await.unwrap(), 2);
    assert_eq!(group.peers[2].decided(0).as_deref(), Some("a"));
    assert_eq!(group.peers[2].decided(1).as_deref(), Some("b"));
    group.assert_agreement(3);
}

#[tokio::test]
async fn test_restart_preserves_decisions() {
    let mut group = Group::in_memory(3);
    group.peers[0].propose("a".to_string()).await.unwrap();
    group.peers[0].propose("b".to_string()).await.unwrap();

    group.restart(0);
    let restarted = &group.peers[0];
    assert_eq!(restarted.first_undecided(), 2);
    assert_eq!(restarted.decided(1).as_deref(), Some("b"));

    assert_eq!(restarted.propose("c".to_string()).await.unwrap(), 2);
    group.assert_agreement(3);
}

#[tokio::test]
async fn test_rocks_backed_replicas_survive_restart() {
    let temp = tempfile::tempdir().unwrap();
    let stores: Vec<Arc<dyn PaxosStore<String>>> = (0..3)
        .map(|id| {
            Arc::new(RocksPaxosStore::open(temp.path().join(format!("node-{}", id))).unwrap())
                as Arc<dyn PaxosStore<String>>
        })
        .collect();

    let mut group = Group::with_stores(stores);
    group.peers[1].propose("debit".to_string()).await.unwrap();

    for id in 0..3 {
        group.restart(id);
    }

    for peer in &group.peers {
        assert_eq!(peer.decided(0).as_deref(), Some("debit"));
    }
    assert_eq!(group.peers[2].propose("credit".to_string()).await.unwrap(), 1);
}
