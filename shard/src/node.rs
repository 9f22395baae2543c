//! Wiring of one replica process

use crate::{
    config::NodeConfig,
    coordinator::TransferCoordinator,
    metrics::ShardMetrics,
    rpc::{RpcServer, TcpPeerTransport, TcpShardRouter},
    shard::Shard,
    Result,
};
use consensus::{ConsensusPeer, PaxosStore, RocksPaxosStore};
use ledger_core::{Operation, ShardId, Storage};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// A running replica: shard, coordinator and background tasks
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    coordinator: Arc<TransferCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage and consensus state, then start the applier and recovery tasks
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let storage = Storage::open(&config.ledger_config())?;
        let store: Arc<dyn PaxosStore<Operation>> = Arc::new(RocksPaxosStore::open(config.paxos_dir())?);
        let transport = Arc::new(TcpPeerTransport::new(&config.peers));

        let peer = Arc::new(ConsensusPeer::open(
            config.node_id,
            config.peers.len() as u32,
            store,
            transport,
            config.consensus.clone(),
        )?);

        let shard = Shard::open(
            config.shard(),
            config.shard_map()?,
            storage,
            peer,
            ShardMetrics::new()?,
        )
        .await?;

        let router = Arc::new(TcpShardRouter::new(
            config
                .shards
                .iter()
                .map(|endpoint| (ShardId(endpoint.id), endpoint.addr.clone())),
        ));
        let coordinator = Arc::new(
            TransferCoordinator::new(shard.clone(), router)
                .with_participant_timeout(config.participant_timeout()),
        );

        let recovered = coordinator.recover().await?;
        info!(shard = %shard.id(), node_id = config.node_id, recovered, "Replica ready");

        let tasks = vec![
            shard.spawn_applier(),
            coordinator.spawn_recovery(config.recovery_interval()),
        ];

        Ok(Self {
            config,
            coordinator,
            tasks,
        })
    }

    /// Configuration the node was opened with
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Transfer entry point
    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    /// Serve RPCs on `listener` until the task is dropped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        Arc::new(RpcServer::new(self.coordinator.clone()))
            .serve(listener)
            .await
    }

    /// Stop background tasks
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!(shard = %self.config.shard(), node_id = self.config.node_id, "Replica stopped");
    }
}
