use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use skerry_consensus::RaftReplica;
use skerry_ring::ShardManager;
use skerry_storage::{Engine, LogStore};
use skerry_types::{NodeId, ShardId};

/// One locally hosted shard: its replica plus the identity it runs under.
pub struct ShardReplica<E: Engine, L: LogStore> {
    pub node_id: NodeId,
    pub raft_addr: String,
    pub replica: Arc<RaftReplica<E, L>>,
}

/// The per-shard state this node hosts. The manager records hosting intent;
/// this map owns the replicas and is the shutdown root for per-shard state.
pub struct ShardState<E: Engine, L: LogStore> {
    pub manager: ShardManager,
    pub replicas: RwLock<HashMap<ShardId, ShardReplica<E, L>>>,
}

impl<E: Engine, L: LogStore> ShardState<E, L> {
    pub fn new() -> Self {
        ShardState { manager: ShardManager::new(), replicas: RwLock::new(HashMap::new()) }
    }

    /// Stop every shard replica. Engines close when their handles drop.
    pub async fn shutdown(&self) {
        let mut replicas = self.replicas.write().await;
        for (shard_id, shard) in replicas.drain() {
            shard.replica.shutdown();
            tracing::info!(%shard_id, "shard replica stopped");
        }
    }
}

impl<E: Engine, L: LogStore> Default for ShardState<E, L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state behind the HTTP surface.
pub struct AppState<E: Engine, L: LogStore> {
    pub node_id: NodeId,
    pub engine: Arc<E>,
    /// `None` when replication is disabled; writes then go straight to the
    /// engine.
    pub replica: Option<Arc<RaftReplica<E, L>>>,
    /// `None` when this node does not host per-shard replicas.
    pub shards: Option<Arc<ShardState<E, L>>>,
}
