use std::collections::HashSet;
use std::sync::RwLock;

use skerry_types::ShardId;

/// Tracks which shard IDs this node hosts. Pure intent: the shard → replica
/// map lives with whoever owns the per-shard state.
pub struct ShardManager {
    shards: RwLock<HashSet<ShardId>>,
}

impl ShardManager {
    pub fn new() -> Self {
        ShardManager { shards: RwLock::new(HashSet::new()) }
    }

    pub fn add_shard(&self, shard_id: &str) {
        self.shards.write().expect("shard lock poisoned").insert(shard_id.to_string());
    }

    pub fn remove_shard(&self, shard_id: &str) {
        self.shards.write().expect("shard lock poisoned").remove(shard_id);
    }

    pub fn has_shard(&self, shard_id: &str) -> bool {
        self.shards.read().expect("shard lock poisoned").contains(shard_id)
    }

    pub fn list(&self) -> Vec<ShardId> {
        let mut out: Vec<ShardId> =
            self.shards.read().expect("shard lock poisoned").iter().cloned().collect();
        out.sort();
        out
    }
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_has_remove() {
        let mgr = ShardManager::new();
        assert!(!mgr.has_shard("0"));

        mgr.add_shard("0");
        mgr.add_shard("1");
        assert!(mgr.has_shard("0"));
        assert!(mgr.has_shard("1"));
        assert_eq!(mgr.list(), vec!["0".to_string(), "1".to_string()]);

        mgr.remove_shard("0");
        assert!(!mgr.has_shard("0"));
        assert_eq!(mgr.list(), vec!["1".to_string()]);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mgr = ShardManager::new();
        mgr.add_shard("7");
        mgr.add_shard("7");
        assert_eq!(mgr.list().len(), 1);
    }
}
