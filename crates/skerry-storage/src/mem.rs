use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use skerry_types::{NodeId, SkerryError};

use crate::traits::{Engine, LogStore};
use crate::types::{LogEntry, LogState, SnapshotBlob, Vote};

// ---------------------------------------------------------------------------
// MemEngine
// ---------------------------------------------------------------------------

/// In-memory [`Engine`] backed by a `BTreeMap`.
///
/// Intended for unit tests; not persisted across restarts.
pub struct MemEngine {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        MemEngine { data: Arc::new(RwLock::new(BTreeMap::new())) }
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemEngine {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, SkerryError> {
        self.data.read().await.get(key).cloned().ok_or(SkerryError::NotFound)
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SkerryError> {
        self.data.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), SkerryError> {
        match self.data.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(SkerryError::NotFound),
        }
    }

    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SkerryError> {
        Ok(self.data.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn clear(&self) -> Result<(), SkerryError> {
        self.data.write().await.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemLogStore
// ---------------------------------------------------------------------------

struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<u64>,
    vote: Option<Vote>,
    membership: Option<BTreeMap<NodeId, String>>,
    snapshot: Option<SnapshotBlob>,
    last_applied: Option<u64>,
}

/// In-memory [`LogStore`] for tests.
pub struct MemLogStore {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore {
            inner: Arc::new(RwLock::new(MemLogInner {
                entries: BTreeMap::new(),
                last_purged: None,
                vote: None,
                membership: None,
                snapshot: None,
                last_applied: None,
            })),
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemLogStore {
    async fn log_state(&self) -> Result<LogState, SkerryError> {
        let g = self.inner.read().await;
        Ok(LogState {
            first_index: g.entries.keys().next().copied(),
            last_index: g.entries.keys().next_back().copied(),
            last_purged_index: g.last_purged,
        })
    }

    async fn entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, SkerryError> {
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), SkerryError> {
        let mut g = self.inner.write().await;
        for e in entries {
            g.entries.insert(e.index, e);
        }
        Ok(())
    }

    async fn truncate(&self, from_index: u64) -> Result<(), SkerryError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx < from_index);
        Ok(())
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), SkerryError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > up_to_index);
        g.last_purged = Some(up_to_index);
        Ok(())
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), SkerryError> {
        self.inner.write().await.vote = Some(vote);
        Ok(())
    }

    async fn read_vote(&self) -> Result<Option<Vote>, SkerryError> {
        Ok(self.inner.read().await.vote.clone())
    }

    async fn save_membership(
        &self,
        members: BTreeMap<NodeId, String>,
    ) -> Result<(), SkerryError> {
        self.inner.write().await.membership = Some(members);
        Ok(())
    }

    async fn read_membership(
        &self,
    ) -> Result<Option<BTreeMap<NodeId, String>>, SkerryError> {
        Ok(self.inner.read().await.membership.clone())
    }

    async fn save_snapshot(&self, snapshot: SnapshotBlob) -> Result<(), SkerryError> {
        self.inner.write().await.snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<SnapshotBlob>, SkerryError> {
        Ok(self.inner.read().await.snapshot.clone())
    }

    async fn save_last_applied(&self, index: u64) -> Result<(), SkerryError> {
        self.inner.write().await.last_applied = Some(index);
        Ok(())
    }

    async fn read_last_applied(&self) -> Result<Option<u64>, SkerryError> {
        Ok(self.inner.read().await.last_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogPayload;

    #[tokio::test]
    async fn mem_engine_contract() {
        let engine = MemEngine::new();
        assert!(matches!(engine.get(b"a").await, Err(SkerryError::NotFound)));
        engine.set(b"a", b"1").await.unwrap();
        assert_eq!(engine.get(b"a").await.unwrap(), b"1");
        engine.delete(b"a").await.unwrap();
        assert!(matches!(engine.delete(b"a").await, Err(SkerryError::NotFound)));
    }

    #[tokio::test]
    async fn mem_log_store_truncate_and_purge() {
        let log = MemLogStore::new();
        log.append(
            (1..=5)
                .map(|i| LogEntry { index: i, term: 1, payload: LogPayload::Blank })
                .collect(),
        )
        .await
        .unwrap();

        log.truncate(4).await.unwrap();
        assert_eq!(log.log_state().await.unwrap().last_index, Some(3));

        log.purge(2).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(3));
        assert_eq!(state.last_purged_index, Some(2));
    }
}
