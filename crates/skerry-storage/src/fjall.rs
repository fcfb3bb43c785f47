use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use skerry_types::{NodeId, SkerryError};

use crate::keys::{
    log_key, META_LAST_APPLIED, META_LAST_PURGED, META_MEMBERSHIP, META_SNAPSHOT, META_VOTE,
};
use crate::traits::{Engine, LogStore};
use crate::types::{LogEntry, LogState, SnapshotBlob, Vote};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, SkerryError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| SkerryError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, SkerryError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| SkerryError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> SkerryError {
    SkerryError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping the node's keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All three keyspaces live in a single fjall `Database` so cross-keyspace
/// write batches are atomic; acknowledged writes are followed by a sync
/// persist.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// User data: raw key → raw value.
    pub data: fjall::Keyspace,
    /// Consensus log entries: `index(8)` → bincode(LogEntry)
    pub raft_log: fjall::Keyspace,
    /// Stable consensus state: label → bincode(value)
    pub raft_meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, SkerryError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let data =
            db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let raft_meta =
            db.keyspace("raft_meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, data, raft_log, raft_meta }))
    }

    fn sync(&self) -> Result<(), SkerryError> {
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }
}

// ---------------------------------------------------------------------------
// FjallEngine
// ---------------------------------------------------------------------------

/// [`Engine`] backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallEngine(pub Arc<FjallStore>);

impl Engine for FjallEngine {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, SkerryError> {
        let store = self.0.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, SkerryError> {
            match store.data.get(&key).map_err(fjall_err)? {
                Some(v) => Ok(v.to_vec()),
                None => Err(SkerryError::NotFound),
            }
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SkerryError> {
        let store = self.0.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            store.data.insert(key, value).map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn delete(&self, key: &[u8]) -> Result<(), SkerryError> {
        let store = self.0.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            if store.data.get(&key).map_err(fjall_err)?.is_none() {
                return Err(SkerryError::NotFound);
            }
            store.data.remove(key).map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Vec<u8>, Vec<u8>)>, SkerryError> {
            store
                .data
                .prefix(Vec::<u8>::new())
                .map(|g| {
                    g.into_inner()
                        .map(|(k, v)| (k.to_vec(), v.to_vec()))
                        .map_err(fjall_err)
                })
                .collect()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn clear(&self) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            let keys: Vec<Vec<u8>> = store
                .data
                .prefix(Vec::<u8>::new())
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.data, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// FjallLogStore
// ---------------------------------------------------------------------------

/// [`LogStore`] backed by fjall.
pub struct FjallLogStore(pub Arc<FjallStore>);

impl LogStore for FjallLogStore {
    async fn log_state(&self) -> Result<LogState, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, SkerryError> {
            let mut first_index: Option<u64> = None;
            let mut last_index: Option<u64> = None;

            for guard in store.raft_log.prefix(Vec::<u8>::new()) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let idx_bytes: [u8; 8] = k[..8]
                    .try_into()
                    .map_err(|_| SkerryError::Storage("short raft_log key".into()))?;
                let idx = u64::from_be_bytes(idx_bytes);
                if first_index.is_none() {
                    first_index = Some(idx);
                }
                last_index = Some(idx);
            }

            let last_purged_index =
                match store.raft_meta.get(META_LAST_PURGED).map_err(fjall_err)? {
                    Some(b) => Some(decode::<u64>(&b)?),
                    None => None,
                };

            Ok(LogState { first_index, last_index, last_purged_index })
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, SkerryError> {
            let start = log_key(from).to_vec();
            let end = log_key(to_inclusive).to_vec();
            store
                .raft_log
                .range(start..=end)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v))
                })
                .collect()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.raft_log, log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn truncate(&self, from_index: u64) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            let start = log_key(from_index).to_vec();
            let end = log_key(u64::MAX).to_vec();

            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.raft_log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            let start = log_key(0).to_vec();
            let end = log_key(up_to_index).to_vec();

            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.raft_meta, META_LAST_PURGED.to_vec(), encode(&up_to_index)?);
            batch.commit().map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            store.raft_meta.insert(META_VOTE.to_vec(), encode(&vote)?).map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn read_vote(&self) -> Result<Option<Vote>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vote>, SkerryError> {
            match store.raft_meta.get(META_VOTE).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<Vote>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn save_membership(
        &self,
        members: BTreeMap<NodeId, String>,
    ) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            store
                .raft_meta
                .insert(META_MEMBERSHIP.to_vec(), encode(&members)?)
                .map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn read_membership(
        &self,
    ) -> Result<Option<BTreeMap<NodeId, String>>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(
            move || -> Result<Option<BTreeMap<NodeId, String>>, SkerryError> {
                match store.raft_meta.get(META_MEMBERSHIP).map_err(fjall_err)? {
                    Some(b) => Ok(Some(decode::<BTreeMap<NodeId, String>>(&b)?)),
                    None => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn save_snapshot(&self, snapshot: SnapshotBlob) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            store
                .raft_meta
                .insert(META_SNAPSHOT.to_vec(), encode(&snapshot)?)
                .map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn read_snapshot(&self) -> Result<Option<SnapshotBlob>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<SnapshotBlob>, SkerryError> {
            match store.raft_meta.get(META_SNAPSHOT).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<SnapshotBlob>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn save_last_applied(&self, index: u64) -> Result<(), SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SkerryError> {
            store
                .raft_meta
                .insert(META_LAST_APPLIED.to_vec(), encode(&index)?)
                .map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }

    async fn read_last_applied(&self) -> Result<Option<u64>, SkerryError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<u64>, SkerryError> {
            match store.raft_meta.get(META_LAST_APPLIED).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<u64>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| SkerryError::Storage(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogPayload;

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, payload: LogPayload::Blank }
    }

    fn open_store(dir: &std::path::Path) -> Arc<FjallStore> {
        FjallStore::open(dir).expect("open store")
    }

    // -----------------------------------------------------------------------
    // FjallEngine
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn engine_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FjallEngine(open_store(dir.path()));

        assert!(matches!(engine.get(b"k").await, Err(SkerryError::NotFound)));

        engine.set(b"k", b"v").await.unwrap();
        assert_eq!(engine.get(b"k").await.unwrap(), b"v");

        engine.set(b"k", b"v2").await.unwrap();
        assert_eq!(engine.get(b"k").await.unwrap(), b"v2");

        engine.delete(b"k").await.unwrap();
        assert!(matches!(engine.get(b"k").await, Err(SkerryError::NotFound)));
        assert!(matches!(engine.delete(b"k").await, Err(SkerryError::NotFound)));
    }

    #[tokio::test]
    async fn engine_scan_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FjallEngine(open_store(dir.path()));

        engine.set(b"b", b"2").await.unwrap();
        engine.set(b"a", b"1").await.unwrap();
        engine.set(b"c", b"3").await.unwrap();

        let all = engine.scan().await.unwrap();
        let keys: Vec<&[u8]> = all.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[tokio::test]
    async fn engine_clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FjallEngine(open_store(dir.path()));

        for i in 0..10u8 {
            engine.set(&[i], &[i]).await.unwrap();
        }
        engine.clear().await.unwrap();
        assert!(engine.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = FjallEngine(open_store(dir.path()));
            engine.set(b"x", b"persist").await.unwrap();
        }
        let engine = FjallEngine(open_store(dir.path()));
        assert_eq!(engine.get(b"x").await.unwrap(), b"persist");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FjallEngine(open_store(dir.path())));

        let mut handles = Vec::new();
        for w in 0u8..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for i in 0u16..500 {
                    let key = format!("w{w}-k{i}");
                    engine.set(key.as_bytes(), &i.to_be_bytes()).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for w in 0u8..8 {
            for i in 0u16..500 {
                let key = format!("w{w}-k{i}");
                assert_eq!(engine.get(key.as_bytes()).await.unwrap(), i.to_be_bytes());
            }
        }
    }

    // -----------------------------------------------------------------------
    // FjallLogStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn log_store_basic() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStore(open_store(dir.path()));

        let state = log.log_state().await.unwrap();
        assert!(state.first_index.is_none());

        log.append(vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let es = log.entries(1, 2).await.unwrap();
        assert_eq!(es.len(), 2);

        log.truncate(3).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.last_index, Some(2));

        log.purge(1).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.last_purged_index, Some(1));
        assert!(log.entries(1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_store_vote_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FjallLogStore(open_store(dir.path()));
            assert!(log.read_vote().await.unwrap().is_none());
            log.save_vote(Vote { term: 7, voted_for: Some("n2".into()) }).await.unwrap();
        }
        let log = FjallLogStore(open_store(dir.path()));
        let loaded = log.read_vote().await.unwrap().unwrap();
        assert_eq!(loaded.term, 7);
        assert_eq!(loaded.voted_for, Some("n2".into()));
    }

    #[tokio::test]
    async fn log_store_membership_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStore(open_store(dir.path()));

        assert!(log.read_membership().await.unwrap().is_none());
        let mut members = BTreeMap::new();
        members.insert("n1".to_string(), "127.0.0.1:12000".to_string());
        log.save_membership(members.clone()).await.unwrap();
        assert_eq!(log.read_membership().await.unwrap().unwrap(), members);

        assert!(log.read_snapshot().await.unwrap().is_none());
        let blob = SnapshotBlob {
            meta: crate::types::SnapshotMeta { last_index: 9, last_term: 2 },
            data: b"{}\n".to_vec(),
        };
        log.save_snapshot(blob.clone()).await.unwrap();
        let loaded = log.read_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.meta, blob.meta);
        assert_eq!(loaded.data, blob.data);
    }

    #[tokio::test]
    async fn log_store_append_overwrites_same_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStore(open_store(dir.path()));

        log.append(vec![make_entry(1, 1)]).await.unwrap();
        log.append(vec![make_entry(1, 2)]).await.unwrap();

        let es = log.entries(1, 1).await.unwrap();
        assert_eq!(es.len(), 1);
        assert_eq!(es[0].term, 2);
    }
}
