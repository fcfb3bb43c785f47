//! A 2PC replica: owns a slice of the digest domain, enforces the Lamport
//! ordering discipline, defers future-timestamped requests into a backlog,
//! and holds at most one prepared message between PREPARE and COMMIT/ABORT.

use std::sync::Arc;

use prost::Message as _;
use tokio::sync::RwLock;

use skerry_proto::v1::{DeleteRequest, GetRequest, SetRequest, StoredValue};
use skerry_storage::Engine;
use skerry_types::{digest_key, Backlog, Range, SkerryError};

/// A request queued while the replica's clock catches up.
#[derive(Debug, Clone)]
pub enum QueuedMsg {
    Set(SetRequest),
    Delete(DeleteRequest),
    Get(GetRequest),
}

impl QueuedMsg {
    fn lamport(&self) -> u64 {
        match self {
            QueuedMsg::Set(m) => m.lamport,
            QueuedMsg::Delete(m) => m.lamport,
            QueuedMsg::Get(m) => m.lamport,
        }
    }
}

struct Guard {
    /// Assigned by the coordinator via `SetHashrange`; requests are rejected
    /// until then.
    hashrange: Option<Range>,
    /// Lamport timestamp of the last processed message.
    timestamp: u64,
    backlog: Backlog<QueuedMsg>,
    /// The single outstanding prepared message; a later PREPARE overwrites it.
    locked: Option<QueuedMsg>,
}

pub struct Partition<E: Engine> {
    engine: Arc<E>,
    guard: RwLock<Guard>,
}

impl<E: Engine> Partition<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Partition {
            engine,
            guard: RwLock::new(Guard {
                hashrange: None,
                timestamp: 0,
                backlog: Backlog::new(),
                locked: None,
            }),
        }
    }

    pub async fn set_hashrange(&self, range: Range) {
        let mut g = self.guard.write().await;
        g.hashrange = Some(range);
    }

    pub async fn hashrange(&self) -> Option<Range> {
        self.guard.read().await.hashrange
    }

    pub async fn timestamp(&self) -> u64 {
        self.guard.read().await.timestamp
    }

    pub async fn backlog_len(&self) -> usize {
        self.guard.read().await.backlog.len()
    }

    // -----------------------------------------------------------------------
    // Public request paths
    // -----------------------------------------------------------------------

    pub async fn handle_set(&self, req: SetRequest) -> Result<(), SkerryError> {
        let mut g = self.guard.write().await;
        let result = self.sequenced_apply(&mut g, QueuedMsg::Set(req)).await;
        self.finish_crud(&mut g, result.as_ref().err()).await;
        result
    }

    pub async fn handle_delete(&self, req: DeleteRequest) -> Result<(), SkerryError> {
        let mut g = self.guard.write().await;
        let result = self.sequenced_apply(&mut g, QueuedMsg::Delete(req)).await;
        self.finish_crud(&mut g, result.as_ref().err()).await;
        result
    }

    pub async fn handle_get(
        &self,
        req: GetRequest,
    ) -> Result<Option<StoredValue>, SkerryError> {
        let mut g = self.guard.write().await;
        let result = match self.validate_ts(&mut g, QueuedMsg::Get(req.clone())) {
            Ok(()) => self.read_stored(&g, &req.key).await,
            Err(err) => Err(err),
        };
        self.finish_crud(&mut g, result.as_ref().err()).await;
        result
    }

    // -----------------------------------------------------------------------
    // Two-phase commit surface
    // -----------------------------------------------------------------------

    /// PREPARE: lock the payload. The source tolerates a second PREPARE
    /// overwriting an uncommitted one, and so does this replica.
    pub async fn prepare(&self, msg: QueuedMsg) -> Result<(), SkerryError> {
        if matches!(msg, QueuedMsg::Get(_)) {
            return Err(SkerryError::UnsupportedPrepareMsg);
        }
        let mut g = self.guard.write().await;
        if g.locked.is_some() {
            tracing::warn!("prepare overwrites an existing locked message");
        }
        g.locked = Some(msg);
        Ok(())
    }

    /// COMMIT: apply the locked message through the normal sequenced path.
    /// The lock is cleared only on success.
    pub async fn commit(&self) -> Result<(), SkerryError> {
        let mut g = self.guard.write().await;
        let msg = g.locked.clone().ok_or(SkerryError::NoLockedMessage)?;
        let result = self.sequenced_apply(&mut g, msg).await;
        self.finish_crud(&mut g, result.as_ref().err()).await;
        if result.is_ok() {
            g.locked = None;
        }
        result
    }

    /// ABORT: drop the locked message, then drain whatever became ready.
    pub async fn abort(&self) -> Result<(), SkerryError> {
        let mut g = self.guard.write().await;
        g.locked = None;
        self.drain_backlog(&mut g).await
    }

    // -----------------------------------------------------------------------
    // Sequencing
    // -----------------------------------------------------------------------

    /// Check the message's Lamport timestamp and apply it when it is exactly
    /// the next one. Future messages land in the backlog.
    async fn sequenced_apply(
        &self,
        g: &mut Guard,
        msg: QueuedMsg,
    ) -> Result<(), SkerryError> {
        self.validate_ts(g, msg.clone())?;
        self.apply(g, &msg).await
    }

    fn validate_ts(&self, g: &mut Guard, msg: QueuedMsg) -> Result<(), SkerryError> {
        let ts = msg.lamport();
        if ts <= g.timestamp {
            return Err(SkerryError::StaleTimestamp { current: g.timestamp, received: ts });
        }
        if ts > g.timestamp + 1 {
            g.backlog.push(ts, msg);
            return Err(SkerryError::TimestampNotNext {
                current: g.timestamp,
                received: ts,
            });
        }
        Ok(())
    }

    /// Post-CRUD bookkeeping: on success the clock advances, then the backlog
    /// is drained either way. Timestamp rejections are logged at warn; the
    /// caller's outcome is never altered here.
    async fn finish_crud(&self, g: &mut Guard, err: Option<&SkerryError>) {
        match err {
            None => g.timestamp += 1,
            Some(err) if err.is_timestamp_warning() => {
                tracing::warn!(%err, "request rejected by timestamp guard");
            }
            Some(err) => {
                tracing::error!(%err, "request failed");
            }
        }
        if let Err(err) = self.drain_backlog(g).await {
            tracing::error!(%err, "backlog drain failed");
        }
    }

    /// Replay deferred messages while the next one is at most one tick ahead.
    /// Entries at or below the clock are duplicates and dropped as stale.
    async fn drain_backlog(&self, g: &mut Guard) -> Result<(), SkerryError> {
        loop {
            match g.backlog.smallest_timestamp() {
                Some(ts) if ts <= g.timestamp + 1 => {
                    let (ts, msg) = g.backlog.pop().expect("probed non-empty backlog");
                    if ts <= g.timestamp {
                        tracing::warn!(
                            ts,
                            current = g.timestamp,
                            "dropping stale backlog entry"
                        );
                        continue;
                    }
                    match &msg {
                        QueuedMsg::Get(_) => {} // nothing to replay for reads
                        _ => self.apply(g, &msg).await?,
                    }
                    g.timestamp = ts;
                    tracing::debug!(ts, "processed backlog message");
                }
                _ => return Ok(()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Engine access
    // -----------------------------------------------------------------------

    fn check_key_range(&self, g: &Guard, key: &[u8]) -> Result<(), SkerryError> {
        let digest = digest_key(key);
        match &g.hashrange {
            Some(range) if range.contains(&digest) => Ok(()),
            _ => Err(SkerryError::NotThisPartitionKey),
        }
    }

    async fn apply(&self, g: &mut Guard, msg: &QueuedMsg) -> Result<(), SkerryError> {
        match msg {
            QueuedMsg::Set(req) => {
                self.check_key_range(g, &req.key)?;
                let stored =
                    StoredValue { lamport: req.lamport, value: req.value.clone() };
                self.engine
                    .set(&req.key, &stored.encode_to_vec())
                    .await
                    .map_err(|e| SkerryError::Internal(e.to_string()))
            }
            QueuedMsg::Delete(req) => {
                self.check_key_range(g, &req.key)?;
                match self.engine.delete(&req.key).await {
                    Ok(()) | Err(SkerryError::NotFound) => Ok(()),
                    Err(e) => Err(SkerryError::Internal(e.to_string())),
                }
            }
            QueuedMsg::Get(_) => Ok(()),
        }
    }

    async fn read_stored(
        &self,
        g: &Guard,
        key: &[u8],
    ) -> Result<Option<StoredValue>, SkerryError> {
        self.check_key_range(g, key)?;
        match self.engine.get(key).await {
            Ok(bytes) => StoredValue::decode(bytes.as_slice())
                .map(Some)
                .map_err(|e| SkerryError::Internal(e.to_string())),
            Err(SkerryError::NotFound) => Ok(None),
            Err(e) => Err(SkerryError::Internal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skerry_storage::mem::MemEngine;
    use skerry_types::{DOMAIN_MAX, DOMAIN_MIN};

    fn set_req(key: &[u8], value: &[u8], lamport: u64) -> SetRequest {
        SetRequest { key: key.to_vec(), value: value.to_vec(), lamport, client_id: 0 }
    }

    fn delete_req(key: &[u8], lamport: u64) -> DeleteRequest {
        DeleteRequest { key: key.to_vec(), lamport, client_id: 0 }
    }

    fn get_req(key: &[u8], lamport: u64) -> GetRequest {
        GetRequest { key: key.to_vec(), lamport, client_id: 0 }
    }

    async fn full_domain_partition() -> Partition<MemEngine> {
        let partition = Partition::new(Arc::new(MemEngine::new()));
        partition.set_hashrange(Range::new(DOMAIN_MIN, DOMAIN_MAX)).await;
        partition
    }

    #[tokio::test]
    async fn sequenced_set_and_get() {
        let p = full_domain_partition().await;

        p.handle_set(set_req(b"k", b"v", 1)).await.unwrap();
        assert_eq!(p.timestamp().await, 1);

        let stored = p.handle_get(get_req(b"k", 2)).await.unwrap().unwrap();
        assert_eq!(stored.lamport, 1);
        assert_eq!(stored.value, b"v");
        assert_eq!(p.timestamp().await, 2);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_without_moving_the_clock() {
        let p = full_domain_partition().await;
        p.handle_set(set_req(b"k", b"v", 1)).await.unwrap();

        let err = p.handle_set(set_req(b"k", b"v2", 1)).await;
        assert!(matches!(err, Err(SkerryError::StaleTimestamp { current: 1, received: 1 })));
        assert_eq!(p.timestamp().await, 1);

        // Value unchanged.
        let stored = p.handle_get(get_req(b"k", 2)).await.unwrap().unwrap();
        assert_eq!(stored.value, b"v");
    }

    #[tokio::test]
    async fn future_timestamp_enters_backlog_and_replays() {
        let p = full_domain_partition().await;

        let err = p.handle_set(set_req(b"b", b"2", 2)).await;
        assert!(matches!(err, Err(SkerryError::TimestampNotNext { current: 0, received: 2 })));
        assert_eq!(p.backlog_len().await, 1);

        // The in-order message lands, then the backlog drains behind it.
        p.handle_set(set_req(b"a", b"1", 1)).await.unwrap();
        assert_eq!(p.timestamp().await, 2);
        assert_eq!(p.backlog_len().await, 0);

        let stored = p.handle_get(get_req(b"b", 3)).await.unwrap().unwrap();
        assert_eq!(stored.value, b"2");
    }

    #[tokio::test]
    async fn deferred_run_replays_in_order_and_drops_duplicates() {
        let p = full_domain_partition().await;
        for i in 1..=5u64 {
            p.handle_set(set_req(format!("k{i}").as_bytes(), b"x", i)).await.unwrap();
        }
        assert_eq!(p.timestamp().await, 5);

        for ts in [8u64, 7, 6] {
            let err = p.handle_set(set_req(format!("t{ts}").as_bytes(), b"y", ts)).await;
            assert!(matches!(err, Err(SkerryError::TimestampNotNext { .. })));
        }
        assert_eq!(p.backlog_len().await, 3);

        // A fresh ts=6 applies directly; 7 and 8 drain; the queued duplicate
        // 6 is dropped as stale.
        p.handle_set(set_req(b"fresh6", b"z", 6)).await.unwrap();
        assert_eq!(p.timestamp().await, 8);
        assert_eq!(p.backlog_len().await, 0);

        assert!(p.handle_get(get_req(b"t7", 9)).await.unwrap().is_some());
        assert!(p.handle_get(get_req(b"t8", 10)).await.unwrap().is_some());
        // The duplicate never applied.
        assert!(p.handle_get(get_req(b"t6", 11)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_roundtrip() {
        let p = full_domain_partition().await;
        p.handle_set(set_req(b"k", b"v", 1)).await.unwrap();
        p.handle_delete(delete_req(b"k", 2)).await.unwrap();
        assert!(p.handle_get(get_req(b"k", 3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_outside_range_is_rejected() {
        let engine = Arc::new(MemEngine::new());
        let p = Partition::new(engine);

        // No range assigned yet.
        let err = p.handle_set(set_req(b"k", b"v", 1)).await;
        assert!(matches!(err, Err(SkerryError::NotThisPartitionKey)));

        // A range that covers only the digest of "inside".
        let inside = digest_key(b"inside");
        let mut just_above = inside;
        just_above[31] = just_above[31].wrapping_add(1);
        p.set_hashrange(Range::new(inside, just_above)).await;

        p.handle_set(set_req(b"inside", b"v", 1)).await.unwrap();
        let err = p.handle_set(set_req(b"outside", b"v", 2)).await;
        assert!(matches!(err, Err(SkerryError::NotThisPartitionKey)));
    }

    #[tokio::test]
    async fn prepare_commit_applies_locked_message() {
        let p = full_domain_partition().await;

        p.prepare(QueuedMsg::Set(set_req(b"k", b"v", 1))).await.unwrap();
        p.commit().await.unwrap();

        let stored = p.handle_get(get_req(b"k", 2)).await.unwrap().unwrap();
        assert_eq!(stored.lamport, 1);
        assert_eq!(stored.value, b"v");

        // The lock is gone.
        assert!(matches!(p.commit().await, Err(SkerryError::NoLockedMessage)));
    }

    #[tokio::test]
    async fn abort_clears_lock_and_drains() {
        let p = full_domain_partition().await;

        // Backlogged future write waits behind the aborted 2PC slot.
        let _ = p.handle_set(set_req(b"later", b"x", 2)).await;

        p.prepare(QueuedMsg::Set(set_req(b"k", b"v", 1))).await.unwrap();
        p.abort().await.unwrap();
        assert!(matches!(p.commit().await, Err(SkerryError::NoLockedMessage)));

        // Nothing was written by the aborted prepare.
        assert!(p.handle_get(get_req(b"k", 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_prepare_overwrites_unlocked_message() {
        let p = full_domain_partition().await;

        p.prepare(QueuedMsg::Set(set_req(b"k", b"first", 1))).await.unwrap();
        p.prepare(QueuedMsg::Set(set_req(b"k", b"second", 1))).await.unwrap();
        p.commit().await.unwrap();

        let stored = p.handle_get(get_req(b"k", 2)).await.unwrap().unwrap();
        assert_eq!(stored.value, b"second");
    }

    #[tokio::test]
    async fn prepare_rejects_reads() {
        let p = full_domain_partition().await;
        let err = p.prepare(QueuedMsg::Get(get_req(b"k", 1))).await;
        assert!(matches!(err, Err(SkerryError::UnsupportedPrepareMsg)));
    }
}
