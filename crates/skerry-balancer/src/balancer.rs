//! The coordinator: registers partitions against the coverage map, routes
//! keys to range views, serializes per-range Lamport assignment, and runs the
//! two-phase atomic commit for mutations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use skerry_proto::v1::{
    prepare_commit_request, DeleteRequest, GetRequest, PrepareCommitRequest,
    SetHashrangeRequest, SetRequest, StoredValue,
};
use skerry_storage::Engine;
use skerry_types::{digest_key, RangeKey, SkerryError};

use crate::coverage::Coverage;
use crate::keys::{COVERAGE_KEY, PREPARE_COMMIT_DECISION_KEY};
use crate::rangeview::{partition_client, RangeView};

/// Result of a coordinator read: the freshest value (by stored Lamport) and
/// the replicas dropped from the view because they were unreachable.
pub struct GetOutcome {
    pub stored: Option<StoredValue>,
    pub offline: Vec<String>,
}

pub(crate) struct Inner {
    pub views: HashMap<RangeKey, RangeView>,
    pub coverage: Coverage,
    /// Client id → Lamport of the last processed request for that client.
    pub client_clocks: HashMap<u64, u64>,
}

pub struct Balancer<E: Engine> {
    pub(crate) engine: Arc<E>,
    /// One mutex for the whole coordinator: requests serialize so that
    /// per-range timestamp assignment has no races.
    pub(crate) inner: Mutex<Inner>,
    /// Reserved engine keys, held as typed handles.
    pub(crate) decision_key: &'static [u8],
    coverage_key: &'static [u8],
}

impl<E: Engine> Balancer<E> {
    /// Open a coordinator over its own engine. Coverage is reloaded from the
    /// engine when present, otherwise seeded from `goal_replica_ranges` and
    /// persisted. A pending 2PC decision left by a crash is replayed before
    /// any request is served.
    pub async fn new(engine: Arc<E>, goal_replica_ranges: u64) -> Result<Self, SkerryError> {
        let coverage = match engine.get(COVERAGE_KEY).await {
            Ok(bytes) => {
                let (coverage, _): (Coverage, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| SkerryError::Storage(e.to_string()))?;
                coverage
            }
            Err(SkerryError::NotFound) => Coverage::setup(goal_replica_ranges),
            Err(e) => return Err(e),
        };

        let balancer = Balancer {
            engine,
            inner: Mutex::new(Inner {
                views: HashMap::new(),
                coverage,
                client_clocks: HashMap::new(),
            }),
            decision_key: PREPARE_COMMIT_DECISION_KEY,
            coverage_key: COVERAGE_KEY,
        };
        balancer.save_coverage().await?;
        balancer.recover_pending_decision().await?;
        Ok(balancer)
    }

    async fn save_coverage(&self) -> Result<(), SkerryError> {
        let inner = self.inner.lock().await;
        let bytes =
            bincode::serde::encode_to_vec(&inner.coverage, bincode::config::standard())
                .map_err(|e| SkerryError::Storage(e.to_string()))?;
        drop(inner);
        self.engine.set(self.coverage_key, &bytes).await
    }

    // -----------------------------------------------------------------------
    // Partition registration
    // -----------------------------------------------------------------------

    /// Assign the least-covered interval to the partition at `addr`: push the
    /// hashrange to it, join it into the range view, bump the coverage.
    pub async fn register_partition(&self, addr: &str) -> Result<(), SkerryError> {
        let mut client = partition_client(addr)?;

        let mut inner = self.inner.lock().await;
        let (range_key, lower_at) = inner.coverage.next_partition_range()?;
        let range = range_key.to_range()?;

        client
            .set_hashrange(SetHashrangeRequest {
                min: range.min.to_vec(),
                max: range.max.to_vec(),
            })
            .await
            .map_err(|e| SkerryError::Transport(e.to_string()))?;

        inner
            .views
            .entry(range_key.clone())
            .or_default()
            .add_partition_data(client, addr.to_string());
        inner.coverage.bump_ticks(lower_at);
        drop(inner);

        self.save_coverage().await?;
        tracing::info!(%addr, range = %range_key, "partition registered");
        Ok(())
    }

    pub(crate) fn range_key_for(
        inner: &Inner,
        key: &[u8],
    ) -> Result<RangeKey, SkerryError> {
        let digest = digest_key(key);
        for range_key in inner.views.keys() {
            if range_key.to_range()?.contains(&digest) {
                return Ok(range_key.clone());
            }
        }
        Err(SkerryError::DigestNotCovered)
    }

    /// The Lamport the next mutation of this key's range would carry.
    pub async fn next_lamport_for_key(&self, key: &[u8]) -> u64 {
        let inner = self.inner.lock().await;
        match Self::range_key_for(&inner, key) {
            Ok(range_key) => inner.views[&range_key].lamport + 1,
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Relayed operations
    // -----------------------------------------------------------------------

    /// Read from every responsible replica and keep the answer with the
    /// highest stored Lamport. Unreachable replicas are dropped from the view
    /// after a single failure.
    pub async fn get(&self, key: &[u8]) -> Result<GetOutcome, SkerryError> {
        let mut inner = self.inner.lock().await;
        let range_key = Self::range_key_for(&inner, key)?;
        let view = inner.views.get_mut(&range_key).expect("resolved range has a view");
        if view.is_empty() {
            return Err(SkerryError::RangeNotYetCovered);
        }

        // The read itself consumes a tick of the range clock.
        view.lamport += 1;
        let request_lamport = view.lamport;
        let members = view.members();

        let mut best: Option<StoredValue> = None;
        let mut best_lamport = 0u64;
        let mut answered = false;
        let mut offline = Vec::new();

        for (mut client, addr) in members {
            let req = GetRequest {
                key: key.to_vec(),
                lamport: request_lamport,
                client_id: 0,
            };
            match client.get(req).await {
                Err(status) => {
                    if status.code() == tonic::Code::Unavailable {
                        offline.push(addr);
                    }
                }
                Ok(resp) => {
                    answered = true;
                    if let Some(stored) = resp.into_inner().stored_value {
                        if stored.lamport >= best_lamport {
                            best_lamport = stored.lamport;
                            best = Some(stored);
                        }
                    }
                }
            }
        }

        for addr in &offline {
            tracing::warn!(%addr, "dropping unreachable partition from range view");
            view.remove_partition(addr)?;
        }

        if !answered {
            return Err(SkerryError::AllReplicasFailed);
        }
        Ok(GetOutcome { stored: best, offline })
    }

    /// Mutations run the two-phase atomic commit against the whole view.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SkerryError> {
        let mut inner = self.inner.lock().await;
        let range_key = Self::range_key_for(&inner, key)?;
        let lamport = inner.views[&range_key].lamport + 1;
        let msg = PrepareCommitRequest {
            message: Some(prepare_commit_request::Message::Set(SetRequest {
                key: key.to_vec(),
                value: value.to_vec(),
                lamport,
                client_id: 0,
            })),
        };
        self.atomic_message(&mut inner, &range_key, msg).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), SkerryError> {
        let mut inner = self.inner.lock().await;
        let range_key = Self::range_key_for(&inner, key)?;
        let lamport = inner.views[&range_key].lamport + 1;
        let msg = PrepareCommitRequest {
            message: Some(prepare_commit_request::Message::Delete(DeleteRequest {
                key: key.to_vec(),
                lamport,
                client_id: 0,
            })),
        };
        self.atomic_message(&mut inner, &range_key, msg).await
    }

    // -----------------------------------------------------------------------
    // Client clocks
    // -----------------------------------------------------------------------

    /// Register a new client; its clock starts at zero.
    pub async fn next_client_id(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.client_clocks.len() as u64 + 1;
        inner.client_clocks.insert(id, 0);
        id
    }

    /// A request from `client_id` must carry exactly `last + 1`.
    pub async fn validate_client(&self, client_id: u64, ts: u64) -> Result<(), SkerryError> {
        let inner = self.inner.lock().await;
        let last = inner.client_clocks.get(&client_id).copied().unwrap_or(0);
        if ts <= last {
            return Err(SkerryError::StaleTimestamp { current: last, received: ts });
        }
        if ts > last + 1 {
            return Err(SkerryError::TimestampNotNext { current: last, received: ts });
        }
        Ok(())
    }

    /// Advance the client's clock; runs after every CRUD regardless of the
    /// outcome, keeping per-client timestamps strictly monotonic.
    pub async fn increment_client(&self, client_id: u64) {
        let mut inner = self.inner.lock().await;
        *inner.client_clocks.entry(client_id).or_insert(0) += 1;
    }

    pub async fn client_clock(&self, client_id: u64) -> u64 {
        self.inner.lock().await.client_clocks.get(&client_id).copied().unwrap_or(0)
    }

    pub async fn coverage(&self) -> Coverage {
        self.inner.lock().await.coverage.clone()
    }
}
