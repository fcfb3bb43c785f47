//! The replicated state machine for one shard: a compact leader-based
//! consensus replica persisting through [`LogStore`] and applying committed
//! commands to an [`Engine`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use skerry_proto::v1::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, VoteRequest,
    VoteResponse,
};
use skerry_storage::snapshot;
use skerry_storage::{Engine, LogEntry, LogPayload, LogStore, SnapshotBlob, SnapshotMeta, Vote};
use skerry_types::{Command, NodeId, SkerryError};

use crate::config::RaftConfig;
use crate::rpc::{entry_to_wire, wire_to_entry, PeerPool};

const SNAPSHOT_CHUNK: usize = 64 * 1024;
/// Apply results older than this many entries behind the apply cursor are
/// dropped; a proposer that has not collected its result by then timed out.
const RESULT_RETENTION: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a replica, served by the status endpoint.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub node_id: NodeId,
    pub is_leader: bool,
    /// Consensus address of the known leader; empty when unknown.
    pub leader_addr: String,
    pub term: u64,
    pub last_log_index: u64,
}

struct RaftState {
    role: Role,
    term: u64,
    voted_for: Option<NodeId>,
    /// Contiguous in-memory log suffix; entry indexes run from
    /// `last_purged + 1` to `last_index()`.
    log: Vec<LogEntry>,
    last_purged: u64,
    last_purged_term: u64,
    commit_index: u64,
    last_applied: u64,
    /// Effective voter set: node id → consensus address.
    membership: BTreeMap<NodeId, String>,
    leader: Option<(NodeId, String)>,
    election_deadline: Instant,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    /// Apply outcome per log index, collected by the proposer.
    apply_results: HashMap<u64, Option<SkerryError>>,
}

impl RaftState {
    fn last_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.last_purged)
    }

    fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.last_purged_term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.last_purged || index > self.last_index() {
            return None;
        }
        self.log.get((index - self.last_purged - 1) as usize)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.last_purged {
            return Some(self.last_purged_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn peers(&self, self_id: &NodeId) -> Vec<(NodeId, String)> {
        self.membership
            .iter()
            .filter(|(id, _)| *id != self_id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    fn leader_hint(&self) -> Option<String> {
        self.leader.as_ref().map(|(_, addr)| addr.clone())
    }

    fn reset_election_deadline(&mut self, config: &RaftConfig) {
        let jitter = rand::thread_rng()
            .gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }
}

/// What the tick loop decided to do with the lock released.
enum TickAction {
    Idle,
    Heartbeat(Vec<(NodeId, String)>),
    Campaign { term: u64, last_log_index: u64, last_log_term: u64, peers: Vec<(NodeId, String)> },
}

pub struct RaftReplica<E: Engine, L: LogStore> {
    node_id: NodeId,
    addr: String,
    config: RaftConfig,
    engine: Arc<E>,
    log_store: Arc<L>,
    state: Mutex<RaftState>,
    peers: PeerPool,
    shutdown: watch::Sender<bool>,
}

impl<E: Engine, L: LogStore> RaftReplica<E, L> {
    /// Recover persisted state and start the replica's tick loop.
    ///
    /// With no prior state and no join address, bootstraps a single-voter
    /// cluster with this node as the sole server; otherwise the replica
    /// starts as an empty follower and waits for an `AddVoter` from a leader.
    pub async fn start(
        node_id: NodeId,
        addr: String,
        config: RaftConfig,
        engine: Arc<E>,
        log_store: Arc<L>,
        joining: bool,
    ) -> Result<Arc<Self>, SkerryError> {
        let vote = log_store.read_vote().await?;
        let membership = log_store.read_membership().await?;
        let snapshot_meta = log_store.read_snapshot().await?.map(|s| s.meta);
        let log_state = log_store.log_state().await?;
        let last_purged = log_state.last_purged_index.unwrap_or(0);
        let log = match (log_state.first_index, log_state.last_index) {
            (Some(first), Some(last)) => log_store.entries(first, last).await?,
            _ => Vec::new(),
        };
        let last_applied = log_store.read_last_applied().await?.unwrap_or(0);

        let has_state = vote.is_some() || membership.is_some() || !log.is_empty();

        let mut state = RaftState {
            role: Role::Follower,
            term: vote.as_ref().map(|v| v.term).unwrap_or(0),
            voted_for: vote.and_then(|v| v.voted_for),
            log,
            last_purged,
            last_purged_term: snapshot_meta
                .filter(|m| m.last_index == last_purged)
                .map(|m| m.last_term)
                .unwrap_or(0),
            commit_index: last_applied,
            last_applied,
            membership: membership.unwrap_or_default(),
            leader: None,
            election_deadline: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            apply_results: HashMap::new(),
        };
        state.reset_election_deadline(&config);

        if !has_state && !joining {
            state.membership.insert(node_id.clone(), addr.clone());
            state.term = 1;
            state.voted_for = Some(node_id.clone());
            state.role = Role::Leader;
            state.leader = Some((node_id.clone(), addr.clone()));
            log_store.save_membership(state.membership.clone()).await?;
            log_store
                .save_vote(Vote { term: 1, voted_for: Some(node_id.clone()) })
                .await?;
            tracing::info!(node_id = %node_id, %addr, "bootstrapped single-voter cluster");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let rpc_timeout = Duration::from_millis(config.apply_timeout_ms);
        let replica = Arc::new(RaftReplica {
            node_id,
            addr,
            config,
            engine,
            log_store,
            state: Mutex::new(state),
            peers: PeerPool::new(rpc_timeout),
            shutdown,
        });

        tokio::spawn(Self::run(replica.clone(), shutdown_rx));
        Ok(replica)
    }

    /// Stop the tick loop. In-flight requests finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub async fn status(&self) -> ReplicaStatus {
        let st = self.state.lock().await;
        ReplicaStatus {
            node_id: self.node_id.clone(),
            is_leader: st.role == Role::Leader,
            leader_addr: st.leader_hint().unwrap_or_default(),
            term: st.term,
            last_log_index: st.last_index(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    // -----------------------------------------------------------------------
    // Client-facing operations
    // -----------------------------------------------------------------------

    /// Replicate a command and apply it, within the configured apply deadline.
    /// On a non-leader this fails immediately with a leader hint.
    pub async fn propose(&self, cmd: Command) -> Result<(), SkerryError> {
        let deadline = Duration::from_millis(self.config.apply_timeout_ms);
        self.propose_payload(LogPayload::Command(cmd), deadline).await
    }

    /// Add a voting member. Only honored by the leader; the change is
    /// replicated through the log like any other entry.
    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<(), SkerryError> {
        let members = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(SkerryError::NotLeader { leader: st.leader_hint() });
            }
            let mut members = st.membership.clone();
            members.insert(id, addr);
            members
        };
        self.propose_payload(LogPayload::Membership(members), Duration::from_secs(10))
            .await
    }

    async fn propose_payload(
        &self,
        payload: LogPayload,
        deadline: Duration,
    ) -> Result<(), SkerryError> {
        tokio::time::timeout(deadline, self.propose_inner(payload))
            .await
            .map_err(|_| SkerryError::Timeout)?
    }

    async fn propose_inner(&self, payload: LogPayload) -> Result<(), SkerryError> {
        // Phase 1: append to the leader log.
        let (index, term, peers) = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(SkerryError::NotLeader { leader: st.leader_hint() });
            }
            let index = st.last_index() + 1;
            let entry = LogEntry { index, term: st.term, payload };
            self.log_store.append(vec![entry.clone()]).await?;
            st.log.push(entry);
            (index, st.term, st.peers(&self.node_id))
        };

        // Phase 2/3: replicate with the lock released, then count the quorum
        // and apply. Retries until the caller's deadline cancels us.
        loop {
            if !peers.is_empty() {
                futures::future::join_all(
                    peers.iter().map(|(id, addr)| self.replicate_to(id.clone(), addr.clone())),
                )
                .await;
            }

            let mut st = self.state.lock().await;
            if st.term != term || st.role != Role::Leader {
                return Err(SkerryError::NotLeader { leader: st.leader_hint() });
            }
            self.advance_commit(&mut st);
            if st.commit_index >= index {
                self.apply_committed(&mut st).await?;
                return match st.apply_results.remove(&index).flatten() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            drop(st);
            tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms))
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Leader-side replication
    // -----------------------------------------------------------------------

    /// Bring one follower up to `last_index()`: ship log entries, backing the
    /// cursor up on mismatch, or fall back to a snapshot when the follower is
    /// behind the purged prefix. Transport failures are left for the next
    /// heartbeat round.
    async fn replicate_to(&self, peer: NodeId, addr: String) {
        loop {
            enum Step {
                Append(AppendEntriesRequest),
                Snapshot,
                Done,
            }

            let step = {
                let mut st = self.state.lock().await;
                if st.role != Role::Leader {
                    Step::Done
                } else {
                    let last = st.last_index();
                    let next =
                        *st.next_index.entry(peer.clone()).or_insert(last + 1);
                    if next <= st.last_purged {
                        Step::Snapshot
                    } else {
                        let prev_log_index = next - 1;
                        let prev_log_term = st.term_at(prev_log_index).unwrap_or(0);
                        let mut entries = Vec::new();
                        let mut ok = true;
                        for idx in next..=last {
                            match st.entry_at(idx).map(entry_to_wire) {
                                Some(Ok(wire)) => entries.push(wire),
                                _ => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        if !ok {
                            Step::Done
                        } else {
                            Step::Append(AppendEntriesRequest {
                                term: st.term,
                                leader_id: self.node_id.clone(),
                                leader_addr: self.addr.clone(),
                                prev_log_index,
                                prev_log_term,
                                entries,
                                leader_commit: st.commit_index,
                            })
                        }
                    }
                }
            };

            match step {
                Step::Done => return,
                Step::Snapshot => {
                    self.send_snapshot(&peer, &addr).await;
                    return;
                }
                Step::Append(req) => {
                    let resp = match self.peers.append_entries(&addr, req).await {
                        Ok(resp) => resp,
                        Err(err) => {
                            tracing::debug!(peer = %peer, %err, "append to peer failed");
                            return;
                        }
                    };
                    let mut st = self.state.lock().await;
                    if resp.term > st.term {
                        self.step_down(&mut st, resp.term).await;
                        return;
                    }
                    if resp.success {
                        st.match_index.insert(peer.clone(), resp.match_index);
                        st.next_index.insert(peer.clone(), resp.match_index + 1);
                        return;
                    }
                    // Log mismatch: back up, bounded by the follower's tail.
                    let next = st.next_index.get(&peer).copied().unwrap_or(1);
                    let backed = next.saturating_sub(1).min(resp.match_index + 1).max(1);
                    st.next_index.insert(peer.clone(), backed);
                }
            }
        }
    }

    async fn send_snapshot(&self, peer: &NodeId, addr: &str) {
        let (term, membership) = {
            let st = self.state.lock().await;
            (st.term, st.membership.clone())
        };
        // Prefer the retained snapshot; rebuild from the engine if missing.
        let blob = match self.log_store.read_snapshot().await {
            Ok(Some(b)) => b,
            Ok(None) | Err(_) => match self.build_snapshot_now().await {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(%err, "could not build snapshot for follower");
                    return;
                }
            },
        };

        let members = match bincode::serde::encode_to_vec(
            &membership,
            bincode::config::standard(),
        ) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(%err, "could not encode membership for snapshot");
                return;
            }
        };

        let mut chunks = Vec::new();
        let mut first = true;
        let data_chunks: Vec<&[u8]> = if blob.data.is_empty() {
            vec![&blob.data[..]]
        } else {
            blob.data.chunks(SNAPSHOT_CHUNK).collect()
        };
        for chunk in data_chunks {
            chunks.push(InstallSnapshotRequest {
                term,
                leader_id: self.node_id.clone(),
                leader_addr: self.addr.clone(),
                last_index: blob.meta.last_index,
                last_term: blob.meta.last_term,
                membership: if first { members.clone() } else { Vec::new() },
                chunk: chunk.to_vec(),
            });
            first = false;
        }

        match self.peers.install_snapshot(addr, chunks).await {
            Err(err) => {
                tracing::debug!(peer = %peer, %err, "snapshot transfer failed");
            }
            Ok(resp) => {
                let mut st = self.state.lock().await;
                if resp.term > st.term {
                    self.step_down(&mut st, resp.term).await;
                    return;
                }
                st.match_index.insert(peer.clone(), blob.meta.last_index);
                st.next_index.insert(peer.clone(), blob.meta.last_index + 1);
                tracing::info!(peer = %peer, last_index = blob.meta.last_index, "snapshot installed on follower");
            }
        }
    }

    async fn build_snapshot_now(&self) -> Result<SnapshotBlob, SkerryError> {
        let data = snapshot::export(self.engine.as_ref()).await?;
        let st = self.state.lock().await;
        let last_index = st.last_applied;
        let last_term = st.term_at(last_index).unwrap_or(st.last_purged_term);
        Ok(SnapshotBlob { meta: SnapshotMeta { last_index, last_term }, data })
    }

    /// Advance the commit index to the highest current-term entry replicated
    /// on a majority of voters.
    fn advance_commit(&self, st: &mut RaftState) {
        let majority = st.membership.len() / 2;
        let last = st.last_index();
        let mut n = last;
        while n > st.commit_index {
            if st.term_at(n) == Some(st.term) {
                let replicated = st
                    .membership
                    .keys()
                    .filter(|id| **id != self.node_id)
                    .filter(|id| st.match_index.get(*id).copied().unwrap_or(0) >= n)
                    .count();
                // +1 for the leader's own copy.
                if replicated + 1 > majority {
                    st.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
    }

    /// Apply every committed-but-unapplied entry to the engine, in order.
    /// The engine's verdict for each entry is recorded for its proposer.
    async fn apply_committed(&self, st: &mut RaftState) -> Result<(), SkerryError> {
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let entry = st
                .entry_at(index)
                .cloned()
                .ok_or_else(|| SkerryError::Consensus(format!("log gap at index {index}")))?;

            let outcome = match entry.payload {
                LogPayload::Blank => None,
                LogPayload::Command(Command::Set { ref key, ref value }) => {
                    self.engine.set(key.as_bytes(), value).await.err()
                }
                LogPayload::Command(Command::Delete { ref key }) => {
                    self.engine.delete(key.as_bytes()).await.err()
                }
                LogPayload::Membership(ref members) => {
                    st.membership = members.clone();
                    self.log_store.save_membership(members.clone()).await?;
                    tracing::info!(voters = st.membership.len(), "membership applied");
                    None
                }
            };

            st.last_applied = index;
            self.log_store.save_last_applied(index).await?;
            if st.role == Role::Leader {
                st.apply_results.insert(index, outcome);
            }
        }

        let floor = st.last_applied.saturating_sub(RESULT_RETENTION);
        st.apply_results.retain(|idx, _| *idx > floor);

        self.maybe_compact(st).await
    }

    /// Fold the applied log prefix into a snapshot once it outgrows the
    /// configured threshold.
    async fn maybe_compact(&self, st: &mut RaftState) -> Result<(), SkerryError> {
        if st.last_applied - st.last_purged <= self.config.snapshot_threshold {
            return Ok(());
        }
        let data = snapshot::export(self.engine.as_ref()).await?;
        let last_index = st.last_applied;
        let last_term = st
            .term_at(last_index)
            .ok_or_else(|| SkerryError::Consensus("compaction point left the log".into()))?;
        self.log_store
            .save_snapshot(SnapshotBlob { meta: SnapshotMeta { last_index, last_term }, data })
            .await?;
        self.log_store.purge(last_index).await?;
        st.log.retain(|e| e.index > last_index);
        st.last_purged = last_index;
        st.last_purged_term = last_term;
        tracing::info!(last_index, "log compacted into snapshot");
        Ok(())
    }

    async fn step_down(&self, st: &mut RaftState, term: u64) {
        st.term = term;
        st.role = Role::Follower;
        st.voted_for = None;
        st.leader = None;
        st.reset_election_deadline(&self.config);
        if let Err(err) =
            self.log_store.save_vote(Vote { term, voted_for: None }).await
        {
            tracing::error!(%err, "failed to persist stepped-down term");
        }
    }

    // -----------------------------------------------------------------------
    // Tick loop: heartbeats and elections
    // -----------------------------------------------------------------------

    async fn run(replica: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            replica.config.heartbeat_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let action = {
                let mut st = replica.state.lock().await;
                match st.role {
                    Role::Leader => TickAction::Heartbeat(st.peers(&replica.node_id)),
                    _ if Instant::now() >= st.election_deadline
                        && st.membership.contains_key(&replica.node_id) =>
                    {
                        st.role = Role::Candidate;
                        st.term += 1;
                        st.voted_for = Some(replica.node_id.clone());
                        st.leader = None;
                        st.reset_election_deadline(&replica.config);
                        let vote = Vote {
                            term: st.term,
                            voted_for: Some(replica.node_id.clone()),
                        };
                        if let Err(err) = replica.log_store.save_vote(vote).await {
                            tracing::error!(%err, "failed to persist candidacy vote");
                            TickAction::Idle
                        } else {
                            TickAction::Campaign {
                                term: st.term,
                                last_log_index: st.last_index(),
                                last_log_term: st.last_term(),
                                peers: st.peers(&replica.node_id),
                            }
                        }
                    }
                    _ => TickAction::Idle,
                }
            };

            match action {
                TickAction::Idle => {}
                TickAction::Heartbeat(peers) => {
                    futures::future::join_all(
                        peers
                            .iter()
                            .map(|(id, addr)| replica.replicate_to(id.clone(), addr.clone())),
                    )
                    .await;
                    let mut st = replica.state.lock().await;
                    if st.role == Role::Leader {
                        self_heal_commit(&replica, &mut st).await;
                    }
                }
                TickAction::Campaign { term, last_log_index, last_log_term, peers } => {
                    replica.run_election(term, last_log_index, last_log_term, peers).await;
                }
            }
        }
    }

    async fn run_election(
        &self,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        peers: Vec<(NodeId, String)>,
    ) {
        tracing::debug!(term, "starting election");
        let mut granted = 1usize; // own vote
        let mut observed_term = term;

        if !peers.is_empty() {
            let requests = peers.iter().map(|(_, addr)| {
                let req = VoteRequest {
                    term,
                    candidate_id: self.node_id.clone(),
                    last_log_index,
                    last_log_term,
                };
                self.peers.vote(addr, req)
            });
            for resp in futures::future::join_all(requests).await.into_iter().flatten() {
                if resp.granted {
                    granted += 1;
                } else {
                    observed_term = observed_term.max(resp.term);
                }
            }
        }

        let mut st = self.state.lock().await;
        if observed_term > st.term {
            self.step_down(&mut st, observed_term).await;
            return;
        }
        if st.role != Role::Candidate || st.term != term {
            return;
        }
        if granted > st.membership.len() / 2 {
            self.become_leader(&mut st).await;
        }
    }

    async fn become_leader(&self, st: &mut RaftState) {
        st.role = Role::Leader;
        st.leader = Some((self.node_id.clone(), self.addr.clone()));
        let last = st.last_index();
        for (peer, _) in st.peers(&self.node_id) {
            st.next_index.insert(peer.clone(), last + 1);
            st.match_index.insert(peer, 0);
        }
        // A blank entry commits the new term without waiting for traffic.
        let entry = LogEntry { index: last + 1, term: st.term, payload: LogPayload::Blank };
        if let Err(err) = self.log_store.append(vec![entry.clone()]).await {
            tracing::error!(%err, "failed to append leadership entry");
            return;
        }
        st.log.push(entry);
        tracing::info!(term = st.term, "became leader");
        self.advance_commit(st);
        if let Err(err) = self.apply_committed(st).await {
            tracing::error!(%err, "failed to apply after leadership change");
        }
    }

    // -----------------------------------------------------------------------
    // Peer-facing handlers (called from the gRPC service)
    // -----------------------------------------------------------------------

    pub async fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse, SkerryError> {
        let mut st = self.state.lock().await;
        if req.term < st.term {
            return Ok(VoteResponse { term: st.term, granted: false });
        }
        if req.term > st.term {
            st.term = req.term;
            st.voted_for = None;
            st.role = Role::Follower;
            self.log_store.save_vote(Vote { term: st.term, voted_for: None }).await?;
        }

        let up_to_date = req.last_log_term > st.last_term()
            || (req.last_log_term == st.last_term() && req.last_log_index >= st.last_index());
        let unspent = st.voted_for.is_none()
            || st.voted_for.as_deref() == Some(req.candidate_id.as_str());

        if up_to_date && unspent {
            st.voted_for = Some(req.candidate_id.clone());
            // The grant must be durable before it is visible to the candidate.
            self.log_store
                .save_vote(Vote { term: st.term, voted_for: st.voted_for.clone() })
                .await?;
            st.reset_election_deadline(&self.config);
            Ok(VoteResponse { term: st.term, granted: true })
        } else {
            Ok(VoteResponse { term: st.term, granted: false })
        }
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, SkerryError> {
        let mut st = self.state.lock().await;
        if req.term < st.term {
            return Ok(AppendEntriesResponse {
                term: st.term,
                success: false,
                match_index: 0,
            });
        }
        if req.term > st.term {
            st.term = req.term;
            st.voted_for = None;
            self.log_store.save_vote(Vote { term: st.term, voted_for: None }).await?;
        }
        st.role = Role::Follower;
        st.leader = Some((req.leader_id.clone(), req.leader_addr.clone()));
        st.reset_election_deadline(&self.config);

        if req.prev_log_index > 0 && st.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            return Ok(AppendEntriesResponse {
                term: st.term,
                success: false,
                match_index: st.last_index().min(req.prev_log_index.saturating_sub(1)),
            });
        }

        let mut to_append = Vec::new();
        for wire in &req.entries {
            let entry = wire_to_entry(wire)?;
            match st.term_at(entry.index) {
                Some(term) if term == entry.term => {} // already present
                Some(_) => {
                    // Conflict: drop our divergent suffix, keep the leader's.
                    self.log_store.truncate(entry.index).await?;
                    st.log.retain(|e| e.index < entry.index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if !to_append.is_empty() {
            self.log_store.append(to_append.clone()).await?;
            st.log.extend(to_append);
        }

        if req.leader_commit > st.commit_index {
            st.commit_index = req.leader_commit.min(st.last_index());
            self.apply_committed(&mut st).await?;
        }

        Ok(AppendEntriesResponse {
            term: st.term,
            success: true,
            match_index: st.last_index(),
        })
    }

    pub async fn handle_install_snapshot(
        &self,
        term: u64,
        leader_id: String,
        leader_addr: String,
        meta: SnapshotMeta,
        membership: Option<BTreeMap<NodeId, String>>,
        data: Vec<u8>,
    ) -> Result<u64, SkerryError> {
        let mut st = self.state.lock().await;
        if term < st.term {
            return Ok(st.term);
        }
        if term > st.term {
            st.term = term;
            st.voted_for = None;
            self.log_store.save_vote(Vote { term, voted_for: None }).await?;
        }
        st.role = Role::Follower;
        st.leader = Some((leader_id, leader_addr));
        st.reset_election_deadline(&self.config);

        snapshot::import(self.engine.as_ref(), &data).await?;
        if let Some(members) = membership {
            st.membership = members.clone();
            self.log_store.save_membership(members).await?;
        }

        self.log_store.truncate(1).await?;
        self.log_store.purge(meta.last_index).await?;
        self.log_store
            .save_snapshot(SnapshotBlob { meta, data })
            .await?;
        st.log.clear();
        st.last_purged = meta.last_index;
        st.last_purged_term = meta.last_term;
        st.commit_index = meta.last_index;
        st.last_applied = meta.last_index;
        self.log_store.save_last_applied(meta.last_index).await?;

        tracing::info!(last_index = meta.last_index, "snapshot installed");
        Ok(st.term)
    }
}

/// Leader post-heartbeat: some follower acks may have advanced the quorum
/// without a client proposal in flight.
async fn self_heal_commit<E: Engine, L: LogStore>(
    replica: &RaftReplica<E, L>,
    st: &mut RaftState,
) {
    replica.advance_commit(st);
    if let Err(err) = replica.apply_committed(st).await {
        tracing::error!(%err, "failed to apply after heartbeat round");
    }
}
