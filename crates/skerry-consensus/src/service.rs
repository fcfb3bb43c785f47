use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::{Request, Response, Status, Streaming};

use skerry_proto::v1::raft_service_server::{RaftService, RaftServiceServer};
use skerry_proto::v1::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use skerry_storage::{Engine, LogStore, SnapshotMeta};
use skerry_types::{NodeId, SkerryError};

use crate::replica::RaftReplica;

pub struct RaftServiceImpl<E: Engine, L: LogStore> {
    replica: Arc<RaftReplica<E, L>>,
}

/// Wrap a replica into the servable gRPC service.
pub fn raft_service<E: Engine, L: LogStore>(
    replica: Arc<RaftReplica<E, L>>,
) -> RaftServiceServer<RaftServiceImpl<E, L>> {
    RaftServiceServer::new(RaftServiceImpl { replica })
}

fn to_status(err: SkerryError) -> Status {
    Status::internal(err.to_string())
}

#[tonic::async_trait]
impl<E: Engine, L: LogStore> RaftService for RaftServiceImpl<E, L> {
    async fn vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        self.replica
            .handle_vote(request.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        self.replica
            .handle_append_entries(request.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }

    async fn install_snapshot(
        &self,
        request: Request<Streaming<skerry_proto::v1::InstallSnapshotRequest>>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let mut stream = request.into_inner();

        let mut term = 0;
        let mut leader_id = String::new();
        let mut leader_addr = String::new();
        let mut meta = SnapshotMeta { last_index: 0, last_term: 0 };
        let mut membership: Option<BTreeMap<NodeId, String>> = None;
        let mut data = Vec::new();
        let mut first = true;

        while let Some(chunk) = stream.message().await? {
            if first {
                term = chunk.term;
                leader_id = chunk.leader_id.clone();
                leader_addr = chunk.leader_addr.clone();
                meta = SnapshotMeta {
                    last_index: chunk.last_index,
                    last_term: chunk.last_term,
                };
                if !chunk.membership.is_empty() {
                    let (members, _) = bincode::serde::decode_from_slice(
                        &chunk.membership,
                        bincode::config::standard(),
                    )
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                    membership = Some(members);
                }
                first = false;
            }
            data.extend_from_slice(&chunk.chunk);
        }
        if first {
            return Err(Status::invalid_argument("empty snapshot stream"));
        }

        let term = self
            .replica
            .handle_install_snapshot(term, leader_id, leader_addr, meta, membership, data)
            .await
            .map_err(to_status)?;
        Ok(Response::new(InstallSnapshotResponse { term }))
    }
}
