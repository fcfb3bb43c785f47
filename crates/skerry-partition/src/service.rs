use std::sync::Arc;

use tonic::{Request, Response, Status};

use skerry_proto::v1::partition_service_server::{PartitionService, PartitionServiceServer};
use skerry_proto::v1::{
    prepare_commit_request, AbortCommitRequest, AbortCommitResponse, CommitRequest,
    CommitResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    PrepareCommitRequest, PrepareCommitResponse, SetHashrangeRequest, SetHashrangeResponse,
    SetRequest, SetResponse,
};
use skerry_storage::Engine;
use skerry_types::{Range, SkerryError};

use crate::partition::{Partition, QueuedMsg};

pub struct PartitionServiceImpl<E: Engine> {
    partition: Arc<Partition<E>>,
}

/// Wrap a partition into the servable gRPC service.
pub fn partition_service<E: Engine>(
    partition: Arc<Partition<E>>,
) -> PartitionServiceServer<PartitionServiceImpl<E>> {
    PartitionServiceServer::new(PartitionServiceImpl { partition })
}

fn to_status(err: SkerryError) -> Status {
    match &err {
        SkerryError::NotFound => Status::not_found(err.to_string()),
        SkerryError::StaleTimestamp { .. }
        | SkerryError::TimestampNotNext { .. }
        | SkerryError::NoLockedMessage => Status::failed_precondition(err.to_string()),
        SkerryError::NotThisPartitionKey
        | SkerryError::InvalidKeySize
        | SkerryError::UnsupportedPrepareMsg
        | SkerryError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        SkerryError::Timeout => Status::deadline_exceeded(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn digest_from(bytes: &[u8], what: &str) -> Result<[u8; 32], Status> {
    bytes
        .try_into()
        .map_err(|_| Status::invalid_argument(format!("{what} must be 32 bytes")))
}

#[tonic::async_trait]
impl<E: Engine> PartitionService for PartitionServiceImpl<E> {
    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let stored_value =
            self.partition.handle_get(req).await.map_err(to_status)?;
        Ok(Response::new(GetResponse { stored_value }))
    }

    async fn set(
        &self,
        request: Request<SetRequest>,
    ) -> Result<Response<SetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        self.partition.handle_set(req).await.map_err(to_status)?;
        Ok(Response::new(SetResponse {}))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        self.partition.handle_delete(req).await.map_err(to_status)?;
        Ok(Response::new(DeleteResponse {}))
    }

    async fn set_hashrange(
        &self,
        request: Request<SetHashrangeRequest>,
    ) -> Result<Response<SetHashrangeResponse>, Status> {
        let req = request.into_inner();
        let min = digest_from(&req.min, "min")?;
        let max = digest_from(&req.max, "max")?;
        if min >= max {
            return Err(Status::invalid_argument("min must be strictly below max"));
        }
        self.partition.set_hashrange(Range::new(min, max)).await;
        tracing::info!("hashrange assigned");
        Ok(Response::new(SetHashrangeResponse {}))
    }

    async fn prepare_commit(
        &self,
        request: Request<PrepareCommitRequest>,
    ) -> Result<Response<PrepareCommitResponse>, Status> {
        let msg = match request.into_inner().message {
            Some(prepare_commit_request::Message::Set(set)) => QueuedMsg::Set(set),
            Some(prepare_commit_request::Message::Delete(delete)) => {
                QueuedMsg::Delete(delete)
            }
            None => return Err(Status::invalid_argument("unsupported prepare payload")),
        };
        self.partition.prepare(msg).await.map_err(to_status)?;
        tracing::debug!("prepared two-phase commit message");
        Ok(Response::new(PrepareCommitResponse { ok: true }))
    }

    async fn commit(
        &self,
        request: Request<CommitRequest>,
    ) -> Result<Response<CommitResponse>, Status> {
        let _ = request.into_inner();
        self.partition.commit().await.map_err(to_status)?;
        tracing::debug!("committed two-phase commit message");
        Ok(Response::new(CommitResponse {}))
    }

    async fn abort_commit(
        &self,
        request: Request<AbortCommitRequest>,
    ) -> Result<Response<AbortCommitResponse>, Status> {
        let _ = request.into_inner();
        self.partition.abort().await.map_err(to_status)?;
        tracing::debug!("aborted two-phase commit message");
        Ok(Response::new(AbortCommitResponse {}))
    }
}
