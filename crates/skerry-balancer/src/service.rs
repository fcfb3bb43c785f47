use std::sync::Arc;

use tonic::{Request, Response, Status};

use skerry_proto::v1::balancer_service_server::{BalancerService, BalancerServiceServer};
use skerry_proto::v1::{
    DeleteRequest, DeleteResponse, GetIdRequest, GetIdResponse, GetRequest, GetResponse,
    RegisterPartitionRequest, RegisterPartitionResponse, SetRequest, SetResponse,
};
use skerry_storage::Engine;
use skerry_types::SkerryError;

use crate::balancer::Balancer;

pub struct BalancerServiceImpl<E: Engine> {
    balancer: Arc<Balancer<E>>,
}

/// Wrap a coordinator into the servable gRPC service.
pub fn balancer_service<E: Engine>(
    balancer: Arc<Balancer<E>>,
) -> BalancerServiceServer<BalancerServiceImpl<E>> {
    BalancerServiceServer::new(BalancerServiceImpl { balancer })
}

fn to_status(err: SkerryError) -> Status {
    match &err {
        SkerryError::NotFound => Status::not_found(err.to_string()),
        SkerryError::StaleTimestamp { .. } | SkerryError::TimestampNotNext { .. } => {
            Status::failed_precondition(err.to_string())
        }
        SkerryError::DigestNotCovered
        | SkerryError::RangeNotYetCovered
        | SkerryError::AllReplicasFailed => Status::unavailable(err.to_string()),
        SkerryError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        SkerryError::PrepareAborted | SkerryError::CommitAborted(_) => {
            Status::aborted(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}

impl<E: Engine> BalancerServiceImpl<E> {
    /// Post-CRUD hook: timestamp rejections log at warn, real failures at
    /// error, and the client clock advances no matter what happened.
    async fn post_crud(&self, client_id: u64, err: Option<&SkerryError>) {
        match err {
            None => {}
            Some(err) if err.is_timestamp_warning() => {
                tracing::warn!(client_id, %err, "request rejected by client clock");
            }
            Some(err) => {
                tracing::error!(client_id, %err, "request failed");
            }
        }
        self.balancer.increment_client(client_id).await;
    }
}

#[tonic::async_trait]
impl<E: Engine> BalancerService for BalancerServiceImpl<E> {
    async fn get_id(
        &self,
        _request: Request<GetIdRequest>,
    ) -> Result<Response<GetIdResponse>, Status> {
        let id = self.balancer.next_client_id().await;
        tracing::info!(client_id = id, "registered client");
        Ok(Response::new(GetIdResponse { id }))
    }

    async fn register_partition(
        &self,
        request: Request<RegisterPartitionRequest>,
    ) -> Result<Response<RegisterPartitionResponse>, Status> {
        let req = request.into_inner();
        if req.address.is_empty() {
            return Err(Status::invalid_argument("address must not be empty"));
        }
        self.balancer.register_partition(&req.address).await.map_err(to_status)?;
        Ok(Response::new(RegisterPartitionResponse {}))
    }

    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }

        let result = match self.balancer.validate_client(req.client_id, req.lamport).await {
            Ok(()) => self.balancer.get(&req.key).await,
            Err(err) => Err(err),
        };
        self.post_crud(req.client_id, result.as_ref().err()).await;

        let outcome = result.map_err(to_status)?;
        for addr in &outcome.offline {
            tracing::warn!(%addr, "partition went offline during read");
        }
        Ok(Response::new(GetResponse { stored_value: outcome.stored }))
    }

    async fn set(
        &self,
        request: Request<SetRequest>,
    ) -> Result<Response<SetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }

        let result = match self.balancer.validate_client(req.client_id, req.lamport).await {
            Ok(()) => self.balancer.set(&req.key, &req.value).await,
            Err(err) => Err(err),
        };
        self.post_crud(req.client_id, result.as_ref().err()).await;

        result.map_err(to_status)?;
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

        let result = match self.balancer.validate_client(req.client_id, req.lamport).await {
            Ok(()) => self.balancer.delete(&req.key).await,
            Err(err) => Err(err),
        };
        self.post_crud(req.client_id, result.as_ref().err()).await;

        result.map_err(to_status)?;
        Ok(Response::new(DeleteResponse {}))
    }
}
