//! Client for the 2PC coordinator: registers for a client id and stamps
//! every request with its own monotonically increasing Lamport timestamp.

use tonic::transport::Channel;

use skerry_proto::v1::balancer_service_client::BalancerServiceClient;
use skerry_proto::v1::{DeleteRequest, GetIdRequest, GetRequest, SetRequest};
use skerry_types::SkerryError;

pub struct LamportClient {
    client: BalancerServiceClient<Channel>,
    id: u64,
    /// Timestamp of the last request this client issued.
    timestamp: u64,
}

impl LamportClient {
    /// Connect to the coordinator and register; the coordinator seeds this
    /// client's clock at zero.
    pub async fn connect(addr: &str) -> Result<Self, SkerryError> {
        let mut client = BalancerServiceClient::connect(format!("http://{addr}"))
            .await
            .map_err(|e| SkerryError::Transport(e.to_string()))?;
        let id = client
            .get_id(GetIdRequest {})
            .await
            .map_err(|e| SkerryError::Transport(e.to_string()))?
            .into_inner()
            .id;
        Ok(LamportClient { client, id, timestamp: 0 })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), SkerryError> {
        self.timestamp += 1;
        let req = SetRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            lamport: self.timestamp,
            client_id: self.id,
        };
        self.client.set(req).await.map_err(from_status)?;
        Ok(())
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, SkerryError> {
        self.timestamp += 1;
        let req = GetRequest {
            key: key.to_vec(),
            lamport: self.timestamp,
            client_id: self.id,
        };
        let resp = self.client.get(req).await.map_err(from_status)?;
        Ok(resp.into_inner().stored_value.map(|sv| sv.value))
    }

    pub async fn delete(&mut self, key: &[u8]) -> Result<(), SkerryError> {
        self.timestamp += 1;
        let req = DeleteRequest {
            key: key.to_vec(),
            lamport: self.timestamp,
            client_id: self.id,
        };
        self.client.delete(req).await.map_err(from_status)?;
        Ok(())
    }
}

fn from_status(status: tonic::Status) -> SkerryError {
    match status.code() {
        tonic::Code::NotFound => SkerryError::NotFound,
        tonic::Code::Unavailable => SkerryError::Transport(status.message().to_string()),
        tonic::Code::DeadlineExceeded => SkerryError::Timeout,
        tonic::Code::InvalidArgument => {
            SkerryError::InvalidArgument(status.message().to_string())
        }
        _ => SkerryError::Internal(status.message().to_string()),
    }
}
