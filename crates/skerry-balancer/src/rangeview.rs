use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use skerry_proto::v1::partition_service_client::PartitionServiceClient;
use skerry_types::SkerryError;

pub type PartitionClient = PartitionServiceClient<Channel>;

/// Lazily connected client to a partition replica.
pub fn partition_client(addr: &str) -> Result<PartitionClient, SkerryError> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|e| SkerryError::Transport(e.to_string()))?
        .timeout(Duration::from_secs(6))
        .connect_timeout(Duration::from_secs(2));
    Ok(PartitionServiceClient::new(endpoint.connect_lazy()))
}

/// The replicas responsible for one hash range, plus the range's Lamport
/// clock. The coordinator bumps the clock on successful commits and on read
/// issuance.
pub struct RangeView {
    clients: Vec<PartitionClient>,
    addresses: Vec<String>,
    pub lamport: u64,
}

impl RangeView {
    pub fn new() -> Self {
        RangeView { clients: Vec::new(), addresses: Vec::new(), lamport: 0 }
    }

    pub fn add_partition_data(&mut self, client: PartitionClient, addr: String) {
        self.clients.push(client);
        self.addresses.push(addr);
    }

    /// Remove a replica by address.
    pub fn remove_partition(&mut self, addr: &str) -> Result<(), SkerryError> {
        match self.addresses.iter().position(|a| a == addr) {
            Some(at) => {
                self.clients.remove(at);
                self.addresses.remove(at);
                Ok(())
            }
            None => Err(SkerryError::NoSuchPartition(addr.to_string())),
        }
    }

    /// Snapshot of the current member clients with their addresses.
    pub fn members(&self) -> Vec<(PartitionClient, String)> {
        self.clients
            .iter()
            .cloned()
            .zip(self.addresses.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for RangeView {
    fn default() -> Self {
        Self::new()
    }
}
