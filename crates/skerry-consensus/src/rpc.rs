//! Peer-to-peer plumbing: cached lazy channels to other replicas and the
//! conversions between storage log entries and their wire form.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use skerry_proto::v1::raft_service_client::RaftServiceClient;
use skerry_proto::v1::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use skerry_storage::{LogEntry, LogPayload};
use skerry_types::SkerryError;

pub fn entry_to_wire(entry: &LogEntry) -> Result<skerry_proto::v1::WireLogEntry, SkerryError> {
    let payload = bincode::serde::encode_to_vec(&entry.payload, bincode::config::standard())
        .map_err(|e| SkerryError::Consensus(e.to_string()))?;
    Ok(skerry_proto::v1::WireLogEntry { index: entry.index, term: entry.term, payload })
}

pub fn wire_to_entry(wire: &skerry_proto::v1::WireLogEntry) -> Result<LogEntry, SkerryError> {
    let (payload, _): (LogPayload, _) =
        bincode::serde::decode_from_slice(&wire.payload, bincode::config::standard())
            .map_err(|e| SkerryError::Consensus(e.to_string()))?;
    Ok(LogEntry { index: wire.index, term: wire.term, payload })
}

/// Lazily connected clients to peer replicas, keyed by consensus address.
pub struct PeerPool {
    clients: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
    rpc_timeout: Duration,
}

impl PeerPool {
    pub fn new(rpc_timeout: Duration) -> Self {
        PeerPool { clients: Mutex::new(HashMap::new()), rpc_timeout }
    }

    async fn client(&self, addr: &str) -> Result<RaftServiceClient<Channel>, SkerryError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| SkerryError::Transport(e.to_string()))?
            .timeout(self.rpc_timeout)
            .connect_timeout(Duration::from_secs(2));
        let client = RaftServiceClient::new(endpoint.connect_lazy());
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    pub async fn vote(
        &self,
        addr: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse, SkerryError> {
        let mut client = self.client(addr).await?;
        client
            .vote(req)
            .await
            .map(|r| r.into_inner())
            .map_err(|e| SkerryError::Transport(e.to_string()))
    }

    pub async fn append_entries(
        &self,
        addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, SkerryError> {
        let mut client = self.client(addr).await?;
        client
            .append_entries(req)
            .await
            .map(|r| r.into_inner())
            .map_err(|e| SkerryError::Transport(e.to_string()))
    }

    pub async fn install_snapshot(
        &self,
        addr: &str,
        chunks: Vec<InstallSnapshotRequest>,
    ) -> Result<InstallSnapshotResponse, SkerryError> {
        let mut client = self.client(addr).await?;
        client
            .install_snapshot(tokio_stream::iter(chunks))
            .await
            .map(|r| r.into_inner())
            .map_err(|e| SkerryError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skerry_types::Command;

    #[test]
    fn entry_round_trips_through_wire_form() {
        let entry = LogEntry {
            index: 4,
            term: 2,
            payload: LogPayload::Command(Command::Set {
                key: "k".into(),
                value: b"v".to_vec(),
            }),
        };
        let wire = entry_to_wire(&entry).unwrap();
        assert_eq!(wire.index, 4);
        assert_eq!(wire.term, 2);
        assert_eq!(wire_to_entry(&wire).unwrap(), entry);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let wire = skerry_proto::v1::WireLogEntry {
            index: 1,
            term: 1,
            payload: vec![0xFF; 3],
        };
        assert!(wire_to_entry(&wire).is_err());
    }
}
