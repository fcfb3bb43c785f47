pub mod backlog;
pub mod hashrange;

pub use backlog::Backlog;
pub use hashrange::{Range, RangeKey, DOMAIN_MAX, DOMAIN_MIN};

use sha2::{Digest as _, Sha256};

pub type NodeId = String;
pub type ShardId = String;

/// SHA-256 digest of a key; the routing domain is `[0, 2^256 - 1]` and every
/// digest is compared as a big-endian 256-bit integer.
pub type KeyDigest = [u8; 32];

/// Digest a raw key into the routing domain.
pub fn digest_key(key: &[u8]) -> KeyDigest {
    let checksum = Sha256::digest(key);
    checksum.into()
}

/// Commands replicated through the consensus log and applied to the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } => key,
            Command::Delete { key } => key,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SkerryError {
    #[error("key not found")]
    NotFound,
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("operation timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),

    // Lamport discipline
    #[error("timestamp is stale, current: {current}, received: {received}")]
    StaleTimestamp { current: u64, received: u64 },
    #[error("timestamp is not the next one, current: {current}, received: {received}")]
    TimestampNotNext { current: u64, received: u64 },

    // Range routing
    #[error("a key provided is not in this partition's range")]
    NotThisPartitionKey,
    #[error("key size should be 32 bytes")]
    InvalidKeySize,
    #[error("digest is not covered by any range")]
    DigestNotCovered,
    #[error("range is not yet covered by any partition")]
    RangeNotYetCovered,
    #[error("no partition registered at address {0}")]
    NoSuchPartition(String),

    // Two-phase commit
    #[error("prepare commit aborted")]
    PrepareAborted,
    #[error("commit aborted: {0}")]
    CommitAborted(String),
    #[error("no locked message")]
    NoLockedMessage,
    #[error("unsupported prepare payload")]
    UnsupportedPrepareMsg,
    #[error("decision {decision:?} not saved to disk: {reason}")]
    DecisionNotSaved { decision: String, reason: String },
    #[error("decision was not cleared from disk after two-phase commit: {0}")]
    DecisionNotCleared(String),
    #[error("all replicas failed to process request")]
    AllReplicasFailed,
    #[error("partitions offline: {addresses:?}")]
    PartitionsOffline { addresses: Vec<String> },
}

impl SkerryError {
    /// Timestamp-discipline rejections are expected protocol traffic, not
    /// faults; callers log them at warn instead of error.
    pub fn is_timestamp_warning(&self) -> bool {
        matches!(
            self,
            SkerryError::StaleTimestamp { .. } | SkerryError::TimestampNotNext { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_32_bytes_and_deterministic() {
        let a = digest_key(b"alpha");
        let b = digest_key(b"alpha");
        let c = digest_key(b"beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn command_key_accessor() {
        let set = Command::Set { key: "k".into(), value: b"v".to_vec() };
        let del = Command::Delete { key: "d".into() };
        assert_eq!(set.key(), "k");
        assert_eq!(del.key(), "d");
    }
}
