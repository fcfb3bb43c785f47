use std::collections::BTreeMap;

use skerry_types::{Command, NodeId};

/// A single entry in the consensus log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: LogPayload,
}

/// The payload carried by a [`LogEntry`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LogPayload {
    /// No-op entry appended by a fresh leader to commit its term.
    Blank,
    /// A key-value command to apply to the engine.
    Command(Command),
    /// The new effective voter set (node id → consensus address).
    Membership(BTreeMap<NodeId, String>),
}

/// Persisted vote, written before it is granted in an election.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Vote {
    pub term: u64,
    /// `None` means the node has not voted in this term.
    pub voted_for: Option<NodeId>,
}

/// Summary of the current log extent.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if empty).
    pub first_index: Option<u64>,
    /// Largest index currently in the log (`None` if empty).
    pub last_index: Option<u64>,
    /// Largest index compacted into a snapshot.
    pub last_purged_index: Option<u64>,
}

/// Identity of a snapshot: the log position it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
}

/// A full engine snapshot: newline-JSON key-value stream plus its position.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotBlob {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}
