use std::collections::BTreeMap;
use std::future::Future;

use skerry_types::{NodeId, SkerryError};

use crate::types::{LogEntry, LogState, SnapshotBlob, Vote};

/// Durable key-value engine a node persists into.
///
/// Methods use RPITIT (`-> impl Future + Send`); the explicit `+ Send` bound
/// lets generic callers `.await` across thread boundaries. Writes must be
/// synced to disk before the future resolves; `scan` observes a
/// point-in-time consistent view.
pub trait Engine: Send + Sync + 'static {
    /// Read a key. `Err(SkerryError::NotFound)` when absent.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Vec<u8>, SkerryError>> + Send;

    /// Write a key, overwriting any existing value.
    fn set(&self, key: &[u8], value: &[u8])
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    /// Remove a key. `Err(SkerryError::NotFound)` when absent.
    fn delete(&self, key: &[u8]) -> impl Future<Output = Result<(), SkerryError>> + Send;

    /// Full ordered scan of the data keyspace.
    fn scan(&self)
        -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>, SkerryError>> + Send;

    /// Drop every data key. Used when a snapshot is installed over this
    /// engine's logical state.
    fn clear(&self) -> impl Future<Output = Result<(), SkerryError>> + Send;
}

/// Persistent consensus state for one replica: the command log plus the
/// stable store (vote, membership, retained snapshot).
pub trait LogStore: Send + Sync + 'static {
    fn log_state(&self) -> impl Future<Output = Result<LogState, SkerryError>> + Send;

    /// Entries in the inclusive range `[from, to_inclusive]`.
    fn entries(&self, from: u64, to_inclusive: u64)
        -> impl Future<Output = Result<Vec<LogEntry>, SkerryError>> + Send;

    /// Append entries, overwriting any existing entry at the same index
    /// (a corrective append from the leader).
    fn append(&self, entries: Vec<LogEntry>)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    /// Delete all entries with `index >= from_index` (conflict resolution).
    fn truncate(&self, from_index: u64)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    /// Delete all entries with `index <= up_to_index` after a snapshot;
    /// records `last_purged_index`.
    fn purge(&self, up_to_index: u64)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    /// Durably persist the vote before it is granted.
    fn save_vote(&self, vote: Vote) -> impl Future<Output = Result<(), SkerryError>> + Send;

    fn read_vote(&self) -> impl Future<Output = Result<Option<Vote>, SkerryError>> + Send;

    /// Persist the effective voter set (applied membership entries).
    fn save_membership(&self, members: BTreeMap<NodeId, String>)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    fn read_membership(
        &self,
    ) -> impl Future<Output = Result<Option<BTreeMap<NodeId, String>>, SkerryError>> + Send;

    fn save_snapshot(&self, snapshot: SnapshotBlob)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    fn read_snapshot(
        &self,
    ) -> impl Future<Output = Result<Option<SnapshotBlob>, SkerryError>> + Send;

    /// Record the index of the last entry applied to the engine, so a
    /// restarted replica does not re-apply the whole log.
    fn save_last_applied(&self, index: u64)
        -> impl Future<Output = Result<(), SkerryError>> + Send;

    fn read_last_applied(
        &self,
    ) -> impl Future<Output = Result<Option<u64>, SkerryError>> + Send;
}
