/// Timing and compaction knobs for a consensus replica.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Applied-entry count above which the log is compacted into a snapshot.
    pub snapshot_threshold: u64,
    /// Deadline for a proposed command to replicate and apply.
    pub apply_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            snapshot_threshold: 8192,
            apply_timeout_ms: 5000,
        }
    }
}
