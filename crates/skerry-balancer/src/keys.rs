/// Reserved coordinator engine keys. User data never reaches the
/// coordinator's own engine, so these cannot collide.
pub const PREPARE_COMMIT_DECISION_KEY: &[u8] = b"PrepareCommitDecisionKey";
pub const COVERAGE_KEY: &[u8] = b"CoverageKey";

pub const DECISION_COMMIT: &[u8] = b"commit";
pub const DECISION_ABORT: &[u8] = b"abort";
