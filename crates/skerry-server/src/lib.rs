pub mod http;
pub mod state;

pub use http::{router, serve_cluster, serve_http, LEADER_HEADER};
pub use state::{AppState, ShardReplica, ShardState};
