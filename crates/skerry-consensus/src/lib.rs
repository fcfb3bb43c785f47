pub mod config;
pub mod replica;
pub mod rpc;
pub mod service;

pub use config::RaftConfig;
pub use replica::{RaftReplica, ReplicaStatus};
pub use service::raft_service;
