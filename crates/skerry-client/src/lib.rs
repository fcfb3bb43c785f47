pub mod http;
pub mod lamport;
pub mod sharded;

pub use http::ClusterClient;
pub use lamport::LamportClient;
pub use sharded::ShardedClient;

pub use reqwest::Method;
