pub mod partition;
pub mod service;

pub use partition::{Partition, QueuedMsg};
pub use service::{partition_service, PartitionServiceImpl};
