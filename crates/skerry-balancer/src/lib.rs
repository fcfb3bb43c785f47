pub mod balancer;
pub mod coverage;
pub mod keys;
pub mod rangeview;
pub mod service;
mod twopc;

pub use balancer::{Balancer, GetOutcome};
pub use coverage::{Coverage, Tick};
pub use rangeview::{partition_client, RangeView};
pub use service::{balancer_service, BalancerServiceImpl};
