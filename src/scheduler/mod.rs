//! Job model, placement and dispatch.
//!
//! - [`job`]: [`DistributedJob`] and its state machine
//! - [`queue`]: [`JobTable`], the node-local job map
//! - [`balancer`]: [`LoadBalancer`] placement strategies
//! - [`dispatcher`]: [`Dispatcher`] submission, claiming and leader rebalancing

pub mod balancer;
pub mod dispatcher;
pub mod job;
pub mod queue;

pub use balancer::{LoadBalancer, LoadBalancingStrategy};
pub use dispatcher::Dispatcher;
pub use job::{DistributedJob, JobEvent, JobOptions, JobPriority, JobStatus, JOB_TIMED_OUT};
pub use queue::JobTable;
