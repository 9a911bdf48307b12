//! Cluster membership and coordination.
//!
//! - [`registry`]: node descriptors and the heartbeat wire record
//! - [`leader`]: the leader lease and leader-only duties
//! - [`health`]: the read-side cluster summary

pub mod health;
pub mod leader;
pub mod registry;

pub use health::{ClusterHealth, NodeLoad};
pub use leader::{LeaderDuties, LeaderElector};
pub use registry::{HeartbeatRecord, NodeDescriptor, NodeRegistry, NodeStatus};
