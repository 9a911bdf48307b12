use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::scheduler::LoadBalancingStrategy;

/// Job types the platform ships handlers for.
pub const DEFAULT_JOB_TYPES: [&str; 4] = [
    "exam_submission",
    "result_calculation",
    "ranking_update",
    "analytics_refresh",
];

/// What a node is able and willing to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    /// Upper bound on jobs processing at once. Must be at least 1.
    pub max_concurrent_jobs: usize,
    /// Job types this node has handlers for.
    pub supported_job_types: BTreeSet<String>,
    /// Weighting factor for placement; higher wins.
    pub priority: i32,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            supported_job_types: DEFAULT_JOB_TYPES.iter().map(|t| t.to_string()).collect(),
            priority: 1,
        }
    }
}

impl NodeCapabilities {
    pub fn supports(&self, job_type: &str) -> bool {
        self.supported_job_types.contains(job_type)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: NodeCapabilities,
    pub strategy: LoadBalancingStrategy,
    /// Retry budget for submissions that don't set one.
    pub default_max_retries: u32,
    pub heartbeat_interval_ms: u64,
    /// A peer whose last heartbeat is older than this is inactive.
    pub node_ttl_ms: u64,
    pub leader_election_interval_ms: u64,
    /// Lifetime of the leader lease; renewed every election tick.
    pub leader_lease_ttl_ms: u64,
    pub janitor_interval_ms: u64,
    pub stale_job_threshold_ms: u64,
    pub job_retention_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            capabilities: NodeCapabilities::default(),
            strategy: LoadBalancingStrategy::default(),
            default_max_retries: 3,
            heartbeat_interval_ms: 30_000,
            node_ttl_ms: 90_000,
            leader_election_interval_ms: 10_000,
            leader_lease_ttl_ms: 30_000,
            janitor_interval_ms: 60_000,
            stale_job_threshold_ms: 5 * 60 * 1000,
            job_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Identity for nodes started without an explicit id.
pub fn generate_node_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.capabilities.max_concurrent_jobs = max;
        self
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.supported_job_types = job_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.capabilities.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_millis(self.node_ttl_ms)
    }

    pub fn leader_election_interval(&self) -> Duration {
        Duration::from_millis(self.leader_election_interval_ms)
    }

    pub fn leader_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_lease_ttl_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    pub fn stale_job_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_job_threshold_ms as i64)
    }

    pub fn job_retention(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.job_retention_ms as i64)
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(MeshError::InvalidConfig("node id must not be empty".into()));
        }
        if self.capabilities.max_concurrent_jobs == 0 {
            return Err(MeshError::InvalidConfig(
                "max concurrent jobs must be at least 1".into(),
            ));
        }
        let intervals = [
            ("heartbeat interval", self.heartbeat_interval_ms),
            ("leader election interval", self.leader_election_interval_ms),
            ("janitor interval", self.janitor_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(MeshError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.node_ttl_ms <= self.heartbeat_interval_ms {
            return Err(MeshError::InvalidConfig(
                "node ttl must exceed the heartbeat interval".into(),
            ));
        }
        if self.leader_lease_ttl_ms <= self.leader_election_interval_ms {
            return Err(MeshError::InvalidConfig(
                "leader lease ttl must exceed the election interval".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert!(cfg.node_id.starts_with("node-"));
        assert_eq!(cfg.node_id.len(), "node-".len() + 8);
        assert_eq!(cfg.capabilities.max_concurrent_jobs, 5);
        assert_eq!(cfg.capabilities.supported_job_types.len(), 4);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.leader_election_interval_ms, 10_000);
        assert_eq!(cfg.janitor_interval_ms, 60_000);
        assert_eq!(cfg.stale_job_threshold(), chrono::Duration::minutes(5));
        assert_eq!(cfg.job_retention(), chrono::Duration::hours(24));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_node_id(), generate_node_id());
    }

    #[test]
    fn builders_set_capabilities() {
        let cfg = NodeConfig::new("worker-7")
            .with_address("10.0.0.7", 9000)
            .with_max_concurrent_jobs(2)
            .with_job_types(["ranking_update"])
            .with_priority(9)
            .with_strategy(LoadBalancingStrategy::RoundRobin);

        assert_eq!(cfg.node_id, "worker-7");
        assert_eq!(cfg.host, "10.0.0.7");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.capabilities.max_concurrent_jobs, 2);
        assert!(cfg.capabilities.supports("ranking_update"));
        assert!(!cfg.capabilities.supports("exam_submission"));
        assert_eq!(cfg.capabilities.priority, 9);
        assert_eq!(cfg.strategy, LoadBalancingStrategy::RoundRobin);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let cfg = NodeConfig::new("n").with_max_concurrent_jobs(0);
        assert!(matches!(cfg.validate(), Err(MeshError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_ttl_shorter_than_interval() {
        let mut cfg = NodeConfig::new("n");
        cfg.node_ttl_ms = cfg.heartbeat_interval_ms;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::new("n");
        cfg.leader_lease_ttl_ms = 5_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_id() {
        assert!(NodeConfig::new("  ").validate().is_err());
    }
}
