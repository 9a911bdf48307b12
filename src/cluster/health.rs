use serde::{Deserialize, Serialize};

use crate::cluster::registry::{NodeRegistry, NodeStatus};
use crate::scheduler::{JobStatus, JobTable};

/// Per-node entry of the load distribution view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLoad {
    pub node_id: String,
    pub status: NodeStatus,
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub load_ratio: f64,
}

/// Point-in-time summary of the cluster as this node sees it.
///
/// Node figures come from the registry, except this node's load, which is
/// the live count passed to [`ClusterHealth::collect`]. Job figures come from
/// the local job table only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    pub total_nodes: usize,
    /// Nodes not marked inactive. Overloaded nodes count as up.
    pub active_nodes: usize,
    pub leader_id: Option<String>,
    pub is_leader: bool,
    pub total_jobs: usize,
    pub queued_jobs: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub average_duration_ms: Option<i64>,
    pub load_distribution: Vec<NodeLoad>,
}

impl ClusterHealth {
    pub fn collect(
        registry: &NodeRegistry,
        jobs: &JobTable,
        leader_id: Option<String>,
        local_active_jobs: usize,
    ) -> Self {
        let local_id = registry.local_id();
        let load_distribution = registry
            .nodes()
            .into_iter()
            .map(|node| {
                let max_concurrent_jobs = node.capabilities.max_concurrent_jobs;
                let active_jobs = if node.node_id == local_id {
                    local_active_jobs
                } else {
                    node.current_load
                };
                NodeLoad {
                    node_id: node.node_id.clone(),
                    status: node.status,
                    active_jobs,
                    max_concurrent_jobs,
                    load_ratio: active_jobs as f64 / max_concurrent_jobs.max(1) as f64,
                }
            })
            .collect();

        Self {
            total_nodes: registry.total_nodes(),
            active_nodes: registry.active_nodes(),
            leader_id,
            is_leader: registry.local().is_leader,
            total_jobs: jobs.len(),
            queued_jobs: jobs.count_with_status(JobStatus::Queued),
            processing_jobs: jobs.count_with_status(JobStatus::Processing),
            completed_jobs: jobs.count_with_status(JobStatus::Completed),
            failed_jobs: jobs.count_with_status(JobStatus::Failed),
            average_duration_ms: jobs.average_duration().map(|d| d.num_milliseconds()),
            load_distribution,
        }
    }
}
