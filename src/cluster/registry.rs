use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{NodeCapabilities, NodeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    /// Alive but every job slot is taken.
    Overloaded,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Inactive => write!(f, "inactive"),
            NodeStatus::Overloaded => write!(f, "overloaded"),
        }
    }
}

/// Identity and capability record for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: NodeCapabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub status: NodeStatus,
    /// Active jobs as last reported.
    pub current_load: usize,
    pub is_leader: bool,
}

impl NodeDescriptor {
    pub fn new(
        node_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        capabilities: NodeCapabilities,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            capabilities,
            last_heartbeat: Utc::now(),
            status: NodeStatus::Active,
            current_load: 0,
            is_leader: false,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.node_id.clone(),
            config.host.clone(),
            config.port,
            config.capabilities.clone(),
        )
    }

    pub fn is_alive(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_heartbeat < ttl
    }

    /// Active jobs over capacity, in `[0, 1]` unless over-reported.
    pub fn load_ratio(&self) -> f64 {
        self.current_load as f64 / self.capabilities.max_concurrent_jobs.max(1) as f64
    }
}

/// Liveness record each node writes under its heartbeat key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: NodeCapabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub status: NodeStatus,
    pub is_leader: bool,
    pub active_job_count: usize,
}

impl From<&NodeDescriptor> for HeartbeatRecord {
    fn from(node: &NodeDescriptor) -> Self {
        Self {
            node_id: node.node_id.clone(),
            host: node.host.clone(),
            port: node.port,
            capabilities: node.capabilities.clone(),
            last_heartbeat: node.last_heartbeat,
            status: node.status,
            is_leader: node.is_leader,
            active_job_count: node.current_load,
        }
    }
}

impl From<HeartbeatRecord> for NodeDescriptor {
    fn from(record: HeartbeatRecord) -> Self {
        Self {
            node_id: record.node_id,
            host: record.host,
            port: record.port,
            capabilities: record.capabilities,
            last_heartbeat: record.last_heartbeat,
            status: record.status,
            current_load: record.active_job_count,
            is_leader: record.is_leader,
        }
    }
}

/// This node's descriptor plus the last-known state of its peers.
///
/// Node listings are ordered by id so placement ties resolve the same way on
/// every node.
#[derive(Debug)]
pub struct NodeRegistry {
    local: NodeDescriptor,
    peers: BTreeMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new(local: NodeDescriptor) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local.node_id
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    /// Stamp the local descriptor for a heartbeat tick.
    pub fn refresh_local(&mut self, now: DateTime<Utc>, active_jobs: usize, is_leader: bool) {
        self.local.last_heartbeat = now;
        self.local.current_load = active_jobs;
        self.local.is_leader = is_leader;
        self.local.status = if active_jobs >= self.local.capabilities.max_concurrent_jobs {
            NodeStatus::Overloaded
        } else {
            NodeStatus::Active
        };
    }

    pub fn set_local_status(&mut self, status: NodeStatus) {
        self.local.status = status;
    }

    pub fn set_local_leader(&mut self, is_leader: bool) {
        self.local.is_leader = is_leader;
    }

    /// Update the local load, keeping overload status in step.
    pub fn set_local_load(&mut self, active_jobs: usize) {
        if self.local.status != NodeStatus::Inactive {
            let now = self.local.last_heartbeat;
            let is_leader = self.local.is_leader;
            self.refresh_local(now, active_jobs, is_leader);
        } else {
            self.local.current_load = active_jobs;
        }
    }

    /// Record a peer's heartbeat. Records about this node are ignored.
    pub fn apply_heartbeat(&mut self, record: HeartbeatRecord) {
        if record.node_id == self.local.node_id {
            return;
        }
        let node = NodeDescriptor::from(record);
        if !self.peers.contains_key(&node.node_id) {
            tracing::info!(node_id = %node.node_id, "Discovered peer node");
        }
        self.peers.insert(node.node_id.clone(), node);
    }

    /// Mark a peer inactive. Returns true if it was not already inactive.
    pub fn mark_inactive(&mut self, node_id: &str) -> bool {
        match self.peers.get_mut(node_id) {
            Some(node) if node.status != NodeStatus::Inactive => {
                node.status = NodeStatus::Inactive;
                node.is_leader = false;
                true
            }
            _ => false,
        }
    }

    /// Mark peers whose heartbeat is older than `ttl` inactive.
    /// Returns the ids that changed.
    pub fn mark_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|n| n.status != NodeStatus::Inactive && !n.is_alive(now, ttl))
            .map(|n| n.node_id.clone())
            .collect();
        for id in &stale {
            self.mark_inactive(id);
        }
        stale
    }

    /// Forget a peer. The local node cannot be removed.
    pub fn remove(&mut self, node_id: &str) -> Option<NodeDescriptor> {
        self.peers.remove(node_id)
    }

    /// Keep only the peers `keep` accepts. Returns the ids that were dropped.
    pub fn retain_peers(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.peers.retain(|id, _| {
            let kept = keep(id);
            if !kept {
                dropped.push(id.clone());
            }
            kept
        });
        dropped
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeDescriptor> {
        if node_id == self.local.node_id {
            Some(&self.local)
        } else {
            self.peers.get(node_id)
        }
    }

    /// Every known node, ordered by id.
    pub fn nodes(&self) -> Vec<&NodeDescriptor> {
        let mut nodes: Vec<&NodeDescriptor> = self.peers.values().collect();
        let at = nodes.partition_point(|n| n.node_id < self.local.node_id);
        nodes.insert(at, &self.local);
        nodes
    }

    /// Owned copy of [`nodes`](Self::nodes).
    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        self.nodes().into_iter().cloned().collect()
    }

    /// Active peers (not this node), ordered by id.
    pub fn active_peers(&self) -> Vec<&NodeDescriptor> {
        self.peers
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.peers.len() + 1
    }

    /// Nodes that are up, whether or not they have free capacity.
    pub fn active_nodes(&self) -> usize {
        self.nodes()
            .into_iter()
            .filter(|n| n.status != NodeStatus::Inactive)
            .count()
    }
}
