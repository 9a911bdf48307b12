use uuid::Uuid;

use crate::scheduler::JobPriority;

/// Key namespace shared by every node.
#[derive(Debug, Clone, Copy)]
pub struct StoreKeys;

impl StoreKeys {
    pub fn leader() -> String {
        "cluster:leader".to_string()
    }

    /// Ids of every node that has ever heartbeated and not been reaped.
    pub fn members() -> String {
        "cluster:nodes".to_string()
    }

    pub fn heartbeat(node_id: &str) -> String {
        format!("cluster:heartbeat:{node_id}")
    }

    pub fn job(job_id: &Uuid) -> String {
        format!("cluster:job:{job_id}")
    }

    pub fn queue(priority: JobPriority) -> String {
        format!("cluster:queue:{priority}")
    }

    /// Jobs the leader routed to `node_id`.
    pub fn inbox(node_id: &str) -> String {
        format!("cluster:inbox:{node_id}")
    }

    pub fn new_job_notification() -> String {
        "cluster:notify:new_job".to_string()
    }
}
