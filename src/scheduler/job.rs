use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Error recorded on jobs the janitor reaps.
pub const JOB_TIMED_OUT: &str = "Job timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Order in which priority queues are drained.
    pub const DESCENDING: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            other => Err(MeshError::InvalidConfig(format!(
                "unknown job priority {other:?}"
            ))),
        }
    }
}

/// Optional knobs accepted by `submit_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub priority: Option<JobPriority>,
    pub routing_key: Option<String>,
    pub max_retries: Option<u32>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One unit of asynchronous work and its execution history.
///
/// State only changes through the transition methods below, which reject any
/// edge outside `queued -> assigned -> processing -> {completed | failed}` plus
/// the retry edge `processing -> queued`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedJob {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: Value,
    pub priority: JobPriority,
    pub routing_key: Option<String>,
    pub assigned_node_id: Option<String>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl DistributedJob {
    pub fn new(
        job_type: impl Into<String>,
        data: Value,
        priority: JobPriority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            data,
            priority,
            routing_key: None,
            assigned_node_id: None,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_routing_key(mut self, routing_key: Option<String>) -> Self {
        self.routing_key = routing_key;
        self
    }

    /// Bind a queued job to the node that committed to run it.
    pub fn assign(&mut self, node_id: &str) -> Result<()> {
        self.expect_status(JobStatus::Queued, JobStatus::Assigned)?;
        self.assigned_node_id = Some(node_id.to_string());
        self.status = JobStatus::Assigned;
        Ok(())
    }

    /// Enter `processing`. `started_at` keeps its first value across retries.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(JobStatus::Assigned, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Apply the retry policy to a handler failure.
    ///
    /// Returns the resulting status: `Queued` when a retry is left, `Failed`
    /// once `retry_count == max_retries`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        if self.status != JobStatus::Processing {
            return Err(self.transition_error(JobStatus::Failed));
        }
        self.error = Some(error.into());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.assigned_node_id = None;
            self.status = JobStatus::Queued;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
        Ok(self.status)
    }

    /// Terminate a processing job without consulting the retry budget.
    pub fn force_fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(JobStatus::Processing, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == JobStatus::Processing
            && self.started_at.is_some_and(|started| now - started > threshold)
    }

    /// Finished longer ago than `retention`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.status.is_terminal()
            && self.completed_at.is_some_and(|completed| now - completed > retention)
    }

    /// Wall time from first start to completion, for completed jobs only.
    pub fn duration(&self) -> Option<Duration> {
        match (self.status, self.started_at, self.completed_at) {
            (JobStatus::Completed, Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    fn expect_status(&self, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: JobStatus) -> MeshError {
        MeshError::InvalidTransition {
            job_id: self.id,
            from: self.status,
            to,
        }
    }
}

/// A state change observed on this node, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub retry_count: u32,
    pub node_id: String,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: &DistributedJob, node_id: &str) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            retry_count: job.retry_count,
            node_id: node_id.to_string(),
            at: Utc::now(),
        }
    }
}
