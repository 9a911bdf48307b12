use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::{DistributedJob, JobTable, JOB_TIMED_OUT};
use crate::worker::JobProcessor;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub timed_out: Vec<Uuid>,
    pub purged: Vec<Uuid>,
}

/// Reaps jobs stuck in processing and forgets old finished ones.
///
/// Only this node's job table is swept. Stale work on a crashed peer stays
/// in the store as that peer last wrote it.
#[derive(Debug)]
pub struct JobJanitor {
    interval: Duration,
    stale_threshold: chrono::Duration,
    retention: chrono::Duration,
    jobs: Arc<RwLock<JobTable>>,
    processor: JobProcessor,
}

impl JobJanitor {
    pub fn new(
        interval: Duration,
        stale_threshold: chrono::Duration,
        retention: chrono::Duration,
        jobs: Arc<RwLock<JobTable>>,
        processor: JobProcessor,
    ) -> Self {
        Self {
            interval,
            stale_threshold,
            retention,
            jobs,
            processor,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // the first tick completes immediately; nothing can be stale yet
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!("Janitor loop stopped");
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> JanitorReport {
        let reaped: Vec<DistributedJob> = {
            let mut jobs = self.jobs.write().await;
            let stale = jobs.stale_job_ids(now, self.stale_threshold);
            stale
                .into_iter()
                .filter_map(|id| {
                    let job = jobs.get_mut(&id)?;
                    job.force_fail(JOB_TIMED_OUT, now).ok()?;
                    Some(job.clone())
                })
                .collect()
        };

        for job in &reaped {
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, "Job timed out");
            self.processor.abort(&job.id).await;
            self.processor.publish(job).await;
        }

        let purged = self.jobs.write().await.purge_expired(now, self.retention);
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Purged expired jobs");
        }

        JanitorReport {
            timed_out: reaped.iter().map(|j| j.id).collect(),
            purged,
        }
    }
}
