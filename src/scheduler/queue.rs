use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::scheduler::job::{DistributedJob, JobStatus};

/// Authoritative in-memory copy of the jobs this node knows about.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<Uuid, DistributedJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job record.
    pub fn upsert(&mut self, job: DistributedJob) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &Uuid) -> Option<&DistributedJob> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut DistributedJob> {
        self.jobs.get_mut(id)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<DistributedJob> {
        self.jobs.remove(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.jobs.contains_key(id)
    }

    /// All jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&DistributedJob> {
        let mut jobs: Vec<&DistributedJob> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    /// Ids of processing jobs started more than `threshold` before `now`.
    pub fn stale_job_ids(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.is_stale(now, threshold))
            .map(|j| j.id)
            .collect()
    }

    /// Drop finished jobs older than `retention`. Returns the removed ids.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.is_expired(now, retention))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired
    }

    /// Mean duration over completed jobs, if any.
    pub fn average_duration(&self) -> Option<Duration> {
        let durations: Vec<Duration> = self.jobs.values().filter_map(|j| j.duration()).collect();
        if durations.is_empty() {
            return None;
        }
        let total: Duration = durations.iter().copied().sum();
        Some(total / durations.len() as i32)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
