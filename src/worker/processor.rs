use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::dispatcher::queue_for_peers;
use crate::scheduler::{DistributedJob, JobEvent, JobStatus, JobTable};
use crate::store::{write_json, CoordinationStore, StoreKeys};
use crate::worker::handler::HandlerRegistry;

/// Runs jobs on this node.
///
/// A job only runs while it holds one of `max_concurrent_jobs` semaphore
/// permits. Each running job gets its own task, which owns every transition
/// of that job until it reaches a terminal state or leaves the node.
#[derive(Clone)]
pub struct JobProcessor {
    node_id: String,
    max_concurrent_jobs: usize,
    store: Arc<dyn CoordinationStore>,
    jobs: Arc<RwLock<JobTable>>,
    handlers: HandlerRegistry,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    running: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
    /// Expiry of finished job records in the store.
    record_ttl: Duration,
}

impl JobProcessor {
    pub fn new(
        node_id: impl Into<String>,
        max_concurrent_jobs: usize,
        store: Arc<dyn CoordinationStore>,
        jobs: Arc<RwLock<JobTable>>,
        handlers: HandlerRegistry,
        events: broadcast::Sender<JobEvent>,
        record_ttl: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            max_concurrent_jobs,
            store,
            jobs,
            handlers,
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            record_ttl,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Jobs currently holding a slot.
    pub fn active_jobs(&self) -> usize {
        self.max_concurrent_jobs.saturating_sub(self.slots.available_permits())
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Take a job slot without waiting.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Assign a queued job to this node, start it and run it in the background.
    ///
    /// Assignment and start happen under one table lock, so no reader ever
    /// sees the job in `assigned`.
    pub async fn start(&self, mut job: DistributedJob, permit: OwnedSemaphorePermit) -> Result<()> {
        let job_id = job.id;
        {
            let mut jobs = self.jobs.write().await;
            job.assign(&self.node_id)?;
            job.start(Utc::now())?;
            jobs.upsert(job.clone());
        }
        self.publish(&job).await;
        self.spawn(job_id, permit).await;
        Ok(())
    }

    /// Abort the handler task running `job_id`. Its slot is released.
    pub async fn abort(&self, job_id: &Uuid) -> bool {
        match self.running.lock().await.remove(job_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Emit the job's current state locally and write it to the store.
    ///
    /// A failed store write is logged; the local table stays authoritative.
    pub async fn publish(&self, job: &DistributedJob) {
        let _ = self.events.send(JobEvent::new(job, &self.node_id));
        self.persist(job).await;
    }

    pub async fn persist(&self, job: &DistributedJob) {
        let ttl = job.status.is_terminal().then_some(self.record_ttl);
        if let Err(e) = write_json(self.store.as_ref(), &StoreKeys::job(&job.id), job, ttl).await {
            tracing::warn!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist job");
        }
    }

    async fn spawn(&self, job_id: Uuid, permit: OwnedSemaphorePermit) {
        // Hold the map lock across spawn so the task's own removal comes after insertion.
        let mut running = self.running.lock().await;
        let processor = self.clone();
        let handle = tokio::spawn(async move {
            processor.run(job_id, permit).await;
            processor.running.lock().await.remove(&job_id);
        });
        running.insert(job_id, handle.abort_handle());
    }

    async fn run(&self, job_id: Uuid, mut permit: OwnedSemaphorePermit) {
        loop {
            let job = match self.jobs.read().await.get(&job_id) {
                Some(job) if job.status == JobStatus::Processing => job.clone(),
                _ => return,
            };

            tracing::info!(
                job_id = %job_id,
                job_type = %job.job_type,
                attempt = job.retry_count + 1,
                "Processing job"
            );
            let outcome = match self.handlers.get(&job.job_type) {
                Some(handler) => handler.handle(&job).await,
                None => Err(anyhow::anyhow!(
                    "no handler registered for job type {:?}",
                    job.job_type
                )),
            };

            let updated = {
                let mut jobs = self.jobs.write().await;
                let Some(job) = jobs.get_mut(&job_id) else {
                    return;
                };
                if job.status != JobStatus::Processing {
                    tracing::debug!(job_id = %job_id, status = %job.status, "Discarding late job result");
                    return;
                }
                let now = Utc::now();
                let applied = match outcome {
                    Ok(result) => job.complete(result, now),
                    Err(e) => job.record_failure(format!("{e:#}"), now).map(|_| ()),
                };
                if let Err(e) = applied {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                    return;
                }
                job.clone()
            };

            match updated.status {
                JobStatus::Completed => {
                    tracing::info!(job_id = %job_id, "Job completed");
                }
                JobStatus::Failed => {
                    tracing::warn!(
                        job_id = %job_id,
                        retries = updated.retry_count,
                        error = updated.error.as_deref().unwrap_or_default(),
                        "Job failed"
                    );
                }
                _ => {
                    tracing::info!(
                        job_id = %job_id,
                        retry = updated.retry_count,
                        max_retries = updated.max_retries,
                        error = updated.error.as_deref().unwrap_or_default(),
                        "Job failed, retrying"
                    );
                }
            }
            self.publish(&updated).await;

            if updated.status != JobStatus::Queued {
                return;
            }

            // Re-enter dispatch: give the slot back and compete for one like a fresh submission.
            drop(permit);
            match self.try_reserve() {
                Some(next) => {
                    permit = next;
                    if !self.restart(&job_id).await {
                        return;
                    }
                }
                None => {
                    self.jobs.write().await.remove(&job_id);
                    if let Err(e) = queue_for_peers(self.store.as_ref(), &updated).await {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to queue retry for peers");
                    }
                    return;
                }
            }
        }
    }

    /// Move a requeued job straight back to processing on this node.
    async fn restart(&self, job_id: &Uuid) -> bool {
        let job = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if let Err(e) = job.assign(&self.node_id).and_then(|_| job.start(Utc::now())) {
                tracing::warn!(job_id = %job_id, error = %e, "Could not restart job");
                return false;
            }
            job.clone()
        };
        self.publish(&job).await;
        true
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("node_id", &self.node_id)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("active_jobs", &self.active_jobs())
            .finish()
    }
}
