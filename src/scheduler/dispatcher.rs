use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::cluster::registry::{NodeDescriptor, NodeStatus};
use crate::config::NodeCapabilities;
use crate::error::{MeshError, Result};
use crate::scheduler::balancer::LoadBalancer;
use crate::scheduler::job::{DistributedJob, JobEvent, JobOptions, JobPriority, JobStatus};
use crate::scheduler::queue::JobTable;
use crate::store::{read_json, update_list, write_json, CoordinationStore, StoreKeys};
use crate::worker::JobProcessor;

/// Value written under the new-job notification key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobNotice {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: JobPriority,
    pub queued_at: DateTime<Utc>,
}

/// Put a queued job on its shared priority queue and announce it.
///
/// The job record itself is written by the caller.
pub async fn queue_for_peers(store: &dyn CoordinationStore, job: &DistributedJob) -> Result<()> {
    update_list(store, &StoreKeys::queue(job.priority), |queued: &mut Vec<Uuid>| {
        if !queued.contains(&job.id) {
            queued.push(job.id);
        }
    })
    .await?;

    let notice = NewJobNotice {
        job_id: job.id,
        job_type: job.job_type.clone(),
        priority: job.priority,
        queued_at: Utc::now(),
    };
    write_json(store, &StoreKeys::new_job_notification(), &notice, None).await
}

/// Outcome of one pass over the shared priority queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Started on this node.
    pub claimed: usize,
    /// Appended to a peer's inbox.
    pub routed: usize,
    /// Left queued: no eligible node, or the chosen one was full.
    pub pending: usize,
    /// Queue entries whose record was gone or no longer queued.
    pub dropped: usize,
}

/// Decides where jobs run.
///
/// Submissions run locally when this node can take them right away and are
/// otherwise parked on the shared priority queues. The leader later drains
/// those queues with [`Dispatcher::rebalance`], and every node picks up what
/// was routed to it with [`Dispatcher::drain_inbox`].
#[derive(Debug)]
pub struct Dispatcher {
    node_id: String,
    capabilities: NodeCapabilities,
    default_max_retries: u32,
    store: Arc<dyn CoordinationStore>,
    jobs: Arc<RwLock<JobTable>>,
    processor: JobProcessor,
    balancer: LoadBalancer,
    events: broadcast::Sender<JobEvent>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        capabilities: NodeCapabilities,
        default_max_retries: u32,
        store: Arc<dyn CoordinationStore>,
        jobs: Arc<RwLock<JobTable>>,
        processor: JobProcessor,
        balancer: LoadBalancer,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities,
            default_max_retries,
            store,
            jobs,
            processor,
            balancer,
            events,
        }
    }

    /// Create a queued job and place it. Returns as soon as it is placed.
    ///
    /// Only fails when the job has to be queued for peers and the store
    /// write fails.
    pub async fn submit(&self, job_type: &str, data: Value, options: JobOptions) -> Result<Uuid> {
        let job = DistributedJob::new(
            job_type,
            data,
            options.priority.unwrap_or_default(),
            options.max_retries.unwrap_or(self.default_max_retries),
        )
        .with_routing_key(options.routing_key);
        let job_id = job.id;

        tracing::info!(job_id = %job_id, job_type, priority = %job.priority, "Job submitted");
        let _ = self.events.send(JobEvent::new(&job, &self.node_id));

        if self.capabilities.supports(job_type) {
            if let Some(permit) = self.processor.try_reserve() {
                self.processor.persist(&job).await;
                self.processor.start(job, permit).await?;
                return Ok(job_id);
            }
        }

        write_json(self.store.as_ref(), &StoreKeys::job(&job_id), &job, None).await?;
        queue_for_peers(self.store.as_ref(), &job).await?;
        tracing::info!(job_id = %job_id, priority = %job.priority, "Job queued for peers");
        Ok(job_id)
    }

    /// Local copy first, then the store.
    pub async fn get_job(&self, job_id: &Uuid) -> Result<Option<DistributedJob>> {
        if let Some(job) = self.jobs.read().await.get(job_id) {
            return Ok(Some(job.clone()));
        }
        read_json(self.store.as_ref(), &StoreKeys::job(job_id)).await
    }

    /// Jobs this node holds locally, oldest first.
    pub async fn local_jobs(&self) -> Vec<DistributedJob> {
        self.jobs.read().await.all_jobs().into_iter().cloned().collect()
    }

    /// Start a queued job here if this node runs its type and has a free slot.
    ///
    /// `Ok(false)` means no slot was free.
    pub async fn claim(&self, job_id: &Uuid) -> Result<bool> {
        let local = self.jobs.read().await.get(job_id).cloned();
        let job = match local {
            Some(job) => job,
            None => read_json(self.store.as_ref(), &StoreKeys::job(job_id))
                .await?
                .ok_or(MeshError::JobNotFound(*job_id))?,
        };
        self.claim_job(job).await
    }

    async fn claim_job(&self, job: DistributedJob) -> Result<bool> {
        if job.status != JobStatus::Queued {
            return Err(MeshError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to: JobStatus::Assigned,
            });
        }
        if !self.capabilities.supports(&job.job_type) {
            return Err(MeshError::UnsupportedJobType(job.job_type));
        }
        let Some(permit) = self.processor.try_reserve() else {
            return Ok(false);
        };
        let job_id = job.id;
        self.processor.start(job, permit).await?;
        tracing::info!(job_id = %job_id, node_id = %self.node_id, "Claimed job");
        Ok(true)
    }

    /// Claim jobs the leader routed to this node.
    ///
    /// Entries blocked only by capacity stay in the inbox for the next tick.
    /// Entries that can never run here are dropped. Entries the leader
    /// appends while the drain is running are left for the next tick.
    pub async fn drain_inbox(&self) -> Result<usize> {
        let key = StoreKeys::inbox(&self.node_id);
        let Some(inbox) = read_json::<Vec<Uuid>>(self.store.as_ref(), &key).await? else {
            return Ok(0);
        };

        let mut handled = HashSet::new();
        let mut claimed = 0;
        for job_id in &inbox {
            match self.claim(job_id).await {
                Ok(true) => {
                    claimed += 1;
                    handled.insert(*job_id);
                }
                Ok(false) => {}
                Err(e) if e.is_store_failure() => {}
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Dropping inbox entry");
                    handled.insert(*job_id);
                }
            }
        }

        remove_from_list(self.store.as_ref(), &key, &handled).await?;
        Ok(claimed)
    }

    /// Move a departed node's inbox back onto the priority queues.
    pub async fn requeue_inbox(&self, node_id: &str) -> Result<usize> {
        let key = StoreKeys::inbox(node_id);
        let Some(inbox) = read_json::<Vec<Uuid>>(self.store.as_ref(), &key).await? else {
            return Ok(0);
        };

        let mut requeued = 0;
        for job_id in &inbox {
            let job: Option<DistributedJob> =
                read_json(self.store.as_ref(), &StoreKeys::job(job_id)).await?;
            if let Some(job) = job.filter(|j| j.status == JobStatus::Queued) {
                queue_for_peers(self.store.as_ref(), &job).await?;
                requeued += 1;
            }
        }

        let handled: HashSet<Uuid> = inbox.into_iter().collect();
        remove_from_list(self.store.as_ref(), &key, &handled).await?;
        Ok(requeued)
    }

    /// Drain the shared queues from critical to low, routing each job with the
    /// configured strategy. Leader only.
    ///
    /// `nodes` is the registry snapshot to place against. Placements made
    /// during the pass count toward each node's load.
    pub async fn rebalance(&self, mut nodes: Vec<NodeDescriptor>) -> Result<RebalanceReport> {
        let mut report = RebalanceReport::default();

        for priority in JobPriority::DESCENDING {
            let key = StoreKeys::queue(priority);
            let queued: Vec<Uuid> = read_json(self.store.as_ref(), &key)
                .await?
                .unwrap_or_default();
            if queued.is_empty() {
                continue;
            }

            let mut remaining = HashSet::new();
            let mut routed: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
            for job_id in &queued {
                let record: Option<DistributedJob> =
                    read_json(self.store.as_ref(), &StoreKeys::job(job_id)).await?;
                let Some(job) = record.filter(|j| j.status == JobStatus::Queued) else {
                    report.dropped += 1;
                    continue;
                };

                let target = {
                    let candidates: Vec<&NodeDescriptor> = nodes.iter().collect();
                    self.balancer
                        .select(&candidates, &job.job_type, job.routing_key.as_deref())
                        .map(|n| n.node_id.clone())
                };
                let Some(target) = target else {
                    remaining.insert(*job_id);
                    continue;
                };

                if target == self.node_id {
                    match self.claim_job(job).await {
                        Ok(true) => report.claimed += 1,
                        Ok(false) => {
                            remaining.insert(*job_id);
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!(job_id = %job_id, error = %e, "Dropping queue entry");
                            report.dropped += 1;
                            continue;
                        }
                    }
                } else {
                    routed.entry(target.clone()).or_default().push(*job_id);
                }
                record_placement(&mut nodes, &target);
            }

            for (target, ids) in routed {
                match self.append_to_inbox(&target, &ids).await {
                    Ok(()) => {
                        tracing::debug!(node_id = %target, jobs = ids.len(), "Routed jobs to peer");
                        report.routed += ids.len();
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %target, error = %e, "Failed to route jobs to peer");
                        remaining.extend(ids);
                    }
                }
            }

            // Only entries this pass dealt with come off; ids queued since the
            // read stay put.
            let handled: HashSet<Uuid> = queued
                .into_iter()
                .filter(|id| !remaining.contains(id))
                .collect();
            remove_from_list(self.store.as_ref(), &key, &handled).await?;
            report.pending += remaining.len();
        }

        Ok(report)
    }

    async fn append_to_inbox(&self, node_id: &str, job_ids: &[Uuid]) -> Result<()> {
        let key = StoreKeys::inbox(node_id);
        update_list(self.store.as_ref(), &key, |inbox: &mut Vec<Uuid>| {
            for id in job_ids {
                if !inbox.contains(id) {
                    inbox.push(*id);
                }
            }
        })
        .await?;
        Ok(())
    }
}

async fn remove_from_list(
    store: &dyn CoordinationStore,
    key: &str,
    ids: &HashSet<Uuid>,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    update_list(store, key, |list: &mut Vec<Uuid>| list.retain(|id| !ids.contains(id))).await?;
    Ok(())
}

fn record_placement(nodes: &mut [NodeDescriptor], node_id: &str) {
    if let Some(node) = nodes.iter_mut().find(|n| n.node_id == node_id) {
        node.current_load += 1;
        if node.current_load >= node.capabilities.max_concurrent_jobs {
            node.status = NodeStatus::Overloaded;
        }
    }
}
