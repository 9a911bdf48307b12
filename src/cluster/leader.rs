use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::registry::{NodeRegistry, NodeStatus};
use crate::error::Result;
use crate::scheduler::dispatcher::RebalanceReport;
use crate::scheduler::Dispatcher;
use crate::store::{read_json, update_list, CoordinationStore, StoreKeys};
use crate::worker::JobProcessor;

/// Work only the leader does: reap departed nodes and route queued jobs.
///
/// Every step is idempotent, so two nodes that both believe they lead only
/// duplicate effort.
pub struct LeaderDuties {
    interval: Duration,
    node_ttl: chrono::Duration,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<RwLock<NodeRegistry>>,
    dispatcher: Arc<Dispatcher>,
    processor: JobProcessor,
    last_notice: Mutex<Option<String>>,
}

impl LeaderDuties {
    pub fn new(
        interval: Duration,
        node_ttl: chrono::Duration,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<RwLock<NodeRegistry>>,
        dispatcher: Arc<Dispatcher>,
        processor: JobProcessor,
    ) -> Self {
        Self {
            interval,
            node_ttl,
            store,
            registry,
            dispatcher,
            processor,
            last_notice: Mutex::new(None),
        }
    }

    async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "Leader duties failed");
                    }
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!("Leader duties stopped");
    }

    /// One monitoring pass.
    pub async fn run_once(&self) -> Result<RebalanceReport> {
        self.reap_departed_nodes().await?;

        let notice = self.store.get(&StoreKeys::new_job_notification()).await?;
        {
            let mut last = self.last_notice.lock().await;
            if notice.is_some() && *last != notice {
                tracing::debug!("New jobs announced since last pass");
                *last = notice;
            }
        }

        let nodes = {
            let mut registry = self.registry.write().await;
            registry.set_local_load(self.processor.active_jobs());
            registry.snapshot()
        };
        let report = self.dispatcher.rebalance(nodes).await?;
        if report != RebalanceReport::default() {
            tracing::info!(
                claimed = report.claimed,
                routed = report.routed,
                pending = report.pending,
                dropped = report.dropped,
                "Rebalanced job queues"
            );
        }
        Ok(report)
    }

    /// Put the jobs routed to inactive peers back on the queues, then forget
    /// those peers.
    ///
    /// A peer stays on the membership list until its inbox has been requeued,
    /// so a pass that fails part way is picked up again by the next one.
    async fn reap_departed_nodes(&self) -> Result<()> {
        let inactive: Vec<String> = {
            let mut registry = self.registry.write().await;
            for node_id in registry.mark_stale(Utc::now(), self.node_ttl) {
                tracing::warn!(node_id = %node_id, "Node missed its heartbeat deadline");
            }
            let local_id = registry.local_id().to_string();
            registry
                .nodes()
                .into_iter()
                .filter(|n| n.status == NodeStatus::Inactive && n.node_id != local_id)
                .map(|n| n.node_id.clone())
                .collect()
        };
        if inactive.is_empty() {
            return Ok(());
        }

        let members: Vec<String> = read_json(self.store.as_ref(), &StoreKeys::members())
            .await?
            .unwrap_or_default();

        let mut first_error = None;
        for node_id in &inactive {
            if !members.contains(node_id) {
                // Already reaped, possibly by another node that thought it led
                self.registry.write().await.remove(node_id);
                continue;
            }
            match self.reap_node(node_id).await {
                Ok(requeued) => {
                    tracing::info!(node_id = %node_id, requeued, "Removed departed node");
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to remove departed node");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reap_node(&self, node_id: &str) -> Result<usize> {
        let requeued = self.dispatcher.requeue_inbox(node_id).await?;
        update_list(self.store.as_ref(), &StoreKeys::members(), |members: &mut Vec<String>| {
            members.retain(|id| id != node_id)
        })
        .await?;
        self.registry.write().await.remove(node_id);
        Ok(requeued)
    }
}

/// Best-effort leader lease on the `cluster:leader` key.
///
/// Acquisition and renewal go through compare-and-swap with a TTL, so a
/// crashed leader's lease lapses on its own. There is no fencing.
pub struct LeaderElector {
    node_id: String,
    interval: Duration,
    lease_ttl: Duration,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<RwLock<NodeRegistry>>,
    leadership: watch::Sender<bool>,
    current_leader: RwLock<Option<String>>,
    duties: Arc<LeaderDuties>,
    duty_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LeaderElector {
    pub fn new(
        node_id: impl Into<String>,
        interval: Duration,
        lease_ttl: Duration,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<RwLock<NodeRegistry>>,
        duties: Arc<LeaderDuties>,
    ) -> Self {
        let (leadership, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            interval,
            lease_ttl,
            store,
            registry,
            leadership,
            current_leader: RwLock::new(None),
            duties,
            duty_task: Mutex::new(None),
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    /// Holder of the lease as of the last election tick.
    pub async fn current_leader(&self) -> Option<String> {
        self.current_leader.read().await.clone()
    }

    pub fn duties(&self) -> &LeaderDuties {
        &self.duties
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!("Leader election loop stopped");
    }

    /// One election round. A store failure keeps the previous state.
    pub async fn tick(&self) -> bool {
        match self.try_acquire().await {
            Ok(acquired) => self.set_leader(acquired).await,
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "Leader election round failed");
            }
        }
        self.is_leader()
    }

    /// Take the lease when free, renew it when held, otherwise defer.
    async fn try_acquire(&self) -> Result<bool> {
        let key = StoreKeys::leader();
        let holder = self.store.get(&key).await?;

        let acquired = match holder.as_deref() {
            None => {
                self.store
                    .compare_and_swap(&key, None, Some(self.node_id.as_str()), Some(self.lease_ttl))
                    .await?
            }
            Some(id) if id == self.node_id => {
                self.store
                    .compare_and_swap(
                        &key,
                        Some(self.node_id.as_str()),
                        Some(self.node_id.as_str()),
                        Some(self.lease_ttl),
                    )
                    .await?
            }
            Some(_) => false,
        };

        let leader = if acquired {
            Some(self.node_id.clone())
        } else {
            // lost a race: whoever won holds the key now
            match holder {
                Some(holder) if holder != self.node_id => Some(holder),
                _ => self.store.get(&key).await?,
            }
        };
        *self.current_leader.write().await = leader;
        Ok(acquired)
    }

    async fn set_leader(&self, is_leader: bool) {
        let changed = self.leadership.send_if_modified(|current| {
            if *current == is_leader {
                return false;
            }
            *current = is_leader;
            true
        });
        if !changed {
            return;
        }

        self.registry.write().await.set_local_leader(is_leader);
        if is_leader {
            tracing::info!(node_id = %self.node_id, "Acquired leadership");
            self.start_duties().await;
        } else {
            tracing::info!(node_id = %self.node_id, "Lost leadership");
            self.stop_duties().await;
        }
    }

    async fn start_duties(&self) {
        let mut task = self.duty_task.lock().await;
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let duties = self.duties.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { duties.run(child).await });
        *task = Some((token, handle));
    }

    async fn stop_duties(&self) {
        let task = self.duty_task.lock().await.take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Leader duties task ended abnormally");
            }
        }
    }

    /// Give up leadership on shutdown.
    ///
    /// The lease passes to the first active peer, or is cleared when there is
    /// none. Returns the successor.
    pub async fn step_down(&self) -> Result<Option<String>> {
        self.stop_duties().await;
        if !self.is_leader() {
            return Ok(None);
        }

        let successor = self
            .registry
            .read()
            .await
            .active_peers()
            .first()
            .map(|n| n.node_id.clone());

        self.leadership.send_replace(false);
        self.registry.write().await.set_local_leader(false);

        let swapped = self
            .store
            .compare_and_swap(
                &StoreKeys::leader(),
                Some(self.node_id.as_str()),
                successor.as_deref(),
                Some(self.lease_ttl),
            )
            .await?;
        if !swapped {
            tracing::warn!(node_id = %self.node_id, "Leader lease had already moved");
            return Ok(None);
        }

        *self.current_leader.write().await = successor.clone();
        match &successor {
            Some(peer) => tracing::info!(successor = %peer, "Handed leadership to peer"),
            None => tracing::info!("Released leadership, no active peer"),
        }
        Ok(successor)
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("node_id", &self.node_id)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}
