use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::{ClusterHealth, LeaderDuties, LeaderElector, NodeDescriptor, NodeRegistry};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::scheduler::{DistributedJob, Dispatcher, JobEvent, JobOptions, JobTable, LoadBalancer};
use crate::store::CoordinationStore;
use crate::worker::{HandlerRegistry, HeartbeatPublisher, JobJanitor, JobProcessor};

/// Buffered job events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// One worker process in the mesh.
///
/// Owns every component and the three periodic tasks (heartbeat, leader
/// election, janitor). Nodes share nothing but the coordination store.
pub struct MeshNode {
    config: NodeConfig,
    registry: Arc<RwLock<NodeRegistry>>,
    jobs: Arc<RwLock<JobTable>>,
    processor: JobProcessor,
    dispatcher: Arc<Dispatcher>,
    elector: Arc<LeaderElector>,
    heartbeat: Arc<HeartbeatPublisher>,
    janitor: Arc<JobJanitor>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build a node without starting it.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, or when an advertised job type has
    /// no handler.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        handlers.validate(&config.capabilities)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(RwLock::new(NodeRegistry::new(NodeDescriptor::from_config(
            &config,
        ))));
        let jobs = Arc::new(RwLock::new(JobTable::new()));

        let processor = JobProcessor::new(
            config.node_id.clone(),
            config.capabilities.max_concurrent_jobs,
            store.clone(),
            jobs.clone(),
            handlers,
            events.clone(),
            Duration::from_millis(config.job_retention_ms),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.node_id.clone(),
            config.capabilities.clone(),
            config.default_max_retries,
            store.clone(),
            jobs.clone(),
            processor.clone(),
            LoadBalancer::new(config.strategy),
            events.clone(),
        ));
        let duties = Arc::new(LeaderDuties::new(
            config.leader_election_interval(),
            chrono::Duration::milliseconds(config.node_ttl_ms as i64),
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            processor.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(
            config.node_id.clone(),
            config.leader_election_interval(),
            config.leader_lease_ttl(),
            store.clone(),
            registry.clone(),
            duties,
        ));
        let heartbeat = Arc::new(HeartbeatPublisher::new(
            config.heartbeat_interval(),
            config.node_ttl(),
            store,
            registry.clone(),
            processor.clone(),
            dispatcher.clone(),
            elector.subscribe(),
        ));
        let janitor = Arc::new(JobJanitor::new(
            config.janitor_interval(),
            config.stale_job_threshold(),
            config.job_retention(),
            jobs.clone(),
            processor.clone(),
        ));

        Ok(Self {
            config,
            registry,
            jobs,
            processor,
            dispatcher,
            elector,
            heartbeat,
            janitor,
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the heartbeat, leader election and janitor loops.
    ///
    /// The first heartbeat and election round run right away.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            tracing::warn!(node_id = %self.config.node_id, "Node already started");
            return;
        }

        tracing::info!(
            node_id = %self.config.node_id,
            host = %self.config.host,
            port = self.config.port,
            max_concurrent_jobs = self.config.capabilities.max_concurrent_jobs,
            job_types = ?self.config.capabilities.supported_job_types,
            strategy = %self.config.strategy,
            "Starting node"
        );

        let heartbeat = self.heartbeat.clone();
        let token = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move { heartbeat.run(token).await }));

        let elector = self.elector.clone();
        let token = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move { elector.run(token).await }));

        let janitor = self.janitor.clone();
        let token = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move { janitor.run(token).await }));
    }

    /// Stop the periodic tasks, announce departure and hand off leadership.
    pub async fn shutdown(&self) {
        tracing::info!(node_id = %self.config.node_id, "Shutting down node");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self.heartbeat.publish_inactive().await {
            tracing::warn!(error = %e, "Failed to publish final heartbeat");
        }
        if let Err(e) = self.elector.step_down().await {
            tracing::warn!(error = %e, "Failed to hand off leadership");
        }
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
    }

    /// Run until `token` is cancelled, then shut down.
    pub async fn run_until(&self, token: CancellationToken) {
        self.start().await;
        token.cancelled().await;
        self.shutdown().await;
    }

    /// Submit a job. Returns its id once placed; execution is asynchronous.
    pub async fn submit_job(
        &self,
        job_type: &str,
        data: Value,
        options: JobOptions,
    ) -> Result<Uuid> {
        self.dispatcher.submit(job_type, data, options).await
    }

    /// Local copy when this node holds the job, otherwise the store's mirror.
    pub async fn get_job_status(&self, job_id: &Uuid) -> Result<Option<DistributedJob>> {
        self.dispatcher.get_job(job_id).await
    }

    /// Jobs held on this node, oldest first.
    pub async fn list_jobs(&self) -> Vec<DistributedJob> {
        self.dispatcher.local_jobs().await
    }

    /// Start a queued job on this node. `Ok(false)` when no slot is free.
    pub async fn claim_job(&self, job_id: &Uuid) -> Result<bool> {
        self.dispatcher.claim(job_id).await
    }

    /// Read-only snapshot; this node's load is the live slot count.
    pub async fn get_cluster_health(&self) -> ClusterHealth {
        let leader_id = self.elector.current_leader().await;
        let registry = self.registry.read().await;
        let jobs = self.jobs.read().await;
        ClusterHealth::collect(&registry, &jobs, leader_id, self.processor.active_jobs())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Registry snapshot, ordered by node id.
    pub async fn nodes(&self) -> Vec<NodeDescriptor> {
        self.registry.read().await.snapshot()
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    pub fn heartbeat(&self) -> &HeartbeatPublisher {
        &self.heartbeat
    }

    pub fn elector(&self) -> &LeaderElector {
        &self.elector
    }

    pub fn janitor(&self) -> &JobJanitor {
        &self.janitor
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("node_id", &self.config.node_id)
            .field("is_leader", &self.is_leader())
            .field("processor", &self.processor)
            .finish()
    }
}
