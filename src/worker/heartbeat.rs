use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cluster::registry::{HeartbeatRecord, NodeRegistry, NodeStatus};
use crate::error::Result;
use crate::scheduler::Dispatcher;
use crate::store::{read_json, update_list, write_json, CoordinationStore, StoreKeys};
use crate::worker::JobProcessor;

/// Periodically advertises this node's liveness and load, and refreshes its
/// view of the peers.
pub struct HeartbeatPublisher {
    interval: Duration,
    node_ttl: Duration,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<RwLock<NodeRegistry>>,
    processor: JobProcessor,
    dispatcher: Arc<Dispatcher>,
    leadership: watch::Receiver<bool>,
}

impl HeartbeatPublisher {
    pub fn new(
        interval: Duration,
        node_ttl: Duration,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<RwLock<NodeRegistry>>,
        processor: JobProcessor,
        dispatcher: Arc<Dispatcher>,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Self {
            interval,
            node_ttl,
            store,
            registry,
            processor,
            dispatcher,
            leadership,
        }
    }

    /// Tick until cancelled. The first tick fires immediately.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    /// One heartbeat. Each step that fails is logged and skipped.
    pub async fn tick(&self) {
        if let Err(e) = self.publish().await {
            tracing::warn!(error = %e, "Failed to publish heartbeat");
        }

        match self.ensure_membership().await {
            Ok(members) => {
                if let Err(e) = self.sync_peers(&members).await {
                    tracing::warn!(error = %e, "Failed to sync peer heartbeats");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to update cluster membership"),
        }

        match self.dispatcher.drain_inbox().await {
            Ok(0) => {}
            Ok(claimed) => tracing::debug!(claimed, "Claimed routed jobs"),
            Err(e) => tracing::warn!(error = %e, "Failed to drain job inbox"),
        }
    }

    /// Refresh the local descriptor and write its heartbeat record.
    pub async fn publish(&self) -> Result<()> {
        let is_leader = *self.leadership.borrow();
        let record = {
            let mut registry = self.registry.write().await;
            registry.refresh_local(Utc::now(), self.processor.active_jobs(), is_leader);
            HeartbeatRecord::from(registry.local())
        };
        self.write_record(&record).await
    }

    /// Final heartbeat announcing this node is going away.
    pub async fn publish_inactive(&self) -> Result<()> {
        let record = {
            let mut registry = self.registry.write().await;
            registry.set_local_status(NodeStatus::Inactive);
            registry.set_local_leader(false);
            HeartbeatRecord::from(registry.local())
        };
        self.write_record(&record).await
    }

    async fn write_record(&self, record: &HeartbeatRecord) -> Result<()> {
        write_json(
            self.store.as_ref(),
            &StoreKeys::heartbeat(&record.node_id),
            record,
            Some(self.node_ttl),
        )
        .await
    }

    /// Make sure this node is listed under the membership key. Returns the
    /// member list as stored.
    async fn ensure_membership(&self) -> Result<Vec<String>> {
        let local_id = self.registry.read().await.local_id().to_string();
        update_list(self.store.as_ref(), &StoreKeys::members(), |members: &mut Vec<String>| {
            if !members.contains(&local_id) {
                members.push(local_id.clone());
                members.sort();
            }
        })
        .await
    }

    /// Refresh every listed peer from its heartbeat record and forget peers
    /// the leader has taken off the membership list.
    async fn sync_peers(&self, members: &[String]) -> Result<()> {
        let local_id = {
            let mut registry = self.registry.write().await;
            for node_id in registry.retain_peers(|id| members.iter().any(|m| m == id)) {
                tracing::info!(node_id = %node_id, "Peer left the cluster");
            }
            registry.local_id().to_string()
        };
        for node_id in members.iter().filter(|id| **id != local_id) {
            let record: Option<HeartbeatRecord> =
                read_json(self.store.as_ref(), &StoreKeys::heartbeat(node_id)).await?;
            let mut registry = self.registry.write().await;
            match record {
                Some(record) => registry.apply_heartbeat(record),
                None => {
                    if registry.mark_inactive(node_id) {
                        tracing::warn!(node_id = %node_id, "Peer heartbeat expired");
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HeartbeatPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatPublisher")
            .field("interval", &self.interval)
            .field("node_ttl", &self.node_ttl)
            .finish()
    }
}
