use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::NodeCapabilities;
use crate::error::{MeshError, Result};
use crate::scheduler::DistributedJob;

/// Business logic for one job type.
///
/// Returning `Err` counts as a failed attempt and goes through the retry
/// policy. The error's display text becomes the job's `error`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &DistributedJob) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(DistributedJob) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, job: &DistributedJob) -> anyhow::Result<Value> {
        (self.f)(job.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(DistributedJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Job type to handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Every advertised type needs a handler, or the node would accept work
    /// it cannot run.
    pub fn validate(&self, capabilities: &NodeCapabilities) -> Result<()> {
        match capabilities
            .supported_job_types
            .iter()
            .find(|t| !self.contains(t))
        {
            Some(missing) => Err(MeshError::MissingHandler(missing.clone())),
            None => Ok(()),
        }
    }
}
