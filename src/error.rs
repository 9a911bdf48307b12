use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job type {0:?} is not supported by this node")]
    UnsupportedJobType(String),

    #[error("No handler registered for advertised job type {0:?}")]
    MissingHandler(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    /// The coordination store could not be reached or rejected the call.
    pub fn is_store_failure(&self) -> bool {
        match self {
            MeshError::Store(_) => true,
            #[cfg(feature = "redis")]
            MeshError::Redis(_) => true,
            _ => false,
        }
    }
}
