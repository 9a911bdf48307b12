//! HTTP surface over a [`MeshNode`].
//!
//! | Method | Path                  | Body / result                      |
//! |--------|-----------------------|------------------------------------|
//! | POST   | `/api/jobs`           | [`SubmitJobRequest`] → job id      |
//! | GET    | `/api/jobs`           | jobs held on this node             |
//! | GET    | `/api/jobs/{id}`      | one job, local copy or store mirror |
//! | GET    | `/api/cluster/health` | [`ClusterHealth`](crate::cluster::ClusterHealth) |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::MeshError;
use crate::node::MeshNode;
use crate::scheduler::{JobOptions, JobPriority};

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<MeshNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub data: Value,
    pub priority: Option<JobPriority>,
    pub routing_key: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub success: bool,
    pub job_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(job_status_handler))
        .route("/api/cluster/health", get(cluster_health_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `token` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting HTTP API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "HTTP API failed");
    }
}

fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::JobNotFound(_) => StatusCode::NOT_FOUND,
        MeshError::UnsupportedJobType(_) | MeshError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        e if e.is_store_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: MeshError) -> Response {
    (
        status_for(&error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let options = JobOptions {
        priority: payload.priority,
        routing_key: payload.routing_key,
        max_retries: payload.max_retries,
    };

    match state
        .node
        .submit_job(&payload.job_type, payload.data, options)
        .await
    {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.list_jobs().await)
}

async fn job_status_handler(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.node.get_job_status(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(MeshError::JobNotFound(id)),
        Err(e) => error_response(e),
    }
}

async fn cluster_health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.get_cluster_health().await)
}
