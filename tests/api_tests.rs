
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use jobmesh::api::{router, ApiState};
use jobmesh::scheduler::JobStatus;
use jobmesh::MeshNode;
use test_harness::{wait_for_job_status, TestCluster};

/// Create a test app over a single echo node
fn create_test_app(job_types: &[&str]) -> (Router, Arc<MeshNode>, TestCluster) {
    let mut cluster = TestCluster::new();
    let node = cluster.add_echo_node("node-a", job_types);
    let app = router(ApiState { node: node.clone() });
    (app, node, cluster)
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_submit_job_accepted() {
    let (app, node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app
        .oneshot(post_json(
            "/api/jobs",
            json!({"type": "ranking_update", "data": {"exam": 3}, "priority": "high"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert!(json["error"].is_null());

    let job_id: Uuid = json["jobId"].as_str().unwrap().parse().unwrap();
    let job = wait_for_job_status(&node, job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .expect("Submitted job should complete");
    assert_eq!(job.result, Some(json!({"echo": {"exam": 3}})));
}

#[tokio::test]
async fn test_submit_unsupported_job_is_queued() {
    let (app, node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app
        .oneshot(post_json("/api/jobs", json!({"type": "analytics_refresh"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    let job_id: Uuid = json["jobId"].as_str().unwrap().parse().unwrap();

    let job = node.get_job_status(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.data, Value::Null);
}

#[tokio::test]
async fn test_submit_missing_type_rejected() {
    let (app, _node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app
        .oneshot(post_json("/api/jobs", json!({"data": {}})))
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_submit_during_store_outage() {
    let (app, _node, cluster) = create_test_app(&["ranking_update"]);
    cluster.store.set_unavailable(true);

    // Not runnable locally, so it must be queued through the store
    let response = app
        .oneshot(post_json("/api/jobs", json!({"type": "exam_submission"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(json["jobId"].is_null());
    assert!(json["error"].as_str().unwrap().contains("store unavailable"));
}

#[tokio::test]
async fn test_get_job_status() {
    let (app, node, _cluster) = create_test_app(&["ranking_update"]);
    let job_id = node
        .submit_job("ranking_update", json!([1, 2]), Default::default())
        .await
        .unwrap();
    wait_for_job_status(&node, job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .unwrap();

    let response = app
        .oneshot(get(&format!("/api/jobs/{}", job_id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["id"], job_id.to_string());
    assert_eq!(json["type"], "ranking_update");
    assert_eq!(json["status"], "completed");
    assert_eq!(json["assignedNodeId"], "node-a");
    assert_eq!(json["retryCount"], 0);
}

#[tokio::test]
async fn test_get_unknown_job_not_found() {
    let (app, _node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app
        .oneshot(get(&format!("/api/jobs/{}", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_get_job_invalid_id() {
    let (app, _node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app.oneshot(get("/api/jobs/not-a-uuid")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_jobs() {
    let (app, node, _cluster) = create_test_app(&["ranking_update"]);

    let response = app.clone().oneshot(get("/api/jobs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));

    for n in 0..2 {
        node.submit_job("ranking_update", json!(n), Default::default())
            .await
            .unwrap();
    }

    let response = app.oneshot(get("/api/jobs")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cluster_health_endpoint() {
    let (app, node, _cluster) = create_test_app(&["ranking_update"]);
    node.heartbeat().tick().await;
    node.elector().tick().await;

    let response = app.oneshot(get("/api/cluster/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["totalNodes"], 1);
    assert_eq!(json["activeNodes"], 1);
    assert_eq!(json["leaderId"], "node-a");
    assert_eq!(json["isLeader"], true);
    assert_eq!(json["totalJobs"], 0);
    assert!(json["averageDurationMs"].is_null());
    assert_eq!(json["loadDistribution"][0]["nodeId"], "node-a");
    assert_eq!(json["loadDistribution"][0]["status"], "active");
}
