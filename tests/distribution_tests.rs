//! Job distribution tests.
//!
//! These tests drive the leader's monitoring pass by hand and check where
//! queued jobs end up.


use std::time::Duration;

use jobmesh::scheduler::{JobOptions, JobPriority, JobStatus, LoadBalancingStrategy};
use jobmesh::store::{read_json, StoreKeys};
use jobmesh::worker::HandlerRegistry;
use serde_json::json;
use test_harness::{echo_handlers, slow_handler, test_node_config, wait_for_job_status, TestCluster};
use uuid::Uuid;

async fn stored_ids(cluster: &TestCluster, key: &str) -> Vec<Uuid> {
    read_json(cluster.store.as_ref(), key)
        .await
        .unwrap()
        .unwrap_or_default()
}

/// Test 1: The leader routes a queued job to the peer that can run it
#[tokio::test]
async fn test_queued_job_routed_to_capable_peer() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_echo_node("node-a", &["ranking_update"]);
    let worker = cluster.add_echo_node("node-b", &["exam_submission"]);
    cluster.heartbeat_all().await;

    let job_id = leader
        .submit_job("exam_submission", json!({"exam": 1}), JobOptions::default())
        .await
        .unwrap();

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.routed, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(stored_ids(&cluster, &StoreKeys::inbox("node-b")).await, vec![job_id]);
    assert!(stored_ids(&cluster, &StoreKeys::queue(JobPriority::Normal))
        .await
        .is_empty());

    // The peer picks it up on its next heartbeat
    worker.heartbeat().tick().await;
    let job = wait_for_job_status(&leader, job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .expect("Routed job should complete");
    assert_eq!(job.assigned_node_id.as_deref(), Some("node-b"));
    assert!(stored_ids(&cluster, &StoreKeys::inbox("node-b")).await.is_empty());

    cluster.shutdown().await;
}

/// Test 2: When the leader is the best target it starts the job itself
#[tokio::test]
async fn test_leader_claims_job_for_itself() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_echo_node("node-a", &["ranking_update"]);
    let submitter = cluster.add_echo_node("node-b", &["exam_submission"]);
    cluster.heartbeat_all().await;

    let job_id = submitter
        .submit_job("ranking_update", json!({}), JobOptions::default())
        .await
        .unwrap();

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.routed, 0);

    let job = wait_for_job_status(&submitter, job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .expect("Claimed job should complete");
    assert_eq!(job.assigned_node_id.as_deref(), Some("node-a"));

    cluster.shutdown().await;
}

/// Test 3: A job nobody can run stays queued
#[tokio::test]
async fn test_job_without_capable_node_stays_queued() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_echo_node("node-a", &["ranking_update"]);
    cluster.heartbeat_all().await;

    let job_id = leader
        .submit_job("analytics_refresh", json!({}), JobOptions::default())
        .await
        .unwrap();

    for _ in 0..3 {
        let report = leader.elector().duties().run_once().await.unwrap();
        assert_eq!(report.pending, 1);
    }

    let job = leader.get_job_status(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.assigned_node_id.is_none());
    assert_eq!(
        stored_ids(&cluster, &StoreKeys::queue(JobPriority::Normal)).await,
        vec![job_id]
    );

    cluster.shutdown().await;
}

/// Test 4: Higher priority queues are drained first
#[tokio::test]
async fn test_critical_jobs_placed_before_low() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_node(
        test_node_config("node-a", &["result_calculation"]).with_max_concurrent_jobs(1),
        HandlerRegistry::new().register("result_calculation", slow_handler()),
    );
    let submitter = cluster.add_echo_node("node-b", &["ranking_update"]);
    cluster.heartbeat_all().await;

    let low = submitter
        .submit_job(
            "result_calculation",
            json!({}),
            JobOptions::default().with_priority(JobPriority::Low),
        )
        .await
        .unwrap();
    let critical = submitter
        .submit_job(
            "result_calculation",
            json!({}),
            JobOptions::default().with_priority(JobPriority::Critical),
        )
        .await
        .unwrap();

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.pending, 1);

    assert_eq!(
        leader.get_job_status(&critical).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
    assert_eq!(
        leader.get_job_status(&low).await.unwrap().unwrap().status,
        JobStatus::Queued
    );
    assert_eq!(
        stored_ids(&cluster, &StoreKeys::queue(JobPriority::Low)).await,
        vec![low]
    );

    cluster.shutdown().await;
}

/// Test 5: Capability-based placement prefers the higher priority node
#[tokio::test]
async fn test_capability_strategy_prefers_priority() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_node(
        test_node_config("node-a", &["ranking_update"])
            .with_strategy(LoadBalancingStrategy::CapabilityBased),
        echo_handlers(&["ranking_update"]),
    );
    cluster.add_node(
        test_node_config("node-b", &["exam_submission"]).with_priority(5),
        echo_handlers(&["exam_submission"]),
    );
    cluster.add_node(
        test_node_config("node-c", &["exam_submission"]).with_priority(1),
        echo_handlers(&["exam_submission"]),
    );
    cluster.heartbeat_all().await;

    let mut ids = Vec::new();
    for n in 0..2 {
        ids.push(
            leader
                .submit_job("exam_submission", json!(n), JobOptions::default())
                .await
                .unwrap(),
        );
    }

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.routed, 2);
    assert_eq!(stored_ids(&cluster, &StoreKeys::inbox("node-b")).await, ids);
    assert!(stored_ids(&cluster, &StoreKeys::inbox("node-c")).await.is_empty());

    cluster.shutdown().await;
}

/// Test 6: Least-loaded placement spreads a burst across peers
#[tokio::test]
async fn test_least_loaded_spreads_jobs() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_echo_node("node-a", &["ranking_update"]);
    cluster.add_echo_node("node-b", &["exam_submission"]);
    cluster.add_echo_node("node-c", &["exam_submission"]);
    cluster.heartbeat_all().await;

    for n in 0..4 {
        leader
            .submit_job("exam_submission", json!(n), JobOptions::default())
            .await
            .unwrap();
    }

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.routed, 4);
    assert_eq!(stored_ids(&cluster, &StoreKeys::inbox("node-b")).await.len(), 2);
    assert_eq!(stored_ids(&cluster, &StoreKeys::inbox("node-c")).await.len(), 2);

    cluster.shutdown().await;
}

/// Test 7: Jobs routed to a node that disappears go back on the queue
#[tokio::test]
async fn test_departed_node_inbox_requeued() {
    let mut cluster = TestCluster::new();
    let leader = cluster.add_echo_node("node-a", &["ranking_update"]);
    cluster.add_echo_node("node-b", &["exam_submission"]);
    cluster.heartbeat_all().await;

    let job_id = leader
        .submit_job("exam_submission", json!({}), JobOptions::default())
        .await
        .unwrap();
    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.routed, 1);

    // node-b dies before draining its inbox
    assert!(cluster.crash_node("node-b"));
    tokio::time::sleep(Duration::from_millis(600)).await;
    leader.heartbeat().tick().await;

    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.pending, 1);

    let members: Vec<String> = read_json(cluster.store.as_ref(), &StoreKeys::members())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(members, vec!["node-a".to_string()]);
    assert_eq!(leader.get_cluster_health().await.total_nodes, 1);
    assert!(stored_ids(&cluster, &StoreKeys::inbox("node-b")).await.is_empty());
    assert_eq!(
        stored_ids(&cluster, &StoreKeys::queue(JobPriority::Normal)).await,
        vec![job_id]
    );

    // A replacement worker gets it on the next pass
    let replacement = cluster.add_echo_node("node-c", &["exam_submission"]);
    cluster.heartbeat_all().await;
    let report = leader.elector().duties().run_once().await.unwrap();
    assert_eq!(report.routed, 1);
    replacement.heartbeat().tick().await;
    wait_for_job_status(&leader, job_id, JobStatus::Completed, Duration::from_secs(5))
        .await
        .expect("Requeued job should complete on the replacement");

    cluster.shutdown().await;
}
