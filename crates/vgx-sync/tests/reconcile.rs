//! Subscriber reconciliation on a provider, against the fake cluster.

use serde_json::json;

use vgx_core::{AdminError, GoalControl, SubscriberGoal, SyncMode};
use vgx_testkit::{CLIENT_HOST, FakeCluster, FakeData, fast_config, init_test_logging, sample_descriptor};

const S1: &str = "vgx://h3:9002";
const S2: &str = "vgx://h4:9002";

fn cluster() -> FakeCluster {
    init_test_logging();
    FakeCluster::from_descriptor(&sample_descriptor(), fast_config())
}

fn goal(destinations: &[&str]) -> SubscriberGoal {
    SubscriberGoal::new(
        destinations.iter().map(|d| d.to_string()).collect(),
        GoalControl::default(),
    )
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[tokio::test]
async fn in_sync_destinations_attach_without_copy() {
    let cluster = cluster();
    let reconciler = cluster.reconciler("T1");

    let plan = reconciler.compute_goal(&goal(&["h4:9001", "h3:9001"])).await.unwrap();
    assert_eq!(plan.goal(), vec![S1, S2]);
    assert!(plan.sync_subset().is_empty());

    let result = reconciler.execute_update(&plan, "t").await.unwrap();
    assert_eq!(result["action"], "attached");
    assert_eq!(result["added"], json!([]));
    assert_eq!(result["removed"], json!([]));
    assert_eq!(result["result"], json!([S1, S2]));

    let t1 = cluster.node("T1");
    assert_eq!(sorted(t1.attached), vec![S1, S2]);
    assert!(!t1.tx_in_halted);
}

#[tokio::test]
async fn unchanged_goal_leaves_subscribers_alone() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S2.to_string(), S1.to_string()]);
    // Any detach would fail.
    cluster.fail_engine("T1", "detach");

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001", "h4:9001"])).await.unwrap();
    let result = reconciler.execute_update(&plan, "t").await.unwrap();

    assert_eq!(result["removed"], json!([]));
    let t1 = cluster.node("T1");
    assert_eq!(t1.attached, vec![S2, S1]);
    assert_eq!(t1.engine_failures["detach"], 1);
}

#[tokio::test]
async fn removed_subscribers_are_reported() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S1.to_string(), S2.to_string()]);

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001"])).await.unwrap();
    let result = reconciler.execute_update(&plan, "t").await.unwrap();

    assert_eq!(result["removed"], json!([S2]));
    assert_eq!(cluster.node("T1").attached, vec![S1]);
}

#[tokio::test]
async fn differing_destination_in_service_is_refused() {
    let cluster = cluster();
    cluster.update("S1", |n| {
        n.data = FakeData::new("other", 4, 4);
        n.service_in = true;
    });
    let token = cluster.issue_token("T1");

    let err = cluster
        .reconciler("T1")
        .update_subscribers(CLIENT_HOST, &token, &json!({"destinations": ["h3:9001"]}))
        .await
        .unwrap_err();

    assert!(matches!(err, AdminError::Incomplete(_)), "{err}");
    assert!(err.to_string().contains("service-out and retry"));
    assert!(cluster.node("T1").attached.is_empty());
    assert_eq!(cluster.node("S1").data.digest, "other");
}

#[tokio::test]
async fn differing_destination_out_of_service_is_synced() {
    let cluster = cluster();
    cluster.update("S1", |n| n.data = FakeData::new("stale", 3, 3));

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001", "h4:9001"])).await.unwrap();
    assert_eq!(plan.sync_subset(), vec![S1]);

    let result = reconciler.execute_update(&plan, "t").await.unwrap();
    assert_eq!(result["added"], json!([S1]));
    assert_eq!(cluster.node("S1").data, cluster.node("T1").data);
    assert_eq!(sorted(cluster.node("T1").attached), vec![S1, S2]);
}

#[tokio::test]
async fn empty_destination_may_be_synced_while_serving() {
    let cluster = cluster();
    cluster.update("S1", |n| {
        n.data = FakeData::empty();
        n.service_in = true;
    });

    let plan = cluster
        .reconciler("T1")
        .compute_goal(&goal(&["h3:9001"]))
        .await
        .unwrap();
    assert_eq!(plan.sync_subset(), vec![S1]);
}

#[tokio::test]
async fn nosync_and_existing_provider_skip_the_copy() {
    let cluster = cluster();
    cluster.update("S1", |n| n.data = FakeData::new("stale", 3, 3));
    let reconciler = cluster.reconciler("T1");

    let mut nosync = goal(&["h3:9001"]);
    nosync.control.nosync = true;
    assert!(reconciler.compute_goal(&nosync).await.unwrap().sync_subset().is_empty());

    cluster.update("T1", |n| n.attached = vec![S1.to_string()]);
    let plan = reconciler.compute_goal(&goal(&["h3:9001"])).await.unwrap();
    assert!(plan.sync_subset().is_empty());

    let mut repair = goal(&["h3:9001"]);
    repair.control.repair = true;
    assert_eq!(reconciler.compute_goal(&repair).await.unwrap().sync_subset(), vec![S1]);
}

#[tokio::test]
async fn failed_sync_restores_original_subscribers() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S2.to_string()]);
    cluster.update("S1", |n| n.data = FakeData::new("stale", 3, 3));
    cluster.fail_engine("T1", "sync");

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001", "h4:9001"])).await.unwrap();
    let err = reconciler.execute_update(&plan, "t").await.unwrap_err();

    assert!(matches!(err, AdminError::Internal(_)), "{err}");
    let t1 = cluster.node("T1");
    assert_eq!(t1.attached, vec![S2]);
    assert!(!t1.tx_in_halted);
    assert_eq!(cluster.node("S1").data.digest, "stale");
}

#[tokio::test]
async fn halted_input_stays_halted() {
    let cluster = cluster();
    cluster.update("T1", |n| n.tx_in_halted = true);

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001"])).await.unwrap();
    reconciler.execute_update(&plan, "t").await.unwrap();

    assert!(cluster.node("T1").tx_in_halted);
}

#[tokio::test]
async fn invalid_destinations_are_rejected() {
    let cluster = cluster();
    let reconciler = cluster.reconciler("T1");

    let err = reconciler.compute_goal(&goal(&["h3:9001", "h3:9001"])).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidUsage(_)), "{err}");

    cluster.update("S2", |n| n.txport = 0);
    let err = reconciler.compute_goal(&goal(&["h4:9001"])).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidUsage(_)), "{err}");

    cluster.set_unreachable("S3");
    let err = reconciler.compute_goal(&goal(&["h5:9001"])).await.unwrap_err();
    assert!(matches!(err, AdminError::Address(_)), "{err}");
}

#[tokio::test]
async fn duplicate_tx_address_is_rejected() {
    let cluster = cluster();
    // S2 reports the same IP as S1 and both listen on 9002.
    let ip = cluster.node("S1").ip;
    cluster.update("S2", |n| n.ip = ip);

    let err = cluster
        .reconciler("T1")
        .compute_goal(&goal(&["h3:9001", "h4:9001"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("duplicate destination IP"), "{err}");
}

#[tokio::test]
async fn gate_held_by_another_token_is_busy() {
    let cluster = cluster();
    let auth = cluster.node("T1").auth;
    auth.gate().begin("other").await.unwrap();

    let reconciler = cluster.reconciler("T1");
    let plan = reconciler.compute_goal(&goal(&["h3:9001"])).await.unwrap();
    let err = reconciler.execute_update(&plan, "mine").await.unwrap_err();

    assert_eq!(err.kind(), "AdminBusy");
    assert!(cluster.node("T1").attached.is_empty());
}

#[tokio::test]
async fn update_needs_a_valid_token() {
    let cluster = cluster();
    cluster.issue_token("T1");

    let err = cluster
        .reconciler("T1")
        .update_subscribers(CLIENT_HOST, "bogus", &json!(["h3:9001"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::Permission(_)), "{err}");
}

#[tokio::test]
async fn hard_sync_copies_to_attached_subscribers() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S1.to_string(), S2.to_string()]);
    cluster.update("S1", |n| n.data = FakeData::new("stale", 3, 3));
    let token = cluster.issue_token("T1");

    let result = cluster
        .reconciler("T1")
        .sync_subscribers(CLIENT_HOST, &token, SyncMode::Hard)
        .await
        .unwrap();

    assert_eq!(result, json!({"action": "sync", "mode": "hard", "status": "complete"}));
    assert_eq!(cluster.node("S1").data, cluster.node("T1").data);
    assert!(!cluster.node("T1").tx_in_halted);
}

#[tokio::test]
async fn repair_sync_resyncs_only_differing_subscribers() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S1.to_string(), S2.to_string()]);
    cluster.update("S1", |n| n.data = FakeData::new("stale", 3, 3));
    let token = cluster.issue_token("T1");

    let result = cluster
        .reconciler("T1")
        .sync_subscribers(CLIENT_HOST, &token, SyncMode::Repair)
        .await
        .unwrap();

    assert_eq!(result["status"], "complete");
    assert_eq!(cluster.node("S1").data, cluster.node("T1").data);
    assert_eq!(sorted(cluster.node("T1").attached), vec![S1, S2]);
}

#[tokio::test]
async fn failed_engine_sync_is_reported_in_status() {
    let cluster = cluster();
    cluster.update("T1", |n| n.attached = vec![S1.to_string()]);
    cluster.fail_engine("T1", "sync");
    let token = cluster.issue_token("T1");

    let result = cluster
        .reconciler("T1")
        .sync_subscribers(CLIENT_HOST, &token, SyncMode::Soft)
        .await
        .unwrap();

    assert_ne!(result["status"], "complete");
    assert!(result["status"].as_str().unwrap().contains("engine sync failed"));
}

#[tokio::test]
async fn sync_refused_with_readonly_graphs() {
    let cluster = cluster();
    cluster.update("T1", |n| n.readonly = true);
    let token = cluster.issue_token("T1");

    let err = cluster
        .reconciler("T1")
        .sync_subscribers(CLIENT_HOST, &token, SyncMode::Hard)
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::InvalidUsage(_)), "{err}");
}
