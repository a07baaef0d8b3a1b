//! Instance handle operations against the fake cluster.

use std::sync::Arc;
use std::time::Duration;

use vgx_core::{AdminError, TopologyDescriptor};
use vgx_instance::{Cluster, InstanceHandle};
use vgx_testkit::{FakeCluster, fast_config, init_test_logging, sample_descriptor};

fn setup() -> (FakeCluster, Cluster) {
    init_test_logging();
    let descriptor = sample_descriptor();
    let config = fast_config();
    let fake = FakeCluster::from_descriptor(&descriptor, config.clone());
    let cluster = Cluster::connect(descriptor, &fake, &config);
    (fake, cluster)
}

fn handle(cluster: &Cluster, id: &str) -> Arc<InstanceHandle> {
    cluster.get(id).unwrap()
}

#[tokio::test]
async fn nodestat_is_typed() {
    let (_fake, cluster) = setup();
    let s1 = handle(&cluster, "S1");

    let stat = s1.nodestat().await.unwrap();
    assert_eq!(stat.txport, 9002);
    assert_eq!(stat.digest.as_deref(), Some("d0"));
    assert!(!stat.readonly);
    assert_eq!(s1.digest().await.unwrap().as_deref(), Some("d0"));
    assert!(!s1.is_service_in().await.unwrap());
    assert!(s1.health_check(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn bind_without_tport_is_invalid() {
    let (fake, cluster) = setup();
    let err = handle(&cluster, "D1").bind(None).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidUsage(_)), "{err}");
    assert!(fake.commands("D1").is_empty());
}

#[tokio::test]
async fn bind_waits_for_the_port() {
    let (fake, cluster) = setup();
    fake.update("S3", |n| n.txport = 0);

    let result = handle(&cluster, "S3").bind(None).await.unwrap();

    assert_eq!(result["action"], "bind");
    assert_eq!(fake.node("S3").txport, 9002);
}

#[tokio::test]
async fn busy_node_is_incomplete() {
    let (fake, cluster) = setup();
    fake.update("S1", |n| n.idle_ms = 0);

    let err = handle(&cluster, "S1")
        .wait_for_idle(Some(Duration::from_millis(20)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::Incomplete(_)), "{err}");
    assert!(err.to_string().contains("is busy"));
}

#[tokio::test]
async fn idle_threshold_can_be_given_per_call() {
    let (fake, cluster) = setup();
    fake.update("S1", |n| n.idle_ms = 1_000);
    let s1 = handle(&cluster, "S1");

    let err = s1.wait_for_idle(Some(Duration::from_millis(20)), None).await.unwrap_err();
    assert!(matches!(err, AdminError::Incomplete(_)), "{err}");
    s1.wait_for_idle(Some(Duration::from_millis(20)), Some(500)).await.unwrap();
}

#[tokio::test]
async fn attach_without_subscribers_is_a_noop() {
    let (fake, cluster) = setup();
    assert!(handle(&cluster, "S1").attach(true, None).await.unwrap().is_none());
    assert!(fake.commands("S1").is_empty());
}

#[tokio::test]
async fn attach_waits_for_idle_even_without_subscribers() {
    let (fake, cluster) = setup();
    fake.update("S1", |n| n.idle_ms = 0);

    let err = handle(&cluster, "S1").attach(true, None).await.unwrap_err();
    assert!(matches!(err, AdminError::Incomplete(_)), "{err}");
    assert!(err.to_string().contains("cannot perform attach"));
}

#[tokio::test]
async fn attach_sends_subscriber_goal() {
    let (fake, cluster) = setup();

    let result = handle(&cluster, "T1").attach(false, None).await.unwrap().unwrap();

    assert_eq!(result["action"], "attached");
    let mut attached = fake.node("T1").attached;
    attached.sort();
    assert_eq!(attached, ["vgx://h3:9002", "vgx://h4:9002", "vgx://h5:9002"]);
    assert_eq!(fake.commands("T1"), ["UpdateSubscribers"]);
}

#[tokio::test]
async fn attach_to_busy_provider_is_incomplete() {
    let (fake, cluster) = setup();
    fake.update("T1", |n| n.idle_ms = 0);

    let err = handle(&cluster, "T1").attach(true, None).await.unwrap_err();
    assert!(err.to_string().contains("cannot perform attach at this time"), "{err}");
    assert!(fake.node("T1").attached.is_empty());
}

#[tokio::test]
async fn failed_admin_requests_are_retried() {
    let (fake, cluster) = setup();
    let s1 = handle(&cluster, "S1");

    fake.fail_next("S1", "ServiceIn", 2);
    s1.service_in().await.unwrap();
    assert!(fake.node("S1").service_in);
    assert_eq!(fake.commands("S1").len(), 3);

    fake.fail_next("S1", "ServiceOut", 3);
    let err = s1.service_out().await.unwrap_err();
    assert!(matches!(err, AdminError::Server(_)), "{err}");
    assert!(fake.node("S1").service_in);
}

#[tokio::test]
async fn shutdown_uses_two_tokens() {
    let (fake, cluster) = setup();

    let result = handle(&cluster, "S1").shutdown().await.unwrap();

    assert_eq!(result["action"], "shutdown");
    assert!(!fake.node("S1").reachable);
    assert!(!handle(&cluster, "S1").remote().ping(1).await);
}

#[tokio::test]
async fn op_dump_writes_under_sysroot() {
    let (fake, cluster) = setup();

    let result = handle(&cluster, "A").op_dump().await.unwrap();

    assert_eq!(result["attach"]["action"], "attached");
    assert_eq!(result["sync"]["status"], "complete");
    let a = fake.node("A");
    assert!(a.attached.is_empty());
    assert_eq!(fake.commands("A"), ["Attach", "Sync", "DetachAll"]);
}

#[tokio::test]
async fn op_dump_refuses_subscribers() {
    let (_fake, cluster) = setup();
    let err = handle(&cluster, "S1").op_dump().await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidUsage(_)), "{err}");
}

#[tokio::test]
async fn descriptor_round_trips_through_the_node() {
    let (fake, cluster) = setup();
    let s1 = handle(&cluster, "S1");

    let stored = TopologyDescriptor::from_value(s1.descriptor().await.unwrap()).unwrap();
    assert_eq!(stored.name(), "testkit");

    let renamed = TopologyDescriptor::from_value({
        let mut doc = stored.to_value();
        doc["name"] = "renamed".into();
        doc
    })
    .unwrap();
    s1.update_descriptor(&renamed).await.unwrap();
    assert_eq!(fake.node("S1").descriptor["name"], "renamed");
}

#[tokio::test]
async fn pass_through_commands_reach_the_node() {
    let (fake, cluster) = setup();
    let t1 = handle(&cluster, "T1");

    t1.pause_in().await.unwrap();
    assert!(fake.node("T1").tx_in_halted);
    t1.resume_in().await.unwrap();
    t1.readonly_graph().await.unwrap();
    assert!(t1.is_readonly().await.unwrap());
    t1.writable_graph().await.unwrap();
    t1.throttle(100.0, "tx").await.unwrap();
    t1.command("g1", "show").await.unwrap();

    assert_eq!(
        fake.commands("T1"),
        ["SuspendTxInput", "ResumeTxInput", "SetReadonly", "ClearReadonly", "Throttle", "Console"]
    );
    assert!(!fake.node("T1").readonly);
}
