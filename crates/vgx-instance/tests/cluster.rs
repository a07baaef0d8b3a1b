//! Selection, liveness filtering and fan-out.

use vgx_core::AdminError;
use vgx_instance::Cluster;
use vgx_testkit::{FakeCluster, fast_config, init_test_logging, sample_descriptor};

fn setup() -> (FakeCluster, Cluster) {
    init_test_logging();
    let descriptor = sample_descriptor();
    let config = fast_config();
    let fake = FakeCluster::from_descriptor(&descriptor, config.clone());
    let cluster = Cluster::connect(descriptor, &fake, &config);
    (fake, cluster)
}

fn ids(handles: &[std::sync::Arc<vgx_instance::InstanceHandle>]) -> Vec<String> {
    handles.iter().map(|h| h.id().to_string()).collect()
}

#[test]
fn handles_share_subscribers() {
    let (_fake, cluster) = setup();
    let t1 = cluster.get("T1").unwrap();
    assert_eq!(ids(t1.subscribers()), ["S1", "S2", "S3"]);
    assert!(std::sync::Arc::ptr_eq(&t1.subscribers()[0], &cluster.get("S1").unwrap()));
    assert_eq!(ids(&cluster.select("S*").unwrap()), ["S1", "S2", "S3"]);
    assert!(cluster.select("Q*").unwrap().is_empty());
    assert!(matches!(cluster.select("Q1"), Err(AdminError::InvalidUsage(_))));
}

#[tokio::test]
async fn running_skips_unreachable_instances() {
    let (fake, cluster) = setup();
    fake.set_unreachable("S2");
    fake.update("S3", |n| n.healthy = false);

    let running = cluster.running("S*").await.unwrap();
    assert_eq!(ids(&running), ["S1"]);
}

#[tokio::test]
async fn fan_out_reports_each_instance() {
    let (fake, cluster) = setup();
    fake.fail_next("S3", "ServiceIn", 3);

    let results = cluster
        .concurrent("S*", |h| async move { h.service_in().await })
        .await
        .unwrap();

    let outcome: Vec<(String, bool)> = results.iter().map(|(id, r)| (id.clone(), r.is_ok())).collect();
    assert_eq!(
        outcome,
        [("S1".to_string(), true), ("S2".to_string(), true), ("S3".to_string(), false)]
    );
    assert!(fake.node("S1").service_in);
    assert!(!fake.node("S3").service_in);
}

#[tokio::test]
async fn cluster_from_node_descriptor() {
    let (fake, _cluster) = setup();
    let config = fast_config();

    let cluster = Cluster::from_remote("h3:9001", &fake, &config).await.unwrap();

    assert_eq!(cluster.descriptor().name(), "testkit");
    assert_eq!(cluster.get(".").unwrap().id(), "S1");
}
