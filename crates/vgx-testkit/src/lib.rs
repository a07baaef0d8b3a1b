//! vgx-testkit — an in-process VGX cluster for integration tests.
//!
//! [`FakeCluster`] implements [`vgx_remote::Connector`]. Every instance of
//! a descriptor becomes a [`FakeNode`] answering the introspection and
//! admin endpoints the admin tooling uses, with per-node token checks and
//! admin gate. `UpdateSubscribers` and `Sync` run the real
//! [`vgx_sync::SubscriberReconciler`] over a [`FakeEngine`].

pub mod cluster;
pub mod engine;
pub mod node;

pub use cluster::{CLIENT_HOST, FakeCluster, FakeTransport};
pub use engine::FakeEngine;
pub use node::{FakeData, FakeNode};

use serde_json::json;
use vgx_core::{AdminConfig, AuthConfig, RemoteConfig, SyncConfig, TopologyDescriptor};

/// Configuration with every wait shrunk to a few milliseconds.
pub fn fast_config() -> AdminConfig {
    AdminConfig {
        remote: RemoteConfig {
            request_timeout_ms: 2_000,
            probe_timeout_ms: 500,
            retry_backoff_ms: 2,
            connect_timeout_step_ms: 1,
            connect_pause_step_ms: 1,
            ..RemoteConfig::default()
        },
        sync: SyncConfig {
            idle_timeout_ms: 100,
            idle_poll_ms: 5,
            bind_deadline_ms: 100,
            settle_ms: 1,
            copy_poll_ms: 2,
            sync_start_deadline_ms: 20,
            sync_completion_deadline_ms: 20,
            service_in_grace_ms: 1,
            opdump_poll_ms: 2,
            ..SyncConfig::default()
        },
        auth: AuthConfig::default(),
    }
}

/// Builder `B1` feeding proxy `T1`, which replicates to search nodes
/// `S1`..`S3` on hosts `h3`..`h5`, all with admin port 9001 and TX port
/// 9002. `D1` dispatches to the three replicas. `A` is a standalone
/// admin instance.
pub fn sample_descriptor() -> TopologyDescriptor {
    TopologyDescriptor::from_value(json!({
        "name": "testkit",
        "graphs": ["g1"],
        "instances": {
            "A": {"type": "admin", "host": "h0", "hport": 9000},
            "B1": {"type": "builder", "host": "h1", "hport": 9000, "tport": 9002, "durable": true},
            "T1": {"type": "txproxy", "host": "h2", "hport": 9000, "tport": 9002},
            "S1": {"type": "search", "host": "h3", "hport": 9000, "tport": 9002},
            "S2": {"type": "search", "host": "h4", "hport": 9000, "tport": 9002},
            "S3": {"type": "search", "host": "h5", "hport": 9000, "tport": 9002},
            "D1": {"type": "dispatch", "host": "h6", "hport": 9000},
        },
        "topology": {
            "transaction": {"B1": {"T1": {"S1": {}, "S2": {}, "S3": {}}}},
            "dispatch": {"D1": {
                "S1": {"channels": 16, "priority": 1},
                "S2": {"channels": 16, "priority": 1},
                "S3": {"channels": 16, "priority": 1},
            }}
        }
    }))
    .expect("sample descriptor is valid")
}

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
