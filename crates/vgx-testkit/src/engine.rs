//! [`LocalEngine`] over a fake node's state.

use async_trait::async_trait;
use tracing::debug;

use vgx_core::{AdminError, AdminResult};
use vgx_sync::LocalEngine;

use crate::cluster::FakeCluster;
use crate::node::FakeNode;

#[derive(Debug, Clone)]
pub struct FakeEngine {
    cluster: FakeCluster,
    id: String,
}

impl FakeEngine {
    pub fn new(cluster: FakeCluster, id: &str) -> Self {
        Self {
            cluster,
            id: id.to_string(),
        }
    }

    fn with<R>(&self, op: &str, f: impl FnOnce(&mut FakeNode) -> R) -> AdminResult<R> {
        self.cluster.update(&self.id, |n| {
            if FakeNode::take_failure(&mut n.engine_failures, op) {
                return Err(AdminError::Internal(format!("engine {op} failed on {}", n.id)));
            }
            Ok(f(n))
        })
    }
}

#[async_trait]
impl LocalEngine for FakeEngine {
    async fn attached(&self) -> AdminResult<Vec<String>> {
        self.with("attached", |n| n.attached.clone())
    }

    async fn detach_all(&self) -> AdminResult<()> {
        self.with("detach", |n| n.attached.clear())
    }

    async fn attach(&self, uris: &[String]) -> AdminResult<()> {
        self.with("attach", |n| {
            for uri in uris {
                if !n.attached.contains(uri) {
                    n.attached.push(uri.clone());
                }
            }
        })
    }

    /// Copies data to every bound node behind an attached URI. Hard and
    /// soft sync behave the same here.
    async fn sync(&self, hard: bool) -> AdminResult<()> {
        let (source, targets, stalled) =
            self.with("sync", |n| (n.clone(), n.attached.clone(), n.stall_sync))?;
        if stalled {
            debug!(node = %self.id, "sync stalled");
            return Ok(());
        }
        let mut state = self.cluster.state.lock().expect("fake cluster lock");
        for node in state.nodes.values_mut() {
            if node.tx_uri().is_some_and(|uri| targets.contains(&uri)) {
                node.data = source.data.clone();
                node.master_serial = source.master_serial;
                debug!(source = %source.id, target = %node.id, hard, "synced");
            }
        }
        Ok(())
    }

    async fn suspend_tx_input(&self) -> AdminResult<bool> {
        self.with("suspend", |n| {
            let suspended_here = !n.tx_in_halted;
            n.tx_in_halted = true;
            suspended_here
        })
    }

    async fn resume_tx_input(&self) -> AdminResult<()> {
        self.with("resume", |n| n.tx_in_halted = false)
    }

    async fn fingerprint(&self) -> AdminResult<String> {
        self.with("fingerprint", |n| n.data.digest.clone())
    }

    async fn count_readonly(&self) -> AdminResult<usize> {
        self.with("readonly", |n| usize::from(n.readonly))
    }

    async fn subscriber_admin_addresses(&self) -> AdminResult<Vec<String>> {
        let attached = self.attached().await?;
        let state = self.cluster.state.lock().expect("fake cluster lock");
        Ok(attached
            .iter()
            .filter_map(|uri| {
                state
                    .nodes
                    .values()
                    .find(|s| s.tx_uri().as_ref() == Some(uri))
                    .map(FakeNode::admin_address)
            })
            .collect())
    }
}
