//! Handles for every instance of a descriptor.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use vgx_core::{AdminConfig, AdminResult, InstanceId, TopologyDescriptor, split_address};
use vgx_remote::{Connector, RemoteNodeClient};

use crate::fanout::{FanOutResult, fan_out};
use crate::handle::InstanceHandle;

/// Liveness probe timeout used when filtering for running instances.
const RUNNING_PROBE: Duration = Duration::from_millis(510);

#[derive(Debug)]
pub struct Cluster {
    descriptor: Arc<TopologyDescriptor>,
    handles: BTreeMap<InstanceId, Arc<InstanceHandle>>,
}

impl Cluster {
    /// Build handles for all instances, subscribers before providers.
    pub fn connect(descriptor: TopologyDescriptor, connector: &dyn Connector, config: &AdminConfig) -> Self {
        let mut handles = BTreeMap::new();
        let ids: Vec<InstanceId> = descriptor.instances().map(|i| i.id.clone()).collect();
        for id in &ids {
            build(&descriptor, id, connector, config, &mut handles);
        }
        debug!(system = descriptor.name(), instances = handles.len(), "cluster handles ready");
        Self {
            descriptor: Arc::new(descriptor),
            handles,
        }
    }

    /// Fetch the descriptor stored on the node at `address` (`host:adminport`)
    /// and build a cluster from it. `.` then refers to that node.
    pub async fn from_remote(address: &str, connector: &dyn Connector, config: &AdminConfig) -> AdminResult<Self> {
        let (host, port) = split_address(address)?;
        let client = RemoteNodeClient::new(address, connector.transport(&host, port), config.remote.clone());
        let raw = client
            .endpoint("/vgx/builtin/system_descriptor", &[], false)
            .await?;
        let descriptor = TopologyDescriptor::from_value(raw)?.with_origin(host, port);
        info!(%address, system = descriptor.name(), "loaded descriptor from node");
        Ok(Self::connect(descriptor, connector, config))
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    pub fn handles(&self) -> impl Iterator<Item = &Arc<InstanceHandle>> {
        self.handles.values()
    }

    /// One handle; accepts `.` like [`TopologyDescriptor::get`].
    pub fn get(&self, id: &str) -> AdminResult<Arc<InstanceHandle>> {
        let instance = self.descriptor.get(id)?;
        Ok(Arc::clone(&self.handles[&instance.id]))
    }

    pub fn select(&self, pattern: &str) -> AdminResult<Vec<Arc<InstanceHandle>>> {
        Ok(self
            .descriptor
            .select(pattern)?
            .into_iter()
            .map(|i| Arc::clone(&self.handles[&i.id]))
            .collect())
    }

    /// Selected instances answering a health check.
    pub async fn running(&self, pattern: &str) -> AdminResult<Vec<Arc<InstanceHandle>>> {
        let selected = self.select(pattern)?;
        let probes = fan_out(&selected, |h| async move {
            Ok(h.health_check(RUNNING_PROBE).await)
        })
        .await;
        let alive: BTreeSet<InstanceId> = probes
            .into_iter()
            .filter_map(|(id, up)| matches!(up, Ok(true)).then_some(id))
            .collect();
        Ok(selected
            .into_iter()
            .filter(|handle| {
                let up = alive.contains(handle.id());
                if !up {
                    info!(instance = %handle.id(), "not running");
                }
                up
            })
            .collect())
    }

    /// Run `op` on every running instance matching `pattern`.
    pub async fn concurrent<F, Fut, T>(&self, pattern: &str, op: F) -> AdminResult<FanOutResult<T>>
    where
        F: Fn(Arc<InstanceHandle>) -> Fut,
        Fut: Future<Output = AdminResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let running = self.running(pattern).await?;
        Ok(fan_out(&running, op).await)
    }
}

fn build(
    descriptor: &TopologyDescriptor,
    id: &str,
    connector: &dyn Connector,
    config: &AdminConfig,
    handles: &mut BTreeMap<InstanceId, Arc<InstanceHandle>>,
) -> Option<Arc<InstanceHandle>> {
    if let Some(existing) = handles.get(id) {
        return Some(Arc::clone(existing));
    }
    let instance = descriptor.instance(id)?.clone();
    let subscribers: Vec<Arc<InstanceHandle>> = descriptor
        .subscribers(id)
        .into_iter()
        .filter_map(|s| build(descriptor, &s.id, connector, config, handles))
        .collect();
    let handle = Arc::new(
        InstanceHandle::new(instance, connector, config.remote.clone(), config.sync.clone())
            .with_subscribers(subscribers)
            .with_config(descriptor.instance_config(id).unwrap_or_default()),
    );
    handles.insert(id.to_string(), Arc::clone(&handle));
    Some(handle)
}
