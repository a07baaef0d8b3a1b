//! InstanceHandle — one node of the cluster and its admin operations.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, info};

use vgx_core::{AdminError, AdminResult, Instance, RemoteConfig, SyncConfig, SyncMode, TopologyDescriptor};
use vgx_remote::{Connector, RemoteNodeClient};

use crate::nodestat::{Nodestat, truthy};

/// A cluster member reachable over its admin port.
pub struct InstanceHandle {
    instance: Instance,
    remote: RemoteNodeClient,
    subscribers: Vec<Arc<InstanceHandle>>,
    config: Value,
    sync: SyncConfig,
}

impl InstanceHandle {
    pub fn new(
        instance: Instance,
        connector: &dyn Connector,
        remote: RemoteConfig,
        sync: SyncConfig,
    ) -> Self {
        let transport = connector.transport(&instance.host, instance.aport());
        let remote = RemoteNodeClient::new(instance.id.clone(), transport, remote)
            .with_description(instance.description.clone());
        Self {
            instance,
            remote,
            subscribers: Vec::new(),
            config: Value::Null,
            sync,
        }
    }

    pub fn with_subscribers(mut self, subscribers: Vec<Arc<InstanceHandle>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Attach the instance view printed by [`InstanceHandle::config`].
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn remote(&self) -> &RemoteNodeClient {
        &self.remote
    }

    pub fn subscribers(&self) -> &[Arc<InstanceHandle>] {
        &self.subscribers
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    // ── introspection ──────────────────────────────────────────────

    pub async fn ping(&self) -> AdminResult<Value> {
        self.remote.endpoint("/vgx/ping", &[], false).await
    }

    pub async fn nodestat(&self) -> AdminResult<Nodestat> {
        Nodestat::from_value(&self.nodestat_value().await?)
    }

    pub async fn nodestat_value(&self) -> AdminResult<Value> {
        self.remote.endpoint("/vgx/nodestat", &[], false).await
    }

    /// One nodestat field, `null` when absent.
    pub async fn nodestat_key(&self, key: &str) -> AdminResult<Value> {
        self.remote.endpoint("/vgx/nodestat", &[key], false).await
    }

    pub async fn status(&self) -> AdminResult<Value> {
        self.remote.endpoint("/vgx/status", &[], false).await
    }

    pub async fn digest(&self) -> AdminResult<Option<String>> {
        Ok(self.nodestat_key("digest").await?.as_str().map(str::to_string))
    }

    pub async fn is_readonly(&self) -> AdminResult<bool> {
        Ok(truthy(&self.nodestat_key("readonly").await?))
    }

    pub async fn is_service_in(&self) -> AdminResult<bool> {
        Ok(self.nodestat_key("service-in").await?.as_i64() == Some(1))
    }

    pub async fn health_check(&self, timeout: Duration) -> bool {
        self.remote.health_check(timeout).await
    }

    /// Descriptor stored on the node.
    pub async fn descriptor(&self) -> AdminResult<Value> {
        self.remote
            .endpoint("/vgx/builtin/system_descriptor", &[], false)
            .await
    }

    pub fn clear_endpoint_cache(&self) {
        self.remote.clear_endpoint_cache();
    }

    /// Poll `idle-ms` until the node has been idle for `idle_after_ms`
    /// (default from `[sync]`).
    pub async fn wait_for_idle(&self, timeout: Option<Duration>, idle_after_ms: Option<u64>) -> AdminResult<()> {
        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.sync.idle_timeout());
        let idle_after = idle_after_ms.unwrap_or(self.sync.idle_after_ms) as i64;
        loop {
            let idle_ms = self.nodestat_key("idle-ms").await?.as_i64().unwrap_or(0);
            if idle_ms >= idle_after {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(AdminError::incomplete(format!("instance {self} is busy")));
            }
            debug!(instance = %self.id(), idle_ms, "waiting for idle");
            tokio::time::sleep(self.sync.idle_poll()).await;
        }
    }

    /// A result without the expected `action` is incomplete.
    pub fn expect_action(result: &Value, action: &str) -> AdminResult<()> {
        if !result.is_object() {
            return Err(AdminError::incomplete(result.to_string()));
        }
        if result["action"].as_str() != Some(action) {
            return Err(AdminError::incomplete(format!(
                "expected action {action}, got {result}"
            )));
        }
        Ok(())
    }

    // ── admin commands ─────────────────────────────────────────────

    async fn admin(&self, command: &str, params: &[(&str, String)]) -> AdminResult<Value> {
        self.remote
            .send_admin_request(command, params, None, Some(self.long_timeout()))
            .await
    }

    async fn admin_with(
        &self,
        command: &str,
        params: &[(&str, String)],
        content: impl Into<Bytes>,
    ) -> AdminResult<Value> {
        self.remote
            .send_admin_request(command, params, Some(content.into()), Some(self.long_timeout()))
            .await
    }

    fn long_timeout(&self) -> Duration {
        self.remote.config().endpoint_timeout()
    }

    pub async fn service_in(&self) -> AdminResult<Value> {
        self.remote.send_admin_request("ServiceIn", &[], None, None).await
    }

    pub async fn service_out(&self) -> AdminResult<Value> {
        self.remote.send_admin_request("ServiceOut", &[], None, None).await
    }

    /// Bind the transaction input port and wait until the node reports it.
    pub async fn bind(&self, durable: Option<bool>) -> AdminResult<Value> {
        self.wait_for_idle(None, None).await?;
        if self.instance.tport == 0 {
            return Err(AdminError::invalid_usage(format!(
                "{self} undefined transaction input port"
            )));
        }
        let durable = durable.unwrap_or(self.instance.durable);
        let result = self
            .admin(
                "Bind",
                &[
                    ("port", self.instance.tport.to_string()),
                    ("durable", u8::from(durable).to_string()),
                ],
            )
            .await?;
        Self::expect_action(&result, "bind")?;

        let deadline = Instant::now() + self.sync.bind_deadline();
        while self.nodestat_key("txport").await?.as_u64().unwrap_or(0) == 0 {
            if Instant::now() > deadline {
                return Err(AdminError::incomplete(format!("{self} bind failed")));
            }
            tokio::time::sleep(self.sync.idle_poll()).await;
        }
        info!(instance = %self.id(), tport = self.instance.tport, durable, "bound");
        Ok(result)
    }

    pub async fn unbind(&self) -> AdminResult<Value> {
        self.admin("Unbind", &[]).await
    }

    /// Ask the node to replicate to `destinations` (admin addresses),
    /// by default its configured subscribers, once it is idle. No subscribers
    /// is a no-op.
    pub async fn attach(&self, sync: bool, destinations: Option<Vec<String>>) -> AdminResult<Option<Value>> {
        self.wait_for_idle(None, None).await.map_err(|e| {
            let reason = match e {
                AdminError::Incomplete(msg) => msg,
                other => other.to_string(),
            };
            AdminError::incomplete(format!("{reason}, cannot perform attach at this time"))
        })?;
        if self.subscribers.is_empty() {
            return Ok(None);
        }
        let destinations = destinations.unwrap_or_else(|| {
            self.subscribers
                .iter()
                .map(|s| s.instance.admin_address())
                .collect()
        });
        let goal = json!({
            "control": {"nosync": !sync},
            "destinations": destinations,
        });
        let result = self
            .admin_with("UpdateSubscribers", &[], goal.to_string())
            .await?;
        Ok(Some(result))
    }

    /// Attach a single subscriber URI (`vgx://` or `file://`).
    pub async fn attach_uri(&self, uri: &str) -> AdminResult<Value> {
        self.admin("Attach", &[("uri", uri.to_string())]).await
    }

    pub async fn detach(&self) -> AdminResult<Value> {
        self.admin("DetachAll", &[]).await
    }

    pub async fn sync(&self, mode: SyncMode) -> AdminResult<Value> {
        self.wait_for_idle(None, None).await?;
        self.admin("Sync", &[("mode", mode.to_string())]).await
    }

    pub async fn cancel_sync(&self) -> AdminResult<Value> {
        self.admin("CancelSync", &[]).await
    }

    pub async fn truncate(&self) -> AdminResult<Value> {
        self.admin("Truncate", &[]).await
    }

    pub async fn persist(&self) -> AdminResult<Value> {
        self.admin("Persist", &[]).await
    }

    pub async fn pause_in(&self) -> AdminResult<Value> {
        self.admin("SuspendTxInput", &[]).await
    }

    pub async fn resume_in(&self) -> AdminResult<Value> {
        self.admin("ResumeTxInput", &[]).await
    }

    pub async fn pause_out(&self) -> AdminResult<Value> {
        self.admin("SuspendTxOutput", &[]).await
    }

    pub async fn resume_out(&self) -> AdminResult<Value> {
        self.admin("ResumeTxOutput", &[]).await
    }

    pub async fn pause_ttl(&self) -> AdminResult<Value> {
        self.admin("SuspendEvents", &[]).await
    }

    pub async fn resume_ttl(&self) -> AdminResult<Value> {
        self.admin("ResumeEvents", &[]).await
    }

    pub async fn readonly_graph(&self) -> AdminResult<Value> {
        self.admin("SetReadonly", &[]).await
    }

    pub async fn writable_graph(&self) -> AdminResult<Value> {
        self.admin("ClearReadonly", &[]).await
    }

    pub async fn reset_metrics(&self) -> AdminResult<Value> {
        self.admin("ResetMetrics", &[]).await
    }

    pub async fn restart_http(&self) -> AdminResult<Value> {
        self.admin("RestartHTTP", &[]).await
    }

    pub async fn unsubscribe(&self) -> AdminResult<Value> {
        self.admin("Unsubscribe", &[]).await
    }

    /// Reload plugins, optionally from a plugin definition document.
    pub async fn reload_plugins(&self, plugins: Option<String>) -> AdminResult<Value> {
        match plugins {
            Some(json) => self.admin_with("ReloadPlugins", &[], json).await,
            None => self.admin("ReloadPlugins", &[]).await,
        }
    }

    /// Run a console command against `graph`.
    pub async fn command(&self, graph: &str, cmd: &str) -> AdminResult<Value> {
        self.admin_with("Console", &[("graph", graph.to_string())], cmd.to_string())
            .await
    }

    pub async fn throttle(&self, rate: f64, unit: &str) -> AdminResult<Value> {
        self.admin(
            "Throttle",
            &[("rate", rate.to_string()), ("unit", unit.to_string())],
        )
        .await
    }

    /// Store `descriptor` on the node.
    pub async fn update_descriptor(&self, descriptor: &TopologyDescriptor) -> AdminResult<Value> {
        self.remote
            .send_admin_request(
                "SystemDescriptor",
                &[],
                Some(Bytes::from(descriptor.to_value().to_string())),
                None,
            )
            .await
    }

    /// Dump the operation stream of a standalone node to a file under
    /// its sysroot.
    pub async fn op_dump(&self) -> AdminResult<Value> {
        let stat = self.nodestat().await?;
        if stat.is_bound() {
            return Err(AdminError::invalid_usage(format!(
                "cannot dump subscriber instance {self} (txport {})",
                stat.txport
            )));
        }
        if !stat.subscribers.is_empty() {
            return Err(AdminError::invalid_usage(format!(
                "cannot dump provider instance {self} ({} subscribers)",
                stat.subscribers.len()
            )));
        }
        let sysroot = self.remote.endpoint("/vgx/storage", &["sysroot"], false).await?;
        let Some(sysroot) = sysroot.as_str() else {
            return Err(AdminError::invalid_usage(format!("unknown sysroot for {self}")));
        };
        let ident = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let uri = format!("file:///{sysroot}/opdump_{ident}.tx");

        let attached = self.attach_uri(&uri).await?;
        Self::expect_action(&attached, "attached")?;
        let mut synced = self.sync(SyncMode::Hard).await?;
        if synced["status"].as_str() != Some("complete") {
            while truthy(&self.nodestat_key("synchronizing").await?) {
                tokio::time::sleep(self.sync.opdump_poll()).await;
            }
            if let Some(fields) = synced.as_object_mut() {
                fields.insert("status".into(), json!("complete"));
            }
        }
        self.detach().await?;
        Ok(json!({"attach": attached, "sync": synced}))
    }

    /// Stop the node. Needs two tokens: the first one is passed as
    /// `authshutdown`, confirming the request made with the second.
    pub async fn shutdown(&self) -> AdminResult<Value> {
        let confirm = self.remote.get_auth_token().await?;
        let params = [
            ("authshutdown", confirm),
            ("persist", u8::from(self.instance.durable).to_string()),
        ];
        self.remote.send_admin_request("Shutdown", &params, None, None).await
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.instance, f)
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("instance", &self.instance.to_string())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
