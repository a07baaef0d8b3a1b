//! Subscriber reconciliation, executed on the provider node.
//!
//! ```text
//! goal {control, destinations}
//!   │  compute_goal: per destination ping → peerstat → graphsum/status
//!   ▼
//! GoalPlan (goal set, sync subset)
//!   │  execute_update, under the admin gate:
//!   │    suspend TX input
//!   │    [sync subset] detach all → attach subset → hard sync → detach all
//!   │    [goal != attached] detach all → attach goal
//!   │    on failure: restore original subscribers
//!   ▼
//! {action: "attached", added, removed, result}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use vgx_auth::AdminAuthGate;
use vgx_core::{
    AdminError, AdminResult, RemoteConfig, ServerError, SubscriberGoal, SyncMode, split_address,
};
use vgx_remote::{Connector, RemoteNodeClient};

use crate::compensate::compensate;

/// Replication primitives of the engine this reconciler runs next to.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// URIs of the currently attached subscribers.
    async fn attached(&self) -> AdminResult<Vec<String>>;

    async fn detach_all(&self) -> AdminResult<()>;

    async fn attach(&self, uris: &[String]) -> AdminResult<()>;

    /// Push state to attached subscribers, a full copy when `hard`.
    async fn sync(&self, hard: bool) -> AdminResult<()>;

    /// Returns true when input was running and got suspended by this call.
    async fn suspend_tx_input(&self) -> AdminResult<bool>;

    async fn resume_tx_input(&self) -> AdminResult<()>;

    /// Digest of the local data.
    async fn fingerprint(&self) -> AdminResult<String>;

    /// Number of graphs in readonly mode.
    async fn count_readonly(&self) -> AdminResult<usize>;

    /// `host:adminport` of every attached subscriber.
    async fn subscriber_admin_addresses(&self) -> AdminResult<Vec<String>>;
}

/// One verified destination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlannedSubscriber {
    pub host: String,
    pub admin_port: u16,
    pub tx_port: u16,
    pub sync: bool,
}

impl PlannedSubscriber {
    pub fn uri(&self) -> String {
        format!("vgx://{}:{}", self.host, self.tx_port)
    }
}

/// Verified goal, sorted by `(host, admin_port)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalPlan {
    pub subscribers: Vec<PlannedSubscriber>,
}

impl GoalPlan {
    pub fn goal(&self) -> Vec<String> {
        self.subscribers.iter().map(PlannedSubscriber::uri).collect()
    }

    /// Destinations that need a full sync before joining.
    pub fn sync_subset(&self) -> Vec<String> {
        self.subscribers
            .iter()
            .filter(|s| s.sync)
            .map(PlannedSubscriber::uri)
            .collect()
    }
}

/// Moves the engine's subscriber set towards a goal.
pub struct SubscriberReconciler {
    engine: Arc<dyn LocalEngine>,
    connector: Arc<dyn Connector>,
    auth: Arc<AdminAuthGate>,
    remote: RemoteConfig,
}

impl SubscriberReconciler {
    pub fn new(
        engine: Arc<dyn LocalEngine>,
        connector: Arc<dyn Connector>,
        auth: Arc<AdminAuthGate>,
        remote: RemoteConfig,
    ) -> Self {
        Self {
            engine,
            connector,
            auth,
            remote,
        }
    }

    fn peer(&self, host: &str, port: u16) -> RemoteNodeClient {
        RemoteNodeClient::new(
            format!("{host}:{port}"),
            self.connector.transport(host, port),
            self.remote.clone(),
        )
    }

    /// Verify every destination and decide which ones need a sync.
    pub async fn compute_goal(&self, goal: &SubscriberGoal) -> AdminResult<GoalPlan> {
        let mut destinations = BTreeMap::new();
        for dest in &goal.destinations {
            let (host, port) = split_address(dest)?;
            let key = format!("{host}:{port}");
            if destinations.insert(key.clone(), (host, port)).is_some() {
                return Err(AdminError::invalid_usage(format!(
                    "duplicate destination specified: {key}"
                )));
            }
        }
        let mut destinations: Vec<(String, u16)> = destinations.into_values().collect();
        destinations.sort();

        let local_digest = self.engine.fingerprint().await?;
        let mut seen = BTreeSet::new();
        let mut plan = GoalPlan::default();
        for (host, admin_port) in destinations {
            let planned = self
                .subscriber_state(&host, admin_port, &local_digest, goal)
                .await?;
            let ip_key = (planned.0, planned.1.tx_port);
            if !seen.insert(ip_key.clone()) {
                return Err(AdminError::invalid_usage(format!(
                    "duplicate destination IP detected: {}:{} at {host}:{admin_port}",
                    ip_key.0, ip_key.1
                )));
            }
            plan.subscribers.push(planned.1);
        }
        plan.subscribers.sort();
        debug!(goal = ?plan.goal(), sync = ?plan.sync_subset(), "subscriber goal verified");
        Ok(plan)
    }

    /// Self-reported IP and the planned subscriber for one destination.
    async fn subscriber_state(
        &self,
        host: &str,
        admin_port: u16,
        local_digest: &str,
        goal: &SubscriberGoal,
    ) -> AdminResult<(String, PlannedSubscriber)> {
        let ping = self
            .peer(host, admin_port)
            .fetch("/vgx/ping")
            .await
            .map_err(|e| AdminError::Address(format!("{host}:{admin_port}/vgx/ping failed: {e}")))?;
        let Some(ip) = ping["host"]["ip"].as_str().map(str::to_string) else {
            return Err(AdminError::Address(format!(
                "{host}:{admin_port}/vgx/ping did not report an IP"
            )));
        };

        let peer = self.peer(&ip, admin_port);
        let peerstat = peer.fetch("/vgx/peerstat").await.map_err(|e| {
            AdminError::Server(ServerError::new(format!(
                "{ip}:{admin_port}/vgx/peerstat failed: {e}"
            )))
        })?;
        let tx_port = peerstat["port"].as_u64().unwrap_or(0);
        let has_provider = !peerstat["provider"].is_null();
        let tx_port = match u16::try_from(tx_port) {
            Ok(p) if p > 0 => p,
            _ => {
                return Err(AdminError::invalid_usage(format!(
                    "destination has no TX input service: {host}:{admin_port}"
                )));
            }
        };

        let control = goal.control;
        let sync = if control.nosync {
            false
        } else if control.repair || !has_provider {
            digest_differs(&peer, local_digest).await
        } else {
            false
        };
        if sync && !allows_sync(&peer).await {
            return Err(AdminError::incomplete(format!(
                "cannot sync to destination {host}:{admin_port}: service-out and retry"
            )));
        }

        Ok((
            ip,
            PlannedSubscriber {
                host: host.to_string(),
                admin_port,
                tx_port,
                sync,
            },
        ))
    }

    /// Apply `plan` under the admin gate held by `token`.
    pub async fn execute_update(&self, plan: &GoalPlan, token: &str) -> AdminResult<Value> {
        self.auth
            .gate()
            .exclusive(token, || async {
                let original = self.engine.attached().await?;
                let mut suspended_here = false;
                let outcome = async {
                    suspended_here = self.engine.suspend_tx_input().await?;
                    self.apply(plan, &original).await
                }
                .await;

                if outcome.is_err() && !same_set(&self.engine.attached().await.unwrap_or_default(), &original) {
                    compensate("restore original subscribers", || async {
                        self.engine.detach_all().await?;
                        self.engine.attach(&original).await
                    })
                    .await;
                }
                if suspended_here {
                    compensate("resume TX input", || self.engine.resume_tx_input()).await;
                }
                outcome
            })
            .await
    }

    async fn apply(&self, plan: &GoalPlan, original: &[String]) -> AdminResult<Value> {
        let goal = plan.goal();
        let sync = plan.sync_subset();
        if !sync.is_empty() {
            let readonly = self.engine.count_readonly().await?;
            if readonly != 0 {
                return Err(AdminError::invalid_usage(format!(
                    "cannot update subscribers while {readonly} graph(s) are readonly"
                )));
            }
            info!(destinations = ?sync, "syncing new subscribers");
            self.engine.detach_all().await?;
            self.engine.attach(&sync).await?;
            self.engine.sync(true).await?;
            self.engine.detach_all().await?;
        }
        if !same_set(&self.engine.attached().await?, &goal) {
            self.engine.detach_all().await?;
            self.engine.attach(&goal).await?;
        }

        let goal_set: BTreeSet<&String> = goal.iter().collect();
        let mut removed: Vec<&String> = original.iter().filter(|s| !goal_set.contains(s)).collect();
        removed.sort();
        removed.dedup();
        let mut added = sync;
        added.sort();
        let mut result = goal;
        result.sort();
        Ok(json!({
            "action": "attached",
            "added": added,
            "removed": removed,
            "result": result,
        }))
    }

    /// `ADMIN_UpdateSubscribers`: authorize, then plan and apply `goal`.
    pub async fn update_subscribers(&self, client: &str, token: &str, goal: &Value) -> AdminResult<Value> {
        self.auth.authorize(client, token, "UpdateSubscribers")?;
        let goal = SubscriberGoal::from_value(goal)?;
        self.auth
            .gate()
            .exclusive(token, || async {
                let plan = self.compute_goal(&goal).await?;
                self.execute_update(&plan, token).await
            })
            .await
    }

    /// `ADMIN_Sync`: bring current subscribers up to date. Repair
    /// re-plans the attached set with `repair` on and syncs whatever
    /// differs; hard and soft sync through the engine.
    pub async fn sync_subscribers(&self, client: &str, token: &str, mode: SyncMode) -> AdminResult<Value> {
        self.auth.authorize(client, token, "Sync")?;
        self.auth
            .gate()
            .exclusive(token, || async {
                let readonly = self.engine.count_readonly().await?;
                if readonly != 0 {
                    return Err(AdminError::invalid_usage(format!(
                        "cannot sync while {readonly} graph(s) are readonly"
                    )));
                }
                let suspended_here = self.engine.suspend_tx_input().await?;
                let outcome = match mode {
                    SyncMode::Repair => self.repair(token).await,
                    SyncMode::Hard => self.engine.sync(true).await,
                    SyncMode::Soft => self.engine.sync(false).await,
                };
                if suspended_here {
                    compensate("resume TX input", || self.engine.resume_tx_input()).await;
                }
                let status = match outcome {
                    Ok(()) => "complete".to_string(),
                    Err(e) => {
                        warn!(%mode, error = %e, "subscriber sync failed");
                        e.to_string()
                    }
                };
                Ok(json!({"action": "sync", "mode": mode.as_str(), "status": status}))
            })
            .await
    }

    async fn repair(&self, token: &str) -> AdminResult<()> {
        let mut goal = SubscriberGoal::new(
            self.engine.subscriber_admin_addresses().await?,
            Default::default(),
        );
        goal.control.repair = true;
        let plan = self.compute_goal(&goal).await?;
        self.execute_update(&plan, token).await.map(|_| ())
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Remote graphsum digest differs from ours. Unreadable means no sync.
async fn digest_differs(peer: &RemoteNodeClient, local_digest: &str) -> bool {
    match peer.fetch("/vgx/graphsum").await {
        Ok(data) => match data["graphsum"].get("digest") {
            Some(remote) => remote.as_str() != Some(local_digest),
            None => false,
        },
        Err(e) => {
            debug!(peer = %peer, error = %e, "graphsum unreadable, assuming in sync");
            false
        }
    }
}

/// A destination may be synced when it is out of service or empty.
async fn allows_sync(peer: &RemoteNodeClient) -> bool {
    let serving = match peer.fetch("/vgx/status").await {
        Ok(status) => status["request"]["serving"].as_i64().is_none_or(|n| n != 0),
        Err(_) => true,
    };
    if !serving {
        return true;
    }
    match peer.fetch("/vgx/graphsum").await {
        Ok(data) => {
            let sum = &data["graphsum"];
            let counts: Option<Vec<i64>> = ["order", "size", "properties", "vectors"]
                .iter()
                .map(|k| sum[*k].as_i64())
                .collect();
            counts.is_some_and(|c| c.iter().sum::<i64>() == 0)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(host: &str, tx_port: u16, sync: bool) -> PlannedSubscriber {
        PlannedSubscriber {
            host: host.into(),
            admin_port: 9001,
            tx_port,
            sync,
        }
    }

    #[test]
    fn plan_lists() {
        let plan = GoalPlan {
            subscribers: vec![planned("h1", 9100, true), planned("h2", 9100, false)],
        };
        assert_eq!(plan.goal(), vec!["vgx://h1:9100", "vgx://h2:9100"]);
        assert_eq!(plan.sync_subset(), vec!["vgx://h1:9100"]);
    }

    #[test]
    fn set_comparison_ignores_order() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert!(same_set(&a, &b));
        assert!(!same_set(&a, &b[..1]));
    }
}
