//! Rolling forward sync and reverse sync of a provider's subscribers.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{info, warn};

use vgx_core::{AdminError, AdminResult};
use vgx_instance::InstanceHandle;

use crate::compensate::compensate;
use crate::forcecopy::force_copy;

/// Health probe timeout when counting in-service subscribers.
const HEALTH_PROBE: Duration = Duration::from_millis(510);

/// Force copy the provider onto each subscriber in turn, taking one
/// subscriber out of service at a time.
///
/// Needs at least two healthy subscribers and none in readonly mode.
/// Returns the sync result of every subscriber keyed by instance id.
pub async fn rolling_forward_sync(provider: &InstanceHandle) -> AdminResult<Value> {
    let mut serving = BTreeSet::new();
    let mut readonly = Vec::new();
    for sub in provider.subscribers() {
        if sub.is_readonly().await? {
            readonly.push(sub.id().to_string());
        }
        if sub.health_check(HEALTH_PROBE).await {
            serving.insert(sub.id().to_string());
        }
    }
    if serving.len() < 2 {
        return Err(AdminError::invalid_usage(
            "Too few S-IN destinations for automatic rolling update",
        ));
    }
    if !readonly.is_empty() {
        return Err(AdminError::invalid_usage(format!(
            "Readonly destinations exist: {}",
            readonly.join(", ")
        )));
    }

    provider.wait_for_idle(None, None).await?;
    let stat = provider.nodestat().await?;
    let reattach = !stat.subscribers.is_empty();
    let resume_input = !stat.tx_in_halted;
    provider.pause_in().await?;
    provider.detach().await?;
    info!(
        provider = %provider.id(),
        order = stat.graph_order,
        size = stat.graph_size,
        subscribers = provider.subscribers().len(),
        "rolling forward sync"
    );

    let mut results = Map::new();
    for sub in provider.subscribers() {
        let pre_digest = sub.digest().await?;
        let pre_service_in = sub.is_service_in().await?;
        let step = async {
            sub.wait_for_idle(None, None).await?;
            sub.service_out().await?;
            let copied = force_copy(provider, sub).await?;
            let after = sub.nodestat().await?;
            if after.graph_order != stat.graph_order || after.graph_size != stat.graph_size {
                return Err(AdminError::incomplete(format!(
                    "{sub} has order {} size {} after copy, expected order {} size {}",
                    after.graph_order, after.graph_size, stat.graph_order, stat.graph_size
                )));
            }
            if serving.contains(sub.id()) {
                sub.service_in().await?;
                sleep(provider.sync_config().service_in_grace()).await;
            }
            Ok(copied)
        };
        match step.await {
            Ok(copied) => {
                results.insert(sub.id().to_string(), copied);
            }
            Err(e) => {
                if pre_service_in {
                    let unchanged = matches!(sub.digest().await, Ok(ref d) if *d == pre_digest);
                    if unchanged {
                        compensate(&format!("service in {}", sub.id()), || sub.service_in()).await;
                    } else {
                        warn!(instance = %sub.id(), "destination digest changed, unable to restore S-IN");
                    }
                }
                return Err(e);
            }
        }
    }

    if reattach {
        provider.attach(false, None).await?;
    }
    if resume_input {
        provider.resume_in().await?;
    }
    Ok(Value::Object(results))
}

/// Copy the most advanced subscriber's data back onto `node`.
pub async fn reverse_sync(node: &InstanceHandle) -> AdminResult<Value> {
    node.wait_for_idle(None, None).await?;
    let mut selected: Option<(&InstanceHandle, i64)> = None;
    for sub in node.subscribers() {
        let serial = sub.nodestat().await?.master_serial;
        if selected.is_none_or(|(_, best)| serial > best) {
            selected = Some((sub.as_ref(), serial));
        }
    }
    let Some((source, serial)) = selected else {
        return Err(AdminError::invalid_usage(format!(
            "{node} has no subscribers to reverse sync from"
        )));
    };
    info!(node = %node.id(), source = %source.id(), master_serial = serial, "reverse sync");
    force_copy(source, node).await
}
