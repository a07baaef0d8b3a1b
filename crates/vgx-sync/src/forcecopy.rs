//! Full copy of one instance's data onto another.

use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use vgx_core::{AdminError, AdminResult, SyncMode};
use vgx_instance::{InstanceHandle, truthy};

use crate::compensate::compensate;

/// Replace `destination`'s data with a copy of `source`'s.
///
/// The destination is temporarily bound (non-durable) so the source can
/// stream into it, truncated, and then soft-synced from the source until
/// both digests match. A destination that was unbound before is unbound
/// again afterwards.
pub async fn force_copy(source: &InstanceHandle, destination: &InstanceHandle) -> AdminResult<Value> {
    let settle = source.sync_config().settle();
    info!(source = %source.id(), destination = %destination.id(), "force copy");

    InstanceHandle::expect_action(&source.detach().await?, "detached")?;
    InstanceHandle::expect_action(&destination.detach().await?, "detached")?;

    let was_bound = destination.nodestat().await?.is_bound();
    if was_bound {
        InstanceHandle::expect_action(&destination.unbind().await?, "unbind")?;
        sleep(settle).await;
    }

    let outcome = copy(source, destination).await;

    if !was_bound {
        compensate(&format!("unbind {}", destination.id()), || async {
            InstanceHandle::expect_action(&destination.unbind().await?, "unbind")
        })
        .await;
    }
    outcome
}

async fn copy(source: &InstanceHandle, destination: &InstanceHandle) -> AdminResult<Value> {
    let settle = source.sync_config().settle();

    InstanceHandle::expect_action(&destination.bind(Some(false)).await?, "bind")?;
    let dest = destination.instance();
    let uri = format!("vgx://{}:{}", dest.host, dest.tport);
    InstanceHandle::expect_action(&source.attach_uri(&uri).await?, "attached")?;

    sleep(settle).await;
    destination.pause_in().await?;
    sleep(settle).await;
    destination.truncate().await?;
    destination.resume_in().await?;
    sleep(settle).await;

    let synced = source.sync(SyncMode::Soft).await?;
    InstanceHandle::expect_action(&synced, "sync")?;

    if let Err(e) = await_digests(source, destination).await {
        warn!(source = %source.id(), destination = %destination.id(), error = %e, "force copy");
    }

    InstanceHandle::expect_action(&source.detach().await?, "detached")?;
    if destination.digest().await? != source.digest().await? {
        return Err(AdminError::incomplete(
            "digest mismatch after force copy sync attempt",
        ));
    }
    info!(source = %source.id(), destination = %destination.id(), "force copy complete");
    Ok(synced)
}

/// Poll until the digests match, watching the source's `synchronizing`
/// flag to tell a stalled copy from a slow one.
async fn await_digests(source: &InstanceHandle, destination: &InstanceHandle) -> AdminResult<()> {
    let config = source.sync_config();
    let start_deadline = Instant::now() + config.sync_start_deadline();
    let mut completion_deadline = None;
    let mut started = false;
    let mut attempts = config.status_failures;

    while destination.digest().await? != source.digest().await? {
        sleep(config.copy_poll()).await;
        match source.nodestat_key("synchronizing").await {
            Ok(flag) if truthy(&flag) => {
                started = true;
                attempts = config.status_failures;
            }
            Ok(_) => {
                if started && completion_deadline.is_none() {
                    completion_deadline = Some(Instant::now() + config.sync_completion_deadline());
                }
            }
            Err(e) => {
                debug!(source = %source.id(), error = %e, "sync status check failed");
                if started {
                    if attempts < 1 {
                        return Err(AdminError::incomplete("force copy status unknown"));
                    }
                    attempts -= 1;
                }
            }
        }
        if !started && Instant::now() > start_deadline {
            if attempts < 1 {
                return Err(AdminError::incomplete("unable to start force copy sync"));
            }
            attempts -= 1;
        }
        if completion_deadline.is_some_and(|deadline| Instant::now() > deadline) {
            return Err(AdminError::incomplete(
                "force copy sync is incomplete / inconsistent",
            ));
        }
    }
    Ok(())
}
