//! Run one operation on many instances concurrently.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use vgx_core::{AdminResult, InstanceId};

use crate::handle::InstanceHandle;

/// Per-instance outcomes, sorted by instance id.
pub type FanOutResult<T> = Vec<(InstanceId, AdminResult<T>)>;

/// Spawn `op` for every handle and collect all outcomes. One failing
/// instance never cancels the others; failures are logged and returned.
pub async fn fan_out<F, Fut, T>(handles: &[Arc<InstanceHandle>], op: F) -> FanOutResult<T>
where
    F: Fn(Arc<InstanceHandle>) -> Fut,
    Fut: Future<Output = AdminResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut tasks = JoinSet::new();
    for handle in handles {
        let id = handle.id().to_string();
        let fut = op(Arc::clone(handle));
        tasks.spawn(async move { (id, fut.await) });
    }

    let mut results = Vec::with_capacity(handles.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, result)) => {
                if let Err(e) = &result {
                    warn!(instance = %id, kind = e.kind(), error = %e, "operation failed");
                }
                results.push((id, result));
            }
            Err(e) => warn!(error = %e, "instance task aborted"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
