//! Best-effort undo steps.

use std::future::Future;

use tracing::{info, warn};

use vgx_core::AdminResult;

/// Run a compensating action. Failures are logged and swallowed, the
/// return value tells whether it succeeded.
pub async fn compensate<F, Fut, T>(what: &str, action: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AdminResult<T>>,
{
    match action().await {
        Ok(_) => {
            info!(action = what, "compensating action applied");
            true
        }
        Err(e) => {
            warn!(action = what, kind = e.kind(), error = %e, "compensating action failed");
            false
        }
    }
}
