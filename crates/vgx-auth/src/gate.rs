//! Admin gate: at most one admin-mutating operation in flight per node.
//!
//! The holder is identified by its token. Nested operations carrying the
//! same token re-enter and bump a depth counter; the gate opens again when
//! the outermost one ends.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use vgx_core::{AdminError, AdminResult, AuthConfig};

#[derive(Debug, Default)]
struct GateState {
    holder: Option<String>,
    depth: u32,
}

#[derive(Debug)]
pub struct AdminGate {
    state: Mutex<GateState>,
    begin_timeout: Duration,
    end_timeout: Duration,
}

impl AdminGate {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            begin_timeout: config.begin_timeout(),
            end_timeout: config.end_timeout(),
        }
    }

    pub async fn begin(&self, token: &str) -> AdminResult<()> {
        let mut state = tokio::time::timeout(self.begin_timeout, self.state.lock())
            .await
            .map_err(|_| AdminError::Internal("internal admin error (admin deadlock)".into()))?;
        if state.holder.is_none() {
            state.holder = Some(token.to_string());
            state.depth = 0;
        } else if state.holder.as_deref() != Some(token) {
            return Err(AdminError::Busy(
                "Another admin operation is currently in progress".into(),
            ));
        }
        state.depth += 1;
        debug!(depth = state.depth, "admin gate entered");
        Ok(())
    }

    pub async fn end(&self, token: &str) -> AdminResult<()> {
        let mut state = tokio::time::timeout(self.end_timeout, self.state.lock())
            .await
            .map_err(|_| AdminError::Internal("internal admin error (admin deadlock)".into()))?;
        if state.holder.as_deref() == Some(token) {
            state.depth = state.depth.saturating_sub(1);
        }
        if state.depth < 1 {
            state.holder = None;
        }
        Ok(())
    }

    /// Run `op` inside the gate. The gate is released whether or not `op`
    /// succeeds.
    pub async fn exclusive<F, Fut, T>(&self, token: &str, op: F) -> AdminResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AdminResult<T>>,
    {
        self.begin(token).await?;
        let result = op().await;
        if let Err(e) = self.end(token).await {
            warn!(error = %e, "failed to release admin gate");
        }
        result
    }

    /// Token currently holding the gate.
    pub async fn holder(&self) -> Option<String> {
        self.state.lock().await.holder.clone()
    }
}
