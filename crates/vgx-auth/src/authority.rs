//! Token validation plus the admin gate, as used by request handlers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use vgx_core::{AdminError, AdminResult, AuthConfig};

use crate::gate::AdminGate;
use crate::token::{AuthToken, TokenStore};

#[derive(Debug)]
pub struct AdminAuthGate {
    tokens: TokenStore,
    gate: AdminGate,
    disabled: AtomicBool,
}

impl AdminAuthGate {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: TokenStore::new(config),
            gate: AdminGate::new(config),
            disabled: AtomicBool::new(config.disabled),
        }
    }

    pub fn issue_token(&self, client_host: &str) -> AuthToken {
        self.tokens.issue(client_host)
    }

    /// Turn token checks off (or back on). The gate still applies.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn gate(&self) -> &AdminGate {
        &self.gate
    }

    /// Consume `token` for `client_host` and log the operation.
    pub fn authorize(&self, client_host: &str, token: &str, op: &str) -> AdminResult<()> {
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.tokens.consume(client_host, token)?;
        info!(op, origin = client_host, "admin operation");
        Ok(())
    }

    /// Shutdown needs a second token: `authshutdown` must be the token the
    /// client held before the one it is presenting.
    pub fn authorize_shutdown(
        &self,
        client_host: &str,
        token: &str,
        authshutdown: &str,
    ) -> AdminResult<()> {
        if self.tokens.previous().as_deref() != Some(authshutdown) {
            return Err(AdminError::Permission("Invalid token".into()));
        }
        self.authorize(client_host, token, "Shutdown")
    }

    /// Authorize, then run `op` holding the gate under `token`.
    pub async fn execute<F, Fut, T>(
        &self,
        client_host: &str,
        token: &str,
        name: &str,
        op: F,
    ) -> AdminResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AdminResult<T>>,
    {
        self.authorize(client_host, token, name)?;
        self.gate.exclusive(token, op).await
    }
}
