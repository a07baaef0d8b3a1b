//! vgxadmin.toml configuration — timeouts, retries and protocol deadlines.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level admin configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
}

impl AdminConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AdminConfig = toml::from_str(content)?;
        Ok(config)
    }
}

/// Transport and admin request settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Default timeout of a single request.
    pub request_timeout_ms: u64,
    /// Timeout of `/vgx/hc` and `/vgx/ping`.
    pub probe_timeout_ms: u64,
    /// Timeout of admin requests.
    pub admin_timeout_ms: u64,
    /// Timeout of long admin requests and endpoint reads.
    pub endpoint_timeout_ms: u64,
    /// Timeout of `ADMIN_GetAuthToken`.
    pub token_timeout_ms: u64,
    /// Attempts for endpoint reads, token fetches and admin requests.
    pub retry: u32,
    /// Pause between failed attempts.
    pub retry_backoff_ms: u64,
    /// Attempts at the connection level.
    pub connect_attempts: u32,
    /// Added to the timeout on every connection level retry.
    pub connect_timeout_step_ms: u64,
    /// Added to the pause on every connection level retry.
    pub connect_pause_step_ms: u64,
    /// Pooled connections kept before the oldest are evicted.
    pub pool_capacity: usize,
    /// Connections evicted at once when over capacity.
    pub pool_evict: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 4_000,
            probe_timeout_ms: 1_000,
            admin_timeout_ms: 10_000,
            endpoint_timeout_ms: 90_000,
            token_timeout_ms: 10_000,
            retry: 3,
            retry_backoff_ms: 500,
            connect_attempts: 3,
            connect_timeout_step_ms: 250,
            connect_pause_step_ms: 100,
            pool_capacity: 64,
            pool_evict: 16,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoint_timeout_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Deadlines and poll intervals of node operations and sync protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long `wait_for_idle` waits.
    pub idle_timeout_ms: u64,
    /// Node idle time that counts as idle.
    pub idle_after_ms: u64,
    pub idle_poll_ms: u64,
    /// How long `bind` waits for the TX port to open.
    pub bind_deadline_ms: u64,
    /// Pause between destination pause/truncate/resume steps.
    pub settle_ms: u64,
    /// Digest poll interval during force copy.
    pub copy_poll_ms: u64,
    pub sync_start_deadline_ms: u64,
    pub sync_completion_deadline_ms: u64,
    /// Consecutive status check failures tolerated while copying.
    pub status_failures: u32,
    /// Sleep after putting a subscriber back in service.
    pub service_in_grace_ms: u64,
    /// Poll interval while an op dump is synchronizing.
    pub opdump_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            idle_after_ms: 5_000,
            idle_poll_ms: 1_000,
            bind_deadline_ms: 15_000,
            settle_ms: 1_000,
            copy_poll_ms: 3_000,
            sync_start_deadline_ms: 60_000,
            sync_completion_deadline_ms: 60_000,
            status_failures: 3,
            service_in_grace_ms: 5_000,
            opdump_poll_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn bind_deadline(&self) -> Duration {
        Duration::from_millis(self.bind_deadline_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn copy_poll(&self) -> Duration {
        Duration::from_millis(self.copy_poll_ms)
    }

    pub fn sync_start_deadline(&self) -> Duration {
        Duration::from_millis(self.sync_start_deadline_ms)
    }

    pub fn sync_completion_deadline(&self) -> Duration {
        Duration::from_millis(self.sync_completion_deadline_ms)
    }

    pub fn service_in_grace(&self) -> Duration {
        Duration::from_millis(self.service_in_grace_ms)
    }

    pub fn opdump_poll(&self) -> Duration {
        Duration::from_millis(self.opdump_poll_ms)
    }
}

/// Token issuance and admin gate settings, used on the node side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_validity_secs: u64,
    /// Seeds remembered for token chaining.
    pub seed_history: usize,
    pub begin_timeout_ms: u64,
    pub end_timeout_ms: u64,
    /// Accept every admin request without a token.
    pub disabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_validity_secs: 300,
            seed_history: 5,
            begin_timeout_ms: 1_000,
            end_timeout_ms: 10_000,
            disabled: false,
        }
    }
}

impl AuthConfig {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    pub fn begin_timeout(&self) -> Duration {
        Duration::from_millis(self.begin_timeout_ms)
    }

    pub fn end_timeout(&self) -> Duration {
        Duration::from_millis(self.end_timeout_ms)
    }
}
