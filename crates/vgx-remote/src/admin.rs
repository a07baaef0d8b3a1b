//! Authenticated admin requests.
//!
//! Every admin command is sent as `GET|POST /vgx/builtin/ADMIN_<command>`
//! with a freshly issued `authtoken` parameter. Tokens are short lived, so
//! a node answering "Expired" is retried at once with a new token.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info};

use vgx_core::{AdminError, AdminResult};

use crate::client::RemoteNodeClient;
use crate::transport::Request;

const TOKEN_PATH: &str = "/vgx/builtin/ADMIN_GetAuthToken";

impl RemoteNodeClient {
    /// Obtain a one-shot admin token from the node.
    pub async fn get_auth_token(&self) -> AdminResult<String> {
        let retry = self.config.retry.max(1);
        if !self.ping(retry).await {
            return Err(self.server_error("Unreachable".into(), Vec::new(), None));
        }
        let mut errors = Vec::new();
        let mut last = None;
        for attempt in 1..=retry {
            let request = Request::get(TOKEN_PATH)
                .accept_json()
                .timeout(self.config.token_timeout());
            match self.request(request).await {
                Ok(response) if response.is_ok() => {
                    if let Some(token) = response.json().and_then(|d| d["authtoken"].as_str()) {
                        return Ok(token.to_string());
                    }
                    errors.push("response without authtoken".to_string());
                    last = Some(response.into_value());
                }
                Ok(response) => {
                    errors.push(format!("HTTP {} {}", response.status, response.reason));
                    last = Some(response.into_value());
                }
                Err(e) => errors.push(e.to_string()),
            }
            if attempt < retry {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }
        Err(self.server_error("Failed to get authtoken".into(), errors, last))
    }

    /// Run `ADMIN_<command>` with a fresh token per attempt. `content`
    /// turns the request into a POST.
    pub async fn send_admin_request(
        &self,
        command: &str,
        params: &[(&str, String)],
        content: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> AdminResult<Value> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        info!(seq, node = %self.name, command, "admin request");

        let path = format!("/vgx/builtin/ADMIN_{command}");
        let timeout = timeout.unwrap_or_else(|| self.config.admin_timeout());
        let retry = self.config.retry.max(1);
        let mut errors = Vec::new();
        let mut last = None;
        for attempt in 1..=retry {
            let token = self.get_auth_token().await?;
            let mut request = Request::get(path.as_str())
                .param("authtoken", token)
                .params(params.iter().map(|(k, v)| (*k, v.clone())))
                .accept_json()
                .timeout(timeout);
            if let Some(content) = &content {
                request = request.body(content.clone());
            }
            match self.request(request).await {
                Ok(response) if response.is_ok() => return Ok(response.into_value()),
                Ok(response) => {
                    let expired = response.status == 500
                        && response.json().is_some_and(is_expired_token);
                    errors.push(format!("HTTP {} {}", response.status, response.reason));
                    last = Some(response.into_value());
                    if expired {
                        debug!(node = %self.name, command, "authtoken expired, retrying");
                        continue;
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
            if attempt < retry {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }
        Err(self.server_error(
            format!("Failed to send admin request {command}"),
            errors,
            last,
        ))
    }
}

/// `message.plugin` names a PermissionError whose value starts with "Expired".
fn is_expired_token(data: &Value) -> bool {
    let plugin = &data["message"]["plugin"];
    plugin["exception"]
        .as_str()
        .is_some_and(|e| e.contains("PermissionError"))
        && plugin["value"]
            .as_str()
            .is_some_and(|v| v.starts_with("Expired"))
}

/// Convenience for callers that treat any admin failure as fatal context.
pub fn describe(err: &AdminError) -> String {
    match err {
        AdminError::Server(server) if !server.errors.is_empty() => {
            format!("{} ({})", server.message, server.errors.join("; "))
        }
        other => other.to_string(),
    }
}
