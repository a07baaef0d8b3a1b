//! RemoteNodeClient — retrying request loop, endpoint reads and probes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use vgx_core::{AdminError, AdminResult, RemoteConfig, ServerError};

use crate::error::TransportResult;
use crate::transport::{Body, MIN_EXECUTOR_HEADER, Request, Response, Transport};

/// Client bound to one node address.
pub struct RemoteNodeClient {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: RemoteConfig,
    cache: Mutex<HashMap<String, Value>>,
    pub(crate) sequence: AtomicU64,
}

impl RemoteNodeClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, config: RemoteConfig) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            transport,
            config,
            cache: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// A request template with the default timeout.
    pub fn get(&self, path: &str) -> Request {
        Request::get(path).timeout(self.config.request_timeout())
    }

    /// Send one request. Connection state errors and timeouts reopen the
    /// connection and retry, each retry with a longer timeout and pause;
    /// other errors propagate at once.
    pub async fn request(&self, mut request: Request) -> TransportResult<Response> {
        let mut attempts = self.config.connect_attempts.max(1);
        let mut pause = Duration::ZERO;
        let mut fresh = false;
        loop {
            if request.auto_executor {
                request.set_header(MIN_EXECUTOR_HEADER, attempts.to_string());
            }
            match self.transport.exchange(&request, fresh).await {
                Ok(raw) => return Response::from_raw(raw),
                Err(e) if e.is_retryable() && attempts > 1 => {
                    attempts -= 1;
                    request.timeout += Duration::from_millis(self.config.connect_timeout_step_ms);
                    pause += Duration::from_millis(self.config.connect_pause_step_ms);
                    fresh = true;
                    debug!(node = %self.name, error = %e, attempts, "reconnecting");
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single GET expecting status 200 and a JSON body.
    pub async fn fetch(&self, path: &str) -> AdminResult<Value> {
        let response = self.request(self.get(path).accept_json()).await?;
        if !response.is_ok() {
            let mut err = ServerError::new(format!(
                "{path} returned {} {}: {self}",
                response.status, response.reason
            ));
            err.last_response = Some(response.into_value());
            return Err(err.into());
        }
        Ok(response.into_value())
    }

    /// Read a JSON endpoint with retries, optionally cached per path.
    /// `key` selects a nested field; a missing field yields `null`.
    pub async fn endpoint(&self, path: &str, key: &[&str], cache: bool) -> AdminResult<Value> {
        self.endpoint_with(path, &[], key, cache).await
    }

    pub async fn endpoint_with(
        &self,
        path: &str,
        params: &[(&str, String)],
        key: &[&str],
        cache: bool,
    ) -> AdminResult<Value> {
        if cache {
            if let Some(data) = self.cache.lock().expect("endpoint cache lock").get(path) {
                return Ok(lookup_key(data, key));
            }
        }
        let mut errors = Vec::new();
        let mut last = None;
        for attempt in 1..=self.config.retry.max(1) {
            let request = Request::get(path)
                .params(params.iter().map(|(k, v)| (*k, v.clone())))
                .accept_json()
                .timeout(self.config.endpoint_timeout());
            match self.request(request).await {
                Ok(response) if response.is_ok() => {
                    let data = response.into_value();
                    let mut cached = self.cache.lock().expect("endpoint cache lock");
                    if cache {
                        cached.insert(path.to_string(), data.clone());
                    } else {
                        cached.remove(path);
                    }
                    return Ok(lookup_key(&data, key));
                }
                Ok(response) => {
                    errors.push(format!("HTTP {} {}", response.status, response.reason));
                    last = Some(response.into_value());
                }
                Err(e) => errors.push(e.to_string()),
            }
            if attempt < self.config.retry {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }
        Err(self.server_error(format!("endpoint request {path} failed"), errors, last))
    }

    pub fn clear_endpoint_cache(&self) {
        self.cache.lock().expect("endpoint cache lock").clear();
    }

    /// `GET /vgx/hc`: status 200 and a `VGX/3` banner.
    pub async fn health_check(&self, timeout: Duration) -> bool {
        let request = Request::get("/vgx/hc").without_executor().timeout(timeout);
        match self.request(request).await {
            Ok(response) if response.is_ok() => match &response.body {
                Body::Raw(bytes) => bytes.starts_with(b"VGX/3"),
                Body::Json(Value::String(s)) => s.starts_with("VGX/3"),
                Body::Json(_) => false,
            },
            Ok(response) => {
                debug!(node = %self.name, status = response.status, "health check failed");
                false
            }
            Err(e) => {
                debug!(node = %self.name, error = %e, "health check failed");
                false
            }
        }
    }

    /// `GET /vgx/ping`: status 200 and a `host` object.
    pub async fn ping(&self, retry: u32) -> bool {
        for attempt in 1..=retry.max(1) {
            let request = Request::get("/vgx/ping")
                .accept_json()
                .timeout(self.config.probe_timeout());
            match self.request(request).await {
                Ok(response) if response.is_ok() => {
                    if response.json().is_some_and(|d| d["host"].is_object()) {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(node = %self.name, error = %e, "ping failed"),
            }
            if attempt < retry {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }
        warn!(node = %self.name, address = %self.address(), "node unreachable");
        false
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub(crate) fn server_error(
        &self,
        message: String,
        errors: Vec<String>,
        last_response: Option<Value>,
    ) -> AdminError {
        AdminError::Server(ServerError {
            message: format!("{message}: {self}"),
            errors,
            last_response,
        })
    }
}

impl fmt::Display for RemoteNodeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{} - {}", self.name, self.address())
        } else {
            write!(f, "{} {} - {}", self.name, self.description, self.address())
        }
    }
}

impl fmt::Debug for RemoteNodeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNodeClient")
            .field("name", &self.name)
            .field("address", &self.address())
            .finish()
    }
}

/// Follow `key` into nested objects; `null` when a level is missing.
pub fn lookup_key(data: &Value, key: &[&str]) -> Value {
    let mut current = data;
    for k in key {
        match current.get(*k) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::TransportError;
    use crate::transport::RawResponse;

    /// Transport replaying scripted outcomes and recording requests.
    #[derive(Debug, Default)]
    pub(crate) struct Scripted {
        outcomes: Mutex<VecDeque<TransportResult<RawResponse>>>,
        pub(crate) seen: Mutex<Vec<(Request, bool)>>,
    }

    impl Scripted {
        pub(crate) fn new(outcomes: Vec<TransportResult<RawResponse>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn requests(&self) -> Vec<(Request, bool)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        fn host(&self) -> &str {
            "node"
        }

        fn port(&self) -> u16 {
            9001
        }

        async fn exchange(&self, request: &Request, fresh: bool) -> TransportResult<RawResponse> {
            self.seen.lock().unwrap().push((request.clone(), fresh));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Http("script exhausted".into())))
        }
    }

    pub(crate) fn fast_config() -> RemoteConfig {
        RemoteConfig {
            retry_backoff_ms: 1,
            connect_pause_step_ms: 1,
            ..RemoteConfig::default()
        }
    }

    pub(crate) fn client(script: &Arc<Scripted>) -> RemoteNodeClient {
        RemoteNodeClient::new("S1", script.clone(), fast_config())
    }

    fn not_connected() -> TransportResult<RawResponse> {
        Err(TransportError::NotConnected("closed".into()))
    }

    #[tokio::test]
    async fn reconnects_on_connection_state_errors() {
        let script = Scripted::new(vec![
            not_connected(),
            not_connected(),
            Ok(RawResponse::json(200, &json!({"response": {"ok": true}}))),
        ]);
        let resp = client(&script).request(Request::get("/vgx/nodestat")).await.unwrap();
        assert_eq!(resp.json(), Some(&json!({"ok": true})));

        let seen = script.requests();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].1);
        assert!(seen[1].1 && seen[2].1);
        assert_eq!(seen[0].0.header_value(MIN_EXECUTOR_HEADER), Some("3"));
        assert_eq!(seen[2].0.header_value(MIN_EXECUTOR_HEADER), Some("1"));
        assert_eq!(seen[2].0.timeout, Duration::from_millis(4_500));
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let script = Scripted::new(vec![not_connected(), not_connected(), not_connected()]);
        let err = client(&script).request(Request::get("/x")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
        assert_eq!(script.requests().len(), 3);
    }

    #[tokio::test]
    async fn other_errors_propagate_immediately() {
        let script = Scripted::new(vec![Err(TransportError::Http("reset".into()))]);
        assert!(client(&script).request(Request::get("/x")).await.is_err());
        assert_eq!(script.requests().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_caches_and_selects_keys() {
        let script = Scripted::new(vec![Ok(RawResponse::json(
            200,
            &json!({"response": {"request": {"serving": 0}}}),
        ))]);
        let c = client(&script);
        let serving = c.endpoint("/vgx/status", &["request", "serving"], true).await.unwrap();
        assert_eq!(serving, json!(0));
        // served from cache, the script is exhausted
        let again = c.endpoint("/vgx/status", &["request"], true).await.unwrap();
        assert_eq!(again, json!({"serving": 0}));
        assert_eq!(script.requests().len(), 1);
        assert_eq!(c.endpoint("/vgx/status", &["missing"], true).await.unwrap(), Value::Null);

        c.clear_endpoint_cache();
        assert!(matches!(
            c.endpoint("/vgx/status", &[], true).await,
            Err(AdminError::Server(_))
        ));
    }

    #[tokio::test]
    async fn endpoint_collects_errors() {
        let script = Scripted::new(vec![
            Ok(RawResponse::new(503, "busy")),
            Err(TransportError::Http("reset".into())),
            Ok(RawResponse::new(503, "still busy")),
        ]);
        match client(&script).endpoint("/vgx/status", &[], false).await {
            Err(AdminError::Server(err)) => {
                assert_eq!(err.errors.len(), 3);
                assert_eq!(err.last_response, Some(json!("still busy")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_check_needs_banner() {
        let script = Scripted::new(vec![
            Ok(RawResponse::new(200, "VGX/3.6 ok")),
            Ok(RawResponse::new(200, "nginx")),
            Ok(RawResponse::new(503, "VGX/3.6")),
        ]);
        let c = client(&script);
        assert!(c.health_check(Duration::from_secs(1)).await);
        assert!(!c.health_check(Duration::from_secs(1)).await);
        assert!(!c.health_check(Duration::from_secs(1)).await);
        assert!(script.requests()[0].0.header_value(MIN_EXECUTOR_HEADER).is_none());
    }

    #[tokio::test]
    async fn ping_needs_host_object() {
        let script = Scripted::new(vec![
            Ok(RawResponse::json(200, &json!({"response": {"host": "x"}}))),
            Ok(RawResponse::json(200, &json!({"response": {"host": {"ip": "10.0.0.1"}}}))),
        ]);
        assert!(client(&script).ping(2).await);
        assert_eq!(script.requests().len(), 2);
    }

    #[test]
    fn lookup_nested() {
        let data = json!({"a": {"b": 1}});
        assert_eq!(lookup_key(&data, &["a", "b"]), json!(1));
        assert_eq!(lookup_key(&data, &["a", "c"]), Value::Null);
        assert_eq!(lookup_key(&data, &[]), data);
    }
}
