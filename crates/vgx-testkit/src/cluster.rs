//! Fake cluster: node registry, transport and request routing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use vgx_auth::AdminAuthGate;
use vgx_core::{AdminConfig, AdminError, AdminResult, SyncMode, TopologyDescriptor};
use vgx_remote::{Connector, RawResponse, Request, Transport, TransportError, TransportResult};
use vgx_sync::SubscriberReconciler;

use crate::engine::FakeEngine;
use crate::node::{FakeData, FakeNode};

/// Client address every fake node sees.
pub const CLIENT_HOST: &str = "127.0.0.1";

const ADMIN_PREFIX: &str = "/vgx/builtin/ADMIN_";

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) nodes: BTreeMap<String, FakeNode>,
}

/// Shared handle to a set of fake nodes. Clones see the same nodes.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    pub(crate) state: Arc<Mutex<State>>,
    config: AdminConfig,
}

impl FakeCluster {
    /// One node per descriptor instance. Instances with a provider start
    /// bound to their `tport`; nothing is attached yet.
    pub fn from_descriptor(descriptor: &TopologyDescriptor, config: AdminConfig) -> Self {
        let stored = descriptor.to_value();
        let nodes = descriptor
            .instances()
            .enumerate()
            .map(|(n, instance)| {
                let bound = descriptor.provider(&instance.id).is_some() && instance.tport != 0;
                let ip = format!("10.0.0.{}", n + 1);
                (
                    instance.id.clone(),
                    FakeNode::from_instance(instance, ip, bound, stored.clone()),
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(State { nodes })),
            config,
        }
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    /// Mutate one node.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut FakeNode) -> R) -> R {
        let mut state = self.state.lock().expect("fake cluster lock");
        let node = state
            .nodes
            .get_mut(id)
            .unwrap_or_else(|| panic!("no fake node {id}"));
        f(node)
    }

    /// Snapshot of one node.
    pub fn node(&self, id: &str) -> FakeNode {
        self.update(id, |n| n.clone())
    }

    pub fn set_unreachable(&self, id: &str) {
        self.update(id, |n| n.reachable = false);
    }

    /// Answer the next `times` `ADMIN_<command>` requests with HTTP 500.
    pub fn fail_next(&self, id: &str, command: &str, times: u32) {
        self.update(id, |n| n.failures.insert(command.to_string(), times));
    }

    /// Make the next engine-level `op` on `id` fail.
    pub fn fail_engine(&self, id: &str, op: &str) {
        self.update(id, |n| n.engine_failures.insert(op.to_string(), 1));
    }

    /// Admin commands `id` has received.
    pub fn commands(&self, id: &str) -> Vec<String> {
        self.node(id).admin_log
    }

    pub fn engine(&self, id: &str) -> FakeEngine {
        FakeEngine::new(self.clone(), id)
    }

    /// Node-side reconciler of `id`, wired to its engine and gate.
    pub fn reconciler(&self, id: &str) -> SubscriberReconciler {
        let auth = self.update(id, |n| Arc::clone(&n.auth));
        SubscriberReconciler::new(
            Arc::new(self.engine(id)),
            Arc::new(self.clone()),
            auth,
            self.config.remote.clone(),
        )
    }

    /// Issue a token on `id` the way `ADMIN_GetAuthToken` does.
    pub fn issue_token(&self, id: &str) -> String {
        self.update(id, |n| n.auth.issue_token(CLIENT_HOST).token)
    }

    fn resolve(&self, host: &str, port: u16) -> Option<(String, bool)> {
        let state = self.state.lock().expect("fake cluster lock");
        state
            .nodes
            .values()
            .find(|n| n.answers(host, port))
            .map(|n| (n.id.clone(), n.reachable))
    }

    async fn handle(&self, host: &str, port: u16, request: &Request) -> TransportResult<RawResponse> {
        let Some((id, true)) = self.resolve(host, port) else {
            return Err(TransportError::Connect {
                address: format!("{host}:{port}"),
                message: "connection refused".into(),
            });
        };
        debug!(node = %id, path = %request.path, "fake request");
        let path = request.path.as_str();
        if let Some(command) = path.strip_prefix(ADMIN_PREFIX) {
            return Ok(self.admin(&id, command, request).await);
        }
        let response = match path {
            "/vgx/hc" => {
                let mut raw = if self.node(&id).healthy {
                    RawResponse::new(200, "VGX/3 fake")
                } else {
                    RawResponse::new(503, "unavailable")
                };
                raw.headers.insert("content-type".into(), "text/plain".into());
                return Ok(raw);
            }
            "/vgx/ping" => self.update(&id, |n| json!({"host": {"ip": n.ip, "name": n.host}})),
            "/vgx/nodestat" => self.update(&id, |n| n.nodestat()),
            "/vgx/status" => {
                self.update(&id, |n| json!({"request": {"serving": u8::from(n.service_in)}}))
            }
            "/vgx/graphsum" => self.update(&id, |n| n.data.graphsum()),
            "/vgx/peerstat" => self.peerstat(&id),
            "/vgx/storage" => self.update(&id, |n| json!({"sysroot": n.sysroot})),
            "/vgx/builtin/system_descriptor" => self.update(&id, |n| n.descriptor.clone()),
            _ => return Ok(RawResponse::new(404, "not found")),
        };
        Ok(envelope(response))
    }

    fn peerstat(&self, id: &str) -> Value {
        let state = self.state.lock().expect("fake cluster lock");
        let node = &state.nodes[id];
        let provider = node.tx_uri().and_then(|uri| {
            state
                .nodes
                .values()
                .find(|p| p.attached.contains(&uri))
                .map(FakeNode::admin_address)
        });
        let subscribers: Vec<Value> = node
            .attached
            .iter()
            .map(|uri| {
                let peer = state.nodes.values().find(|s| s.tx_uri().as_ref() == Some(uri));
                json!([uri, peer.map(|s| json!({"host": s.host, "adminport": s.admin_port}))])
            })
            .collect();
        json!({"port": node.txport, "provider": provider, "subscribers": subscribers})
    }

    async fn admin(&self, id: &str, command: &str, request: &Request) -> RawResponse {
        if command == "GetAuthToken" {
            let token = self.update(id, |n| n.auth.issue_token(CLIENT_HOST));
            return envelope(json!({
                "authtoken": token.token,
                "validity": token.valid_for.as_secs(),
            }));
        }
        let (failed, auth) = self.update(id, |n| {
            n.admin_log.push(command.to_string());
            (
                FakeNode::take_failure(&mut n.failures, command),
                Arc::clone(&n.auth),
            )
        });
        if failed {
            return error_response(&AdminError::Internal(format!("injected {command} failure")));
        }
        let token = request.param_value("authtoken").unwrap_or_default();
        let outcome = match command {
            "UpdateSubscribers" => {
                let goal = request
                    .body
                    .as_ref()
                    .and_then(|b| serde_json::from_slice::<Value>(b).ok())
                    .unwrap_or(Value::Null);
                self.reconciler(id)
                    .update_subscribers(CLIENT_HOST, token, &goal)
                    .await
            }
            "Sync" => match request.param_value("mode").unwrap_or("repair").parse::<SyncMode>() {
                Ok(mode) => self.reconciler(id).sync_subscribers(CLIENT_HOST, token, mode).await,
                Err(e) => Err(e),
            },
            "Shutdown" => self.shutdown(id, &auth, token, request),
            _ => auth
                .authorize(CLIENT_HOST, token, command)
                .and_then(|()| self.apply(id, command, request)),
        };
        match outcome {
            Ok(value) => envelope(value),
            Err(e) => error_response(&e),
        }
    }

    fn shutdown(&self, id: &str, auth: &AdminAuthGate, token: &str, request: &Request) -> AdminResult<Value> {
        let confirm = request.param_value("authshutdown").unwrap_or_default();
        auth.authorize_shutdown(CLIENT_HOST, token, confirm)?;
        let persist = request.param_value("persist") == Some("1");
        self.update(id, |n| n.reachable = false);
        Ok(json!({"action": "shutdown", "persist": persist}))
    }

    /// Local effect of a plain admin command.
    fn apply(&self, id: &str, command: &str, request: &Request) -> AdminResult<Value> {
        let param = |key: &str| request.param_value(key).unwrap_or_default().to_string();
        self.update(id, |n: &mut FakeNode| -> AdminResult<Value> {
            let action = match command {
                "Bind" => {
                    n.txport = param("port").parse().map_err(|_| {
                        AdminError::invalid_usage(format!("bad port '{}'", param("port")))
                    })?;
                    n.durable = param("durable") == "1";
                    "bind"
                }
                "Unbind" => {
                    n.txport = 0;
                    "unbind"
                }
                "Attach" => {
                    let uri = param("uri");
                    if !n.attached.contains(&uri) {
                        n.attached.push(uri);
                    }
                    "attached"
                }
                "DetachAll" => {
                    n.attached.clear();
                    "detached"
                }
                "SuspendTxInput" => {
                    n.tx_in_halted = true;
                    "suspended"
                }
                "ResumeTxInput" => {
                    n.tx_in_halted = false;
                    "resumed"
                }
                "Truncate" => {
                    n.data = FakeData::empty();
                    "truncated"
                }
                "ServiceIn" => {
                    n.service_in = true;
                    "service-in"
                }
                "ServiceOut" => {
                    n.service_in = false;
                    "service-out"
                }
                "SetReadonly" => {
                    n.readonly = true;
                    "readonly"
                }
                "ClearReadonly" => {
                    n.readonly = false;
                    "writable"
                }
                "CancelSync" => {
                    n.synchronizing = false;
                    "cancelsync"
                }
                "SystemDescriptor" => {
                    let body = request
                        .body
                        .as_ref()
                        .and_then(|b| serde_json::from_slice(b).ok())
                        .ok_or_else(|| AdminError::invalid_usage("descriptor body required"))?;
                    n.descriptor = body;
                    "descriptor"
                }
                _ => return Ok(json!({"action": command.to_lowercase()})),
            };
            Ok(json!({"action": action}))
        })
    }
}

impl Connector for FakeCluster {
    fn transport(&self, host: &str, port: u16) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            cluster: self.clone(),
            host: host.to_string(),
            port,
        })
    }
}

/// Transport bound to one `host:port` of a [`FakeCluster`].
#[derive(Debug)]
pub struct FakeTransport {
    cluster: FakeCluster,
    host: String,
    port: u16,
}

#[async_trait]
impl Transport for FakeTransport {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn exchange(&self, request: &Request, _fresh: bool) -> TransportResult<RawResponse> {
        self.cluster.handle(&self.host, self.port, request).await
    }
}

fn envelope(response: Value) -> RawResponse {
    RawResponse::json(200, &json!({"status": "OK", "response": response, "exec_ms": 0}))
}

/// Errors travel as HTTP 500 with the exception type and message.
fn error_response(err: &AdminError) -> RawResponse {
    let exception = match err {
        AdminError::Permission(_) => "PermissionError".to_string(),
        other => other.kind().to_string(),
    };
    let value = match err {
        AdminError::Permission(msg) => msg.clone(),
        other => other.to_string(),
    };
    RawResponse::json(
        500,
        &json!({"status": "ERROR", "message": {"plugin": {"exception": exception, "value": value}}}),
    )
}
