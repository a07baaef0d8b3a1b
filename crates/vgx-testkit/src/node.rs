//! State of one fake node.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};

use vgx_auth::AdminAuthGate;
use vgx_core::{AuthConfig, Instance};

/// Graph content summary, copied wholesale by a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeData {
    pub digest: String,
    pub order: i64,
    pub size: i64,
    pub properties: i64,
    pub vectors: i64,
}

impl FakeData {
    pub fn new(digest: impl Into<String>, order: i64, size: i64) -> Self {
        Self {
            digest: digest.into(),
            order,
            size,
            properties: order,
            vectors: 0,
        }
    }

    pub fn empty() -> Self {
        Self {
            digest: "0".repeat(32),
            order: 0,
            size: 0,
            properties: 0,
            vectors: 0,
        }
    }

    pub fn graphsum(&self) -> Value {
        json!({"graphsum": {
            "digest": self.digest,
            "order": self.order,
            "size": self.size,
            "properties": self.properties,
            "vectors": self.vectors,
        }})
    }
}

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub id: String,
    pub host: String,
    /// Address the node reports from `/vgx/ping`.
    pub ip: String,
    pub admin_port: u16,
    /// Configured transaction input port.
    pub tport: u16,
    pub data: FakeData,
    pub idle_ms: i64,
    /// Bound transaction input port, 0 when unbound.
    pub txport: u16,
    pub durable: bool,
    pub readonly: bool,
    pub service_in: bool,
    /// Attached subscriber URIs.
    pub attached: Vec<String>,
    pub master_serial: i64,
    pub synchronizing: bool,
    pub tx_in_halted: bool,
    pub sysroot: String,
    pub descriptor: Value,
    /// `/vgx/hc` answers 200.
    pub healthy: bool,
    /// Connections succeed at all.
    pub reachable: bool,
    /// A sync is accepted but never transfers data.
    pub stall_sync: bool,
    pub auth: Arc<AdminAuthGate>,
    /// Admin commands received, in order.
    pub admin_log: Vec<String>,
    /// Admin command → number of upcoming requests answered with HTTP 500.
    pub failures: BTreeMap<String, u32>,
    /// Engine operations that fail once, e.g. `sync`.
    pub engine_failures: BTreeMap<String, u32>,
}

impl FakeNode {
    pub fn from_instance(instance: &Instance, ip: String, bound: bool, descriptor: Value) -> Self {
        Self {
            id: instance.id.clone(),
            host: instance.host.clone(),
            ip,
            admin_port: instance.aport(),
            tport: instance.tport,
            data: FakeData::new("d0", 10, 20),
            idle_ms: 60_000,
            txport: if bound { instance.tport } else { 0 },
            durable: instance.durable,
            readonly: false,
            service_in: instance.service_in,
            attached: Vec::new(),
            master_serial: 0,
            synchronizing: false,
            tx_in_halted: false,
            sysroot: format!("/var/vgx/{}", instance.id),
            descriptor,
            healthy: true,
            reachable: true,
            stall_sync: false,
            auth: Arc::new(AdminAuthGate::new(&AuthConfig::default())),
            admin_log: Vec::new(),
            failures: BTreeMap::new(),
            engine_failures: BTreeMap::new(),
        }
    }

    /// `vgx://host:txport` while bound.
    pub fn tx_uri(&self) -> Option<String> {
        (self.txport != 0).then(|| format!("vgx://{}:{}", self.host, self.txport))
    }

    pub fn admin_address(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }

    pub fn answers(&self, host: &str, port: u16) -> bool {
        self.admin_port == port && (self.host == host || self.ip == host)
    }

    pub fn nodestat(&self) -> Value {
        json!({
            "digest": self.data.digest,
            "idle-ms": self.idle_ms,
            "txport": self.txport,
            "readonly": u8::from(self.readonly),
            "service-in": u8::from(self.service_in),
            "subscribers": self.attached,
            "master-serial": self.master_serial.to_string(),
            "synchronizing": u8::from(self.synchronizing),
            "graph-order": self.data.order,
            "graph-size": self.data.size,
            "tx-in-halted": self.tx_in_halted,
        })
    }

    /// Counts down an injected failure for `key`; true when it fires.
    pub(crate) fn take_failure(map: &mut BTreeMap<String, u32>, key: &str) -> bool {
        match map.get_mut(key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}
