//! Domain types for the VGX system descriptor.
//!
//! Instances, dispatch rows and the resolved dispatcher configuration,
//! plus the small enums shared by the remote, instance and sync crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::AdminError;

/// Unique identifier of an instance in the descriptor.
pub type InstanceId = String;

/// Default dispatch row channel count.
pub const DISPATCH_DEFAULT_CHANNELS: i64 = 32;
/// Default dispatch row priority.
pub const DISPATCH_DEFAULT_PRIORITY: i64 = 2;
/// Upper bound for channels, priority, and their product.
pub const DISPATCH_MAX_COST: i64 = 127;

// ── Instance ───────────────────────────────────────────────────────

/// Role of an instance in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Admin,
    Builder,
    Txproxy,
    Search,
    Dispatch,
    Generic,
}

impl InstanceType {
    pub const ALL: [InstanceType; 6] = [
        InstanceType::Admin,
        InstanceType::Builder,
        InstanceType::Txproxy,
        InstanceType::Search,
        InstanceType::Dispatch,
        InstanceType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Admin => "admin",
            InstanceType::Builder => "builder",
            InstanceType::Txproxy => "txproxy",
            InstanceType::Search => "search",
            InstanceType::Dispatch => "dispatch",
            InstanceType::Generic => "generic",
        }
    }

    /// Capitalized name used in default descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            InstanceType::Admin => "Admin",
            InstanceType::Builder => "Builder",
            InstanceType::Txproxy => "Txproxy",
            InstanceType::Search => "Search",
            InstanceType::Dispatch => "Dispatch",
            InstanceType::Generic => "Generic",
        }
    }

    /// Engines hold graph data and may subscribe to a provider.
    pub fn is_engine(&self) -> bool {
        matches!(
            self,
            InstanceType::Builder | InstanceType::Txproxy | InstanceType::Search
        )
    }

    /// Only engines may set `attach`.
    pub fn is_attachable(&self) -> bool {
        self.is_engine()
    }

    /// Default for `s-in`: searchable instances start service-out.
    pub fn default_service_in(&self) -> bool {
        !matches!(self, InstanceType::Search | InstanceType::Txproxy)
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = InstanceType::ALL.iter().map(|t| t.as_str()).collect();
                format!("(must be one of {names:?})")
            })
    }
}

/// One validated cluster member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub id: InstanceId,
    #[serde(rename = "type")]
    pub itype: InstanceType,
    pub host: String,
    /// Base HTTP port.
    pub hport: u16,
    /// Transaction input port, 0 if none.
    pub tport: u16,
    pub durable: bool,
    /// Display group; builders with `group >= 0` are unique.
    pub group: f64,
    pub graphs: Vec<String>,
    #[serde(rename = "s-in")]
    pub service_in: bool,
    pub attach: bool,
    pub prefix: Option<String>,
    pub description: String,
    /// Derived sortable partition key, e.g. `3000.001`.
    pub partition: Option<String>,
}

impl Instance {
    /// Admin port, by convention `hport + 1`.
    pub fn aport(&self) -> u16 {
        self.hport.saturating_add(1)
    }

    /// `host:aport`, the address admin requests and subscriber goals use.
    pub fn admin_address(&self) -> String {
        format!("{}:{}", self.host, self.aport())
    }

    /// `vgx://host:tport`, the transaction input URI of this instance.
    pub fn tx_uri(&self) -> String {
        format!("vgx://{}:{}", self.host, self.tport)
    }

    /// Serialized form used when re-emitting the descriptor.
    pub fn to_descriptor_value(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("type".into(), json!(self.itype.as_str()));
        entry.insert("group".into(), json!(self.group));
        entry.insert("graph".into(), json!(self.graphs.join(" ")));
        entry.insert("host".into(), json!(self.host));
        entry.insert("hport".into(), json!(self.hport));
        entry.insert("tport".into(), json!(self.tport));
        entry.insert("durable".into(), json!(self.durable));
        entry.insert("s-in".into(), json!(self.service_in));
        entry.insert("attach".into(), json!(self.attach));
        if let Some(prefix) = &self.prefix {
            entry.insert("prefix".into(), json!(prefix));
        }
        entry.insert("description".into(), json!(self.description));
        Value::Object(entry)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.id, self.host, self.hport)
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Routing weight of one replica slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRow {
    pub channels: i64,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary: bool,
}

impl ReplicaRow {
    pub fn cost(&self) -> i64 {
        self.channels * self.priority
    }

    fn to_value(self) -> Value {
        let mut row = Map::new();
        row.insert("channels".into(), json!(self.channels));
        row.insert("priority".into(), json!(self.priority));
        if self.primary {
            row.insert("primary".into(), json!(true));
        }
        Value::Object(row)
    }
}

/// One row of a partition matrix: a replica slot spanning every partition.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixRow {
    pub row: ReplicaRow,
    /// Engine ids, column `p` serving partition `p`.
    pub partitions: Vec<InstanceId>,
    pub description: Option<String>,
}

impl MatrixRow {
    /// Empty partition list with negative priority: accept partial results.
    pub fn allow_incomplete(&self) -> bool {
        self.partitions.is_empty() && self.row.priority < 0
    }
}

/// Dispatcher routing config as written in the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchSpec {
    /// `{engine: row}`: every engine is a replica of one partition.
    ReplicaMap(Vec<(InstanceId, ReplicaRow)>),
    /// `[row, ...]`: replicas × partitions.
    PartitionMatrix(Vec<MatrixRow>),
}

impl DispatchSpec {
    /// Every instance id the dispatcher routes to.
    pub fn engines(&self) -> Vec<&str> {
        match self {
            DispatchSpec::ReplicaMap(rows) => rows.iter().map(|(id, _)| id.as_str()).collect(),
            DispatchSpec::PartitionMatrix(rows) => rows
                .iter()
                .flat_map(|r| r.partitions.iter().map(String::as_str))
                .collect(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DispatchSpec::ReplicaMap(rows) => {
                let map: Map<String, Value> = rows
                    .iter()
                    .map(|(id, row)| (id.clone(), row.to_value()))
                    .collect();
                Value::Object(map)
            }
            DispatchSpec::PartitionMatrix(rows) => Value::Array(
                rows.iter()
                    .map(|r| {
                        let mut v = r.row.to_value();
                        if let Value::Object(obj) = &mut v {
                            obj.insert("partitions".into(), json!(r.partitions));
                            if let Some(d) = &r.description {
                                obj.insert("description".into(), json!(d));
                            }
                        }
                        v
                    })
                    .collect(),
            ),
        }
    }
}

/// Address of an engine as seen by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAddress {
    pub host: String,
    pub port: u16,
}

/// Resolved dispatcher configuration: partitions × replica rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatcherConfig {
    pub allow_incomplete: bool,
    pub replicas: Vec<ReplicaRow>,
    /// `partitions[p]` lists the engines serving partition `p`, one per replica.
    pub partitions: Vec<Vec<EngineAddress>>,
}

impl DispatcherConfig {
    pub fn to_value(&self) -> Value {
        let mut options = Map::new();
        if self.allow_incomplete {
            options.insert("allow-incomplete".into(), json!(true));
        }
        json!({
            "options": options,
            "replicas": self.replicas.iter().map(|r| r.to_value()).collect::<Vec<_>>(),
            "partitions": self.partitions,
        })
    }
}

// ── Sync ───────────────────────────────────────────────────────────

/// Synchronization mode for a provider and its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Hard sync only the subscribers whose digest differs.
    #[default]
    Repair,
    /// Full data re-transfer.
    Hard,
    /// Catch up from existing replication state.
    Soft,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Repair => "repair",
            SyncMode::Hard => "hard",
            SyncMode::Soft => "soft",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repair" => Ok(SyncMode::Repair),
            "hard" => Ok(SyncMode::Hard),
            "soft" => Ok(SyncMode::Soft),
            other => Err(AdminError::invalid_usage(format!(
                "invalid sync mode '{other}', must be one of repair, hard, soft"
            ))),
        }
    }
}

/// Control flags of a subscriber update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GoalControl {
    /// Sync every destination whose digest differs, even if it has a provider.
    #[serde(default)]
    pub repair: bool,
    /// Never sync, only change the attached set.
    #[serde(default)]
    pub nosync: bool,
}

/// Desired subscriber set of a provider: `host:adminport` destinations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriberGoal {
    #[serde(default)]
    pub control: GoalControl,
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl SubscriberGoal {
    pub fn new(destinations: Vec<String>, control: GoalControl) -> Self {
        Self {
            control,
            destinations,
        }
    }

    /// Accepts `{"control": {...}, "destinations": [...]}` or a bare list.
    pub fn from_value(value: &Value) -> Result<Self, AdminError> {
        match value {
            Value::Array(_) => {
                let destinations: Vec<String> = serde_json::from_value(value.clone())
                    .map_err(|e| AdminError::invalid_usage(format!("invalid goal: {e}")))?;
                Ok(Self::new(destinations, GoalControl::default()))
            }
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| AdminError::invalid_usage(format!("invalid goal: {e}"))),
            other => Err(AdminError::invalid_usage(format!(
                "invalid goal, expected list or object: {other}"
            ))),
        }
    }
}

/// Split `host:port` into its parts.
pub fn split_address(address: &str) -> Result<(String, u16), AdminError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AdminError::Address(format!("invalid address '{address}', expected host:port")))?;
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| AdminError::Address(format!("invalid port in address '{address}'")))?;
    if host.trim().is_empty() {
        return Err(AdminError::Address(format!("missing host in address '{address}'")));
    }
    Ok((host.trim().to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_type_parse() {
        assert_eq!("search".parse::<InstanceType>().unwrap(), InstanceType::Search);
        assert!("searcher".parse::<InstanceType>().is_err());
        assert!(InstanceType::Builder.is_attachable());
        assert!(!InstanceType::Dispatch.is_attachable());
        assert!(!InstanceType::Search.default_service_in());
        assert!(InstanceType::Builder.default_service_in());
    }

    #[test]
    fn goal_from_bare_list() {
        let goal = SubscriberGoal::from_value(&json!(["h1:9001", "h2:9001"])).unwrap();
        assert_eq!(goal.destinations.len(), 2);
        assert!(!goal.control.repair);
    }

    #[test]
    fn goal_from_object() {
        let goal = SubscriberGoal::from_value(&json!({
            "control": {"nosync": true},
            "destinations": ["h1:9001"]
        }))
        .unwrap();
        assert!(goal.control.nosync);
        assert!(!goal.control.repair);
        assert!(SubscriberGoal::from_value(&json!("h1:9001")).is_err());
    }

    #[test]
    fn split_address_parses() {
        assert_eq!(split_address("h1:9001").unwrap(), ("h1".to_string(), 9001));
        assert!(split_address("h1").is_err());
        assert!(split_address(":9001").is_err());
        assert!(split_address("h1:port").is_err());
    }

    #[test]
    fn sync_mode_parse() {
        assert_eq!("soft".parse::<SyncMode>().unwrap(), SyncMode::Soft);
        assert!(matches!("warm".parse::<SyncMode>(), Err(AdminError::InvalidUsage(_))));
    }
}
