//! TopologyDescriptor — the validated, immutable model of a VGX cluster.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{AdminError, AdminResult, ConfigError};
use crate::types::{DispatchSpec, DispatcherConfig, EngineAddress, Instance, InstanceId};
use crate::validate::{ValidatedTopology, validate};

/// One node of the transaction replication forest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionNode {
    pub id: InstanceId,
    pub subscribers: Vec<TransactionNode>,
}

impl TransactionNode {
    fn to_value(&self) -> Value {
        let children: Map<String, Value> = self
            .subscribers
            .iter()
            .map(|s| (s.id.clone(), s.to_value()))
            .collect();
        Value::Object(children)
    }

    fn find(&self, id: &str) -> Option<&TransactionNode> {
        if self.id == id {
            return Some(self);
        }
        self.subscribers.iter().find_map(|s| s.find(id))
    }

    fn provider_of(&self, id: &str) -> Option<&str> {
        if self.subscribers.iter().any(|s| s.id == id) {
            return Some(&self.id);
        }
        self.subscribers.iter().find_map(|s| s.provider_of(id))
    }
}

/// Validated cluster topology.
///
/// Built once from a JSON document; every instance carries its derived
/// partition and every dispatcher its resolved [`DispatcherConfig`].
#[derive(Debug, Clone)]
pub struct TopologyDescriptor {
    name: String,
    graphs: Vec<String>,
    instances: BTreeMap<InstanceId, Instance>,
    transaction: Vec<TransactionNode>,
    dispatch: BTreeMap<InstanceId, DispatchSpec>,
    dispatchers: BTreeMap<InstanceId, DispatcherConfig>,
    /// Admin address the descriptor was fetched from, resolves `.`.
    origin: Option<(String, u16)>,
}

impl TopologyDescriptor {
    /// Validate a raw descriptor document.
    pub fn from_value(raw: Value) -> Result<Self, ConfigError> {
        let ValidatedTopology {
            name,
            graphs,
            instances,
            transaction,
            dispatch,
        } = validate(raw)?;

        let dispatchers = dispatch
            .iter()
            .map(|(id, spec)| (id.clone(), resolve_dispatcher(spec, &instances)))
            .collect();

        debug!(
            system = %name,
            instances = instances.len(),
            dispatchers = dispatch.len(),
            "system descriptor validated"
        );

        Ok(Self {
            name,
            graphs,
            instances,
            transaction,
            dispatch,
            dispatchers,
            origin: None,
        })
    }

    pub fn from_json_str(text: &str) -> AdminResult<Self> {
        let raw: Value = serde_json::from_str(text).map_err(|e| {
            ConfigError::new("descriptor", &Value::Null, format!("(invalid JSON: {e})"))
        })?;
        Ok(Self::from_value(raw)?)
    }

    pub fn from_file(path: &Path) -> AdminResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdminError::invalid_usage(format!("cannot read descriptor {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Remember the admin address this descriptor was obtained from.
    pub fn with_origin(mut self, host: impl Into<String>, admin_port: u16) -> Self {
        self.origin = Some((host.into(), admin_port));
        self
    }

    pub fn origin(&self) -> Option<(&str, u16)> {
        self.origin.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graphs(&self) -> &[String] {
        &self.graphs
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All instances, sorted by id.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Look up one instance. `.` is the instance the descriptor was
    /// fetched from; wildcards are rejected.
    pub fn get(&self, id: &str) -> AdminResult<&Instance> {
        let found = if id == "." {
            self.origin
                .as_ref()
                .and_then(|(host, port)| self.get_by_admin_address(host, *port))
        } else if id.contains('*') {
            return Err(AdminError::invalid_usage(
                "wildcard not allowed for this operation",
            ));
        } else {
            self.instances.get(id)
        };
        found.ok_or_else(|| AdminError::invalid_usage(format!("unknown instance id: {id}")))
    }

    pub fn get_by_admin_address(&self, host: &str, admin_port: u16) -> Option<&Instance> {
        self.instances
            .values()
            .find(|i| i.host == host && i.aport() == admin_port)
    }

    /// Resolve an instance selector: `*` or `@` for all, a wildcard or
    /// bracket pattern, a single id, `.`, or a comma separated id list.
    pub fn select(&self, pattern: &str) -> AdminResult<Vec<&Instance>> {
        let pattern = pattern.trim();
        if pattern == "*" || pattern == "@" {
            return Ok(self.instances.values().collect());
        }
        if pattern.contains('*') || pattern.contains('[') {
            let source = format!("^(?:{})$", pattern.replace('.', r"\.").replace('*', ".*"));
            let rex = Regex::new(&source)
                .map_err(|e| AdminError::invalid_usage(format!("invalid pattern {pattern}: {e}")))?;
            return Ok(self.instances.values().filter(|i| rex.is_match(&i.id)).collect());
        }
        if pattern == "." || self.instances.contains_key(pattern) {
            return Ok(vec![self.get(pattern)?]);
        }
        pattern.split(',').map(|id| self.get(id.trim())).collect()
    }

    /// Roots of the transaction forest, sorted by id.
    pub fn transaction_roots(&self) -> &[TransactionNode] {
        &self.transaction
    }

    /// Direct subscribers of `id` in the transaction tree.
    pub fn subscribers(&self, id: &str) -> Vec<&Instance> {
        self.transaction
            .iter()
            .find_map(|root| root.find(id))
            .map(|node| {
                node.subscribers
                    .iter()
                    .filter_map(|s| self.instances.get(&s.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transaction provider of `id`, if it is a subscriber.
    pub fn provider(&self, id: &str) -> Option<&Instance> {
        self.transaction
            .iter()
            .find_map(|root| root.provider_of(id))
            .and_then(|p| self.instances.get(p))
    }

    pub fn dispatch_spec(&self, id: &str) -> Option<&DispatchSpec> {
        self.dispatch.get(id)
    }

    pub fn dispatcher_config(&self, id: &str) -> Option<&DispatcherConfig> {
        self.dispatchers.get(id)
    }

    /// Derived partition of every instance, keyed by id.
    pub fn partitions(&self) -> BTreeMap<&str, Option<&str>> {
        self.instances
            .values()
            .map(|i| (i.id.as_str(), i.partition.as_deref()))
            .collect()
    }

    /// Effective descriptor document. Validating it again yields the
    /// same model.
    pub fn to_value(&self) -> Value {
        let instances: Map<String, Value> = self
            .instances
            .values()
            .map(|i| (i.id.clone(), i.to_descriptor_value()))
            .collect();
        let transaction: Map<String, Value> = self
            .transaction
            .iter()
            .map(|n| (n.id.clone(), n.to_value()))
            .collect();
        let dispatch: Map<String, Value> = self
            .dispatch
            .iter()
            .map(|(id, spec)| (id.clone(), spec.to_value()))
            .collect();
        json!({
            "name": self.name,
            "graphs": self.graphs,
            "instances": instances,
            "topology": {
                "transaction": transaction,
                "dispatch": dispatch,
            }
        })
    }

    /// Instance view printed by `--instancecfg`.
    pub fn instance_config(&self, id: &str) -> AdminResult<Value> {
        let instance = self.get(id)?;
        let ip = instance
            .host
            .parse::<Ipv4Addr>()
            .ok()
            .map(|_| instance.host.clone());
        let subscribers: Vec<&str> = self
            .subscribers(&instance.id)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        Ok(json!({
            "id": instance.id,
            "graph": instance.graphs.join(" "),
            "group": instance.group,
            "type": instance.itype.as_str(),
            "host": instance.host,
            "ip": ip,
            "hport": instance.hport,
            "aport": instance.aport(),
            "tport": instance.tport,
            "prefix": instance.prefix,
            "s-in": instance.service_in,
            "attach": instance.attach,
            "durable": instance.durable,
            "description": instance.description,
            "partition": instance.partition,
            "subscribers": subscribers,
            "cfdispatcher": self.dispatcher_config(&instance.id).map(DispatcherConfig::to_value),
        }))
    }
}

/// Resolve a dispatch spec into partitions × replica rows.
fn resolve_dispatcher(spec: &DispatchSpec, instances: &BTreeMap<InstanceId, Instance>) -> DispatcherConfig {
    let address = |id: &str| {
        instances.get(id).map(|i| EngineAddress {
            host: i.host.clone(),
            port: i.hport,
        })
    };
    let mut config = DispatcherConfig::default();
    match spec {
        DispatchSpec::ReplicaMap(rows) => {
            let mut partition = Vec::new();
            for (engine, row) in rows {
                config.replicas.push(*row);
                partition.extend(address(engine));
            }
            config.partitions.push(partition);
        }
        DispatchSpec::PartitionMatrix(rows) => {
            for row in rows {
                if row.allow_incomplete() {
                    config.allow_incomplete = true;
                    continue;
                }
                config.replicas.push(row.row);
                for (p, engine) in row.partitions.iter().enumerate() {
                    if config.partitions.len() <= p {
                        config.partitions.push(Vec::new());
                    }
                    config.partitions[p].extend(address(engine));
                }
            }
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_instances() -> Value {
        json!({
            "A": {"type": "admin", "host": "h1", "hport": 9000},
            "D": {"type": "dispatch", "host": "h1", "hport": 9010},
            "S1": {"type": "search", "host": "h1", "hport": 9020},
            "S2": {"type": "search", "host": "h1", "hport": 9030},
        })
    }

    fn cluster_doc() -> Value {
        json!({
            "name": "demo",
            "graphs": ["g1"],
            "instances": {
                "A": {"type": "admin", "host": "h0", "hport": 9000},
                "B1": {"type": "builder", "host": "h1", "hport": 9000, "tport": 9002, "attach": true},
                "T1": {"type": "txproxy", "host": "h2", "hport": 9000, "tport": 9002},
                "S1": {"type": "search", "host": "h3", "hport": 9000, "tport": 9002},
                "S2": {"type": "search", "host": "h4", "hport": 9000, "tport": 9002},
                "D1": {"type": "dispatch", "host": "h5", "hport": 9000},
            },
            "topology": {
                "transaction": {"B1": {"T1": {"S1": {}, "S2": {}}}},
                "dispatch": {"D1": {"S1": {"channels": 16, "priority": 1}, "S2": {"channels": 16, "priority": 1}}}
            }
        })
    }

    // ── End-to-end validation ──────────────────────────────────────

    #[test]
    fn replica_dispatch_shares_partition() {
        let d = TopologyDescriptor::from_value(json!({
            "name": "s1",
            "instances": base_instances(),
            "topology": {"dispatch": {"D": {
                "S1": {"channels": 8, "priority": 1},
                "S2": {"channels": 8, "priority": 1, "primary": 1}
            }}}
        }))
        .unwrap();
        let s1 = d.instance("S1").unwrap().partition.clone();
        let s2 = d.instance("S2").unwrap().partition.clone();
        assert!(s1.is_some());
        assert_eq!(s1, s2);
        let cfg = d.dispatcher_config("D").unwrap();
        assert_eq!(cfg.replicas.len(), 2);
        assert_eq!(cfg.replicas[0].cost(), 8);
        assert!(cfg.replicas[1].primary);
        assert_eq!(cfg.partitions.len(), 1);
        assert_eq!(cfg.partitions[0].len(), 2);
    }

    #[test]
    fn replica_cost_out_of_range() {
        let err = TopologyDescriptor::from_value(json!({
            "name": "s2",
            "instances": base_instances(),
            "topology": {"dispatch": {"D": {
                "S1": {"channels": 8, "priority": 1},
                "S2": {"channels": 64, "priority": 10, "primary": 1}
            }}}
        }))
        .unwrap_err();
        assert_eq!(err.path, "topology.dispatch.D");
        assert!(err.message.contains("replica S2"));
        assert!(err.message.contains("= 640 out of range"));
    }

    #[test]
    fn revalidation_is_idempotent() {
        let first = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        let second = TopologyDescriptor::from_value(first.to_value()).unwrap();
        assert_eq!(first.partitions(), second.partitions());
        assert_eq!(first.to_value().to_string(), second.to_value().to_string());
        let third = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        assert_eq!(first.partitions(), third.partitions());
    }

    // ── Queries ────────────────────────────────────────────────────

    #[test]
    fn tree_queries() {
        let d = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        let subs: Vec<_> = d.subscribers("T1").iter().map(|i| i.id.clone()).collect();
        assert_eq!(subs, vec!["S1", "S2"]);
        assert_eq!(d.provider("S1").unwrap().id, "T1");
        assert!(d.provider("B1").is_none());
        assert!(d.subscribers("S1").is_empty());
        assert_eq!(d.transaction_roots().len(), 2); // B1 plus back-filled A
    }

    #[test]
    fn selection_patterns() {
        let d = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        assert_eq!(d.select("*").unwrap().len(), 6);
        let ids = |sel: Vec<&Instance>| sel.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(d.select("S*").unwrap()), vec!["S1", "S2"]);
        assert_eq!(ids(d.select("[BT]1").unwrap()), vec!["B1", "T1"]);
        assert_eq!(ids(d.select("S2, A").unwrap()), vec!["S2", "A"]);
        assert!(matches!(d.select("X"), Err(AdminError::InvalidUsage(_))));
        assert!(d.get("S*").is_err());
    }

    #[test]
    fn dot_resolves_origin() {
        let d = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        assert!(d.get(".").is_err());
        let d = d.with_origin("h3", 9001);
        assert_eq!(d.get(".").unwrap().id, "S1");
        assert_eq!(d.select(".").unwrap()[0].id, "S1");
    }

    #[test]
    fn matrix_config_is_column_major() {
        let d = TopologyDescriptor::from_value(json!({
            "instances": {
                "S11": {"type": "search", "host": "h", "hport": 9000},
                "S12": {"type": "search", "host": "h", "hport": 9010},
                "S21": {"type": "search", "host": "h", "hport": 9020},
                "S22": {"type": "search", "host": "h", "hport": 9030},
                "D": {"type": "dispatch", "host": "h", "hport": 9040},
            },
            "topology": {"dispatch": {"D": [
                {"channels": 8, "priority": 1, "partitions": ["S11", "S21"]},
                {"channels": 8, "priority": 1, "partitions": ["S12", "S22"]},
                {"priority": -1, "partitions": []}
            ]}}
        }))
        .unwrap();
        let cfg = d.dispatcher_config("D").unwrap();
        assert!(cfg.allow_incomplete);
        assert_eq!(cfg.replicas.len(), 2);
        assert_eq!(cfg.partitions.len(), 2);
        let ports: Vec<u16> = cfg.partitions[0].iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![9000, 9010]);
        let v = cfg.to_value();
        assert_eq!(v["options"]["allow-incomplete"], json!(true));
    }

    #[test]
    fn instance_config_view() {
        let d = TopologyDescriptor::from_value(cluster_doc()).unwrap();
        let cfg = d.instance_config("T1").unwrap();
        assert_eq!(cfg["aport"], json!(9001));
        assert_eq!(cfg["subscribers"], json!(["S1", "S2"]));
        assert_eq!(cfg["ip"], Value::Null);
        assert!(d.instance_config("D1").unwrap()["cfdispatcher"].is_object());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", cluster_doc()).unwrap();
        let d = TopologyDescriptor::from_file(file.path()).unwrap();
        assert_eq!(d.name(), "demo");
        assert_eq!(d.len(), 6);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{{not json").unwrap();
        assert!(matches!(
            TopologyDescriptor::from_file(bad.path()),
            Err(AdminError::Config(_))
        ));
    }
}
