//! System descriptor validation and partition assignment.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. `name` and `graphs` shape
//! 2. every instance, sorted by id (type, group, host, ports, prefix,
//!    `s-in`/`attach` defaults, `tport`, `durable`, description)
//! 3. transaction topology walk, assigning `1000*prefix + n/1000`
//!    partitions (prefix 1 admin/generic, 2 dispatch, 3 engines)
//! 4. dispatch topology walk, validating replica rows and deriving
//!    dispatcher partitions from their replicas
//! 5. default `2000 + k/1000` partitions for dispatchers still without one
//!
//! Instances that no topology mentions are added as transaction roots
//! before the walk, so re-validating an emitted descriptor reproduces the
//! same partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::descriptor::TransactionNode;
use crate::error::ConfigError;
use crate::normalize::normalize;
use crate::types::{
    DISPATCH_DEFAULT_CHANNELS, DISPATCH_DEFAULT_PRIORITY, DISPATCH_MAX_COST, DispatchSpec,
    Instance, InstanceId, InstanceType, MatrixRow, ReplicaRow,
};

static NULL: Value = Value::Null;

static PREFIX_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-./0-9=@A-Z_a-z~]+$").expect("prefix regex"));

/// Output of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedTopology {
    pub name: String,
    pub graphs: Vec<String>,
    pub instances: BTreeMap<InstanceId, Instance>,
    pub transaction: Vec<TransactionNode>,
    pub dispatch: BTreeMap<InstanceId, DispatchSpec>,
}

/// Format a sortable partition key.
pub fn partition_key(prefix: u32, number: u32) -> String {
    format!("{:.3}", 1000.0 * f64::from(prefix) + f64::from(number) / 1000.0)
}

/// Normalize and validate a raw descriptor document.
pub fn validate(raw: Value) -> Result<ValidatedTopology, ConfigError> {
    let doc = normalize(raw)?;
    let empty = Map::new();
    let root = doc.as_object().unwrap_or(&empty);

    let mut v = Validator::default();

    // name / graphs
    let name = match root.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => return Err(ConfigError::new("name", other, "(string required)")),
    };
    v.graphs = match root.get("graphs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|g| {
                g.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::new("graphs", g, "(graph names must be strings)"))
            })
            .collect::<Result<_, _>>()?,
        Some(other) => return Err(ConfigError::new("graphs", other, "(list required)")),
    };

    // instances
    let instances = match root.get("instances") {
        Some(Value::Object(map)) if !map.is_empty() => map,
        Some(Value::Object(_)) => {
            return Err(ConfigError::new(
                "instances",
                &json!({}),
                "(at least one instance required)",
            ));
        }
        other => {
            return Err(ConfigError::new(
                "instances",
                other.unwrap_or(&NULL),
                "(object required)",
            ));
        }
    };
    for id in sorted_keys(instances) {
        let instance = v.instance(id, &instances[id])?;
        v.instances.insert(id.clone(), instance);
    }

    // topology sections
    let (mut transaction, dispatch) = match root.get("topology") {
        None | Some(Value::Null) => (Map::new(), Map::new()),
        Some(Value::Object(topology)) => {
            let transaction = match topology.get("transaction") {
                Some(Value::Object(tree)) => tree.clone(),
                _ => Map::new(),
            };
            let dispatch = match topology.get("dispatch") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(d)) => d.clone(),
                Some(other) => {
                    return Err(ConfigError::new("topology.dispatch", other, "(object required)"));
                }
            };
            (transaction, dispatch)
        }
        Some(other) => return Err(ConfigError::new("topology", other, "(object required)")),
    };

    let mut referenced = HashSet::new();
    collect_transaction_ids(&transaction, &mut referenced);
    collect_dispatch_ids(&dispatch, &mut referenced);
    let unreferenced: Vec<String> = v
        .instances
        .keys()
        .filter(|id| !referenced.contains(*id))
        .cloned()
        .collect();
    for id in unreferenced {
        transaction.insert(id, Value::Object(Map::new()));
    }

    let roots = v.transaction(&transaction, "topology.transaction", None)?;
    let specs = v.dispatch(&dispatch)?;
    v.default_dispatcher_partitions(&specs);

    Ok(ValidatedTopology {
        name: name.unwrap_or_else(|| format!("Unspecified {}-node System", v.instances.len())),
        graphs: v.graphs,
        instances: v.instances,
        transaction: roots,
        dispatch: specs,
    })
}

#[derive(Default)]
struct Validator {
    graphs: Vec<String>,
    instances: BTreeMap<InstanceId, Instance>,
    host_ports: HashMap<String, HashSet<u16>>,
    builder_groups: Vec<f64>,
    in_transaction: HashSet<InstanceId>,
}

impl Validator {
    fn instance(&mut self, id: &str, params: &Value) -> Result<Instance, ConfigError> {
        let path = format!("instances.{id}");
        let Value::Object(p) = params else {
            return Err(ConfigError::new(path, params, "(object required)"));
        };
        let field = |key: &str| format!("{path}.{key}");
        let null = Value::Null;
        let get = |key: &str| p.get(key).unwrap_or(&null);

        // graph
        let graphs = match get("graph") {
            Value::Null => Vec::new(),
            Value::String(s) => {
                let mut graphs = Vec::new();
                for name in s.split_whitespace() {
                    if !self.graphs.iter().any(|g| g == name) {
                        return Err(ConfigError::new(
                            field("graph"),
                            get("graph"),
                            format!("({name} is undeclared, must be one of {:?})", self.graphs),
                        ));
                    }
                    graphs.push(name.to_string());
                }
                graphs
            }
            other => return Err(ConfigError::new(field("graph"), other, "(string required)")),
        };

        // type
        let itype = get("type")
            .as_str()
            .and_then(|s| s.parse::<InstanceType>().ok())
            .ok_or_else(|| {
                let names: Vec<_> = InstanceType::ALL.iter().map(|t| t.as_str()).collect();
                ConfigError::new(field("type"), get("type"), format!("(must be one of {names:?})"))
            })?;

        // group
        let group = match get("group") {
            Value::Null => -1.0,
            Value::Number(n) => n.as_f64().unwrap_or(-1.0),
            other => {
                return Err(ConfigError::new(field("group"), other, "(numeric value required)"));
            }
        };
        if itype == InstanceType::Builder && group >= 0.0 {
            if self.builder_groups.contains(&group) {
                return Err(ConfigError::new(
                    field("group"),
                    get("group"),
                    format!("(duplicate builder group {group})"),
                ));
            }
            self.builder_groups.push(group);
        }

        // host
        let host = get("host")
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::new(field("host"), get("host"), "(string required)"))?;

        // hport, reserving hport and hport+1
        let hport = match get("hport").as_i64() {
            Some(n) if (1..=i64::from(u16::MAX) - 1).contains(&n) => n as u16,
            Some(n) if n >= 1 => {
                return Err(ConfigError::new(field("hport"), get("hport"), "(port out of range)"));
            }
            _ => {
                return Err(ConfigError::new(
                    field("hport"),
                    get("hport"),
                    "(positive integer required)",
                ));
            }
        };
        let used = self.host_ports.entry(host.clone()).or_default();
        for port in [hport, hport + 1] {
            if used.contains(&port) {
                return Err(ConfigError::new(
                    field("hport"),
                    get("hport"),
                    format!("(duplicate port {port} on host {host})"),
                ));
            }
        }
        used.insert(hport);
        used.insert(hport + 1);

        // prefix
        let prefix = match get("prefix") {
            Value::Null => None,
            Value::String(s) if PREFIX_PATH.is_match(s) => Some(s.clone()),
            Value::String(_) => {
                return Err(ConfigError::new(
                    field("prefix"),
                    get("prefix"),
                    "(invalid characters in prefix path)",
                ));
            }
            other => {
                return Err(ConfigError::new(field("prefix"), other, "(string value required)"));
            }
        };

        // s-in
        let service_in = match get("s-in") {
            Value::Null => itype.default_service_in(),
            Value::Bool(b) => *b,
            other => return Err(ConfigError::new(field("s-in"), other, "(bool value required)")),
        };

        // attach
        let attach = match get("attach") {
            Value::Null => false,
            Value::Bool(b) => *b,
            other => return Err(ConfigError::new(field("attach"), other, "(bool value required)")),
        };
        if attach && !itype.is_attachable() {
            return Err(ConfigError::new(
                field("attach"),
                get("attach"),
                format!("(instance type {itype} cannot be attached)"),
            ));
        }

        // tport
        let tport = match get("tport") {
            Value::Null => 0,
            v if v.as_i64() == Some(0) => 0,
            v => match v.as_i64() {
                Some(n) if (1..=i64::from(u16::MAX)).contains(&n) => n as u16,
                _ => return Err(ConfigError::new(field("tport"), v, "(integer required)")),
            },
        };
        if tport != 0 {
            if tport == hport || tport == hport + 1 {
                return Err(ConfigError::new(
                    field("tport"),
                    get("tport"),
                    "(cannot be same as hport or hport+1)",
                ));
            }
            let used = self.host_ports.entry(host.clone()).or_default();
            if !used.insert(tport) {
                return Err(ConfigError::new(
                    field("tport"),
                    get("tport"),
                    format!("(duplicate port {tport} on host {host})"),
                ));
            }
        }

        // durable
        let durable = match get("durable") {
            Value::Null => false,
            Value::Bool(b) => *b,
            other => return Err(ConfigError::new(field("durable"), other, "(bool required)")),
        };
        if durable && tport == 0 {
            return Err(ConfigError::new(
                field("tport"),
                get("tport"),
                "(tport required when durable is true)",
            ));
        }

        // description
        let description = match get("description") {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => return Err(ConfigError::new(field("description"), other, "(string required)")),
        }
        .unwrap_or_else(|| format!("{} {id} at {host}:{hport}", itype.label()));

        Ok(Instance {
            id: id.to_string(),
            itype,
            host,
            hport,
            tport,
            durable,
            group,
            graphs,
            service_in,
            attach,
            prefix,
            description,
            partition: None,
        })
    }

    /// Walk one level of the transaction tree. Top-level entries draw the
    /// next number from a per-prefix counter, descendants inherit it.
    fn transaction(
        &mut self,
        tree: &Map<String, Value>,
        path: &str,
        inherited: Option<u32>,
    ) -> Result<Vec<TransactionNode>, ConfigError> {
        let mut engine_number = inherited.unwrap_or(1);
        let mut dispatch_number = inherited.unwrap_or(1);
        let mut admin_number = inherited.unwrap_or(1);
        let mut nodes = Vec::new();

        for id in sorted_keys(tree) {
            let Some(instance) = self.instances.get(id) else {
                return Err(ConfigError::new(path, &json!(id), "(instance is undefined)"));
            };
            if !self.in_transaction.insert(id.clone()) {
                return Err(ConfigError::new(path, &json!(id), "(duplicate instance)"));
            }
            let children = match &tree[id] {
                Value::Object(children) => children,
                other => {
                    return Err(ConfigError::new(format!("{path}.{id}"), other, "(object required)"));
                }
            };

            let next = |counter: &mut u32| {
                let n = *counter;
                if inherited.is_none() {
                    *counter += 1;
                }
                n
            };
            let (prefix, number) = match instance.itype {
                InstanceType::Admin => (1, next(&mut admin_number)),
                InstanceType::Dispatch => (2, next(&mut dispatch_number)),
                InstanceType::Builder | InstanceType::Txproxy | InstanceType::Search => {
                    if instance.attach && children.is_empty() {
                        return Err(ConfigError::new(
                            format!("instances.{id}.attach"),
                            &json!(true),
                            "(no subscribers)",
                        ));
                    }
                    (3, next(&mut engine_number))
                }
                InstanceType::Generic => (1, 1),
            };

            if let Some(instance) = self.instances.get_mut(id) {
                instance.partition = Some(partition_key(prefix, number));
            }
            let subscribers = self.transaction(children, &format!("{path}.{id}"), Some(number))?;
            nodes.push(TransactionNode {
                id: id.clone(),
                subscribers,
            });
        }
        Ok(nodes)
    }

    fn dispatch(
        &mut self,
        dispatch: &Map<String, Value>,
    ) -> Result<BTreeMap<InstanceId, DispatchSpec>, ConfigError> {
        let mut specs = BTreeMap::new();
        for (index, id) in sorted_keys(dispatch).into_iter().enumerate() {
            let number = index as u32 + 1;
            let path = format!("topology.dispatch.{id}");
            if !self.instances.contains_key(id) {
                return Err(ConfigError::new(
                    "topology.dispatch",
                    &json!(id),
                    "(instance is undefined)",
                ));
            }
            let spec = match &dispatch[id] {
                Value::Object(replicas) => {
                    let spec = self.replica_map(&path, replicas)?;
                    self.inherit_replica_partition(id, &spec, number);
                    spec
                }
                Value::Array(rows) => self.partition_matrix(&path, rows)?,
                other => return Err(ConfigError::new(path, other, "(invalid configuration)")),
            };
            specs.insert(id.clone(), spec);
        }
        Ok(specs)
    }

    fn replica_map(&self, path: &str, replicas: &Map<String, Value>) -> Result<DispatchSpec, ConfigError> {
        let mut rows = Vec::new();
        let mut has_primary = false;
        for engine in sorted_keys(replicas) {
            if !self.instances.contains_key(engine) {
                return Err(ConfigError::new(path, &json!(engine), "(instance is undefined)"));
            }
            let value = &replicas[engine];
            let Value::Object(params) = value else {
                return Err(ConfigError::new(
                    format!("{path}.{engine}"),
                    value,
                    "(config must be an object)",
                ));
            };
            let row = row_params(path, engine, params, value)?;
            if row.primary {
                if has_primary {
                    return Err(ConfigError::new(
                        path,
                        value,
                        format!("(replica {engine} cannot be a second primary)"),
                    ));
                }
                has_primary = true;
            }
            rows.push((engine.clone(), row));
        }
        Ok(DispatchSpec::ReplicaMap(rows))
    }

    /// A replica map dispatcher serves the partition its replicas share,
    /// or a synthesized `2000 + k/1000` when they do not agree. Replicas
    /// without a partition adopt the dispatcher's.
    fn inherit_replica_partition(&mut self, id: &str, spec: &DispatchSpec, number: u32) {
        let engines = spec.engines();
        let seen: BTreeSet<Option<String>> = engines
            .iter()
            .map(|e| self.instances.get(*e).and_then(|i| i.partition.clone()))
            .collect();
        let partition = match seen.into_iter().collect::<Vec<_>>().as_slice() {
            [Some(shared)] => shared.clone(),
            _ => partition_key(2, number),
        };
        for engine in engines {
            if let Some(instance) = self.instances.get_mut(engine) {
                instance.partition.get_or_insert_with(|| partition.clone());
            }
        }
        if let Some(dispatcher) = self.instances.get_mut(id) {
            dispatcher.partition = Some(partition);
        }
    }

    fn partition_matrix(&self, path: &str, rows: &[Value]) -> Result<DispatchSpec, ConfigError> {
        let mut matrix = Vec::new();
        let mut has_primary = false;
        for (index, value) in rows.iter().enumerate() {
            let r = index + 1;
            let Value::Object(params) = value else {
                return Err(ConfigError::new(path, value, format!("(row {r} config must be an object)")));
            };
            let partitions = match params.get("partitions") {
                None => {
                    return Err(ConfigError::new(path, value, format!("(row {r} partitions missing)")));
                }
                Some(Value::Array(ids)) => ids,
                Some(other) => {
                    return Err(ConfigError::new(
                        path,
                        other,
                        format!("(row {r} partitions must be a list)"),
                    ));
                }
            };
            let row = row_params(path, &r.to_string(), params, value)?;
            if row.primary {
                if has_primary {
                    return Err(ConfigError::new(
                        path,
                        value,
                        format!("(row {r} cannot be a second primary)"),
                    ));
                }
                has_primary = true;
            }
            let mut engines = Vec::new();
            for engine in partitions {
                match engine.as_str() {
                    Some(e) if self.instances.contains_key(e) => engines.push(e.to_string()),
                    _ => {
                        return Err(ConfigError::new(
                            path,
                            engine,
                            format!("(row {r} partitions engine is undefined)"),
                        ));
                    }
                }
            }
            matrix.push(MatrixRow {
                row,
                partitions: engines,
                description: params.get("description").and_then(Value::as_str).map(str::to_string),
            });
        }
        Ok(DispatchSpec::PartitionMatrix(matrix))
    }

    /// Dispatchers still without a partition are grouped by the sorted
    /// engine list of their first row; each new group takes the next
    /// unused `2000 + k/1000`.
    fn default_dispatcher_partitions(&mut self, specs: &BTreeMap<InstanceId, DispatchSpec>) {
        let mut used: HashSet<String> = self
            .instances
            .values()
            .filter_map(|i| i.partition.clone())
            .collect();
        let mut groups: HashMap<String, String> = HashMap::new();
        let mut next = 1;

        for (id, spec) in specs {
            if self.instances.get(id).is_none_or(|i| i.partition.is_some()) {
                continue;
            }
            let signature = match spec {
                DispatchSpec::PartitionMatrix(rows) if !rows.is_empty() => {
                    let mut engines = rows[0].partitions.clone();
                    engines.sort();
                    format!("row:{}", engines.join("\t"))
                }
                _ => format!("id:{id}"),
            };
            let partition = match groups.get(&signature) {
                Some(p) => p.clone(),
                None => {
                    let p = loop {
                        let candidate = partition_key(2, next);
                        next += 1;
                        if !used.contains(&candidate) {
                            break candidate;
                        }
                    };
                    used.insert(p.clone());
                    groups.insert(signature, p.clone());
                    p
                }
            };
            if let Some(dispatcher) = self.instances.get_mut(id) {
                dispatcher.partition = Some(partition);
            }
        }
    }
}

/// Validate `channels`, `priority` and `primary` of one dispatch row.
fn row_params(
    path: &str,
    replica: &str,
    params: &Map<String, Value>,
    value: &Value,
) -> Result<ReplicaRow, ConfigError> {
    let int = |key: &str, default: i64| match params.get(key) {
        None => Ok(default),
        Some(v) => v.as_i64().ok_or_else(|| {
            ConfigError::new(path, value, format!("(replica {replica} '{key}' must be int)"))
        }),
    };
    let channels = int("channels", DISPATCH_DEFAULT_CHANNELS)?;
    if !(1..=DISPATCH_MAX_COST).contains(&channels) {
        return Err(ConfigError::new(
            path,
            value,
            format!("(replica {replica} 'channels':{channels} out of range)"),
        ));
    }
    let priority = int("priority", DISPATCH_DEFAULT_PRIORITY)?;
    let allow_incomplete =
        matches!(params.get("partitions"), Some(Value::Array(p)) if p.is_empty()) && priority < 0;
    if !allow_incomplete && !(0..=DISPATCH_MAX_COST).contains(&priority) {
        return Err(ConfigError::new(
            path,
            value,
            format!("(replica {replica} 'priority':{priority} out of range)"),
        ));
    }
    let cost = priority * channels;
    if cost > DISPATCH_MAX_COST {
        return Err(ConfigError::new(
            path,
            value,
            format!("(replica {replica} max cost {priority} x {channels} = {cost} out of range)"),
        ));
    }
    let primary = match params.get("primary") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(v) if v.is_i64() || v.is_u64() => v.as_i64() != Some(0),
        Some(_) => {
            return Err(ConfigError::new(
                path,
                value,
                format!("(replica {replica} 'primary' must be bool or int)"),
            ));
        }
    };
    Ok(ReplicaRow {
        channels,
        priority,
        primary,
    })
}

fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

fn collect_transaction_ids(tree: &Map<String, Value>, out: &mut HashSet<String>) {
    for (id, sub) in tree {
        out.insert(id.clone());
        if let Value::Object(children) = sub {
            collect_transaction_ids(children, out);
        }
    }
}

fn collect_dispatch_ids(dispatch: &Map<String, Value>, out: &mut HashSet<String>) {
    for (id, cfg) in dispatch {
        out.insert(id.clone());
        match cfg {
            Value::Object(replicas) => out.extend(replicas.keys().cloned()),
            Value::Array(rows) => {
                for row in rows {
                    if let Some(Value::Array(engines)) = row.get("partitions") {
                        out.extend(engines.iter().filter_map(Value::as_str).map(str::to_string));
                    }
                }
            }
            _ => {}
        }
    }
}
