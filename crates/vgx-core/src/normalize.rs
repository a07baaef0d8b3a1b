//! Descriptor normalization — rewrites accepted input shapes into the one
//! shape the validator walks.
//!
//! - legacy `topology.input` / `topology.search` become `transaction` / `dispatch`
//! - instances without `graph` serve every declared graph
//! - keys of the `common` section fill in whatever an instance leaves unset
//! - the transaction topology may be `null`, a dict tree, or a list of ids
//!   and `[id, subtree]` pairs; it always comes out as a dict tree

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Normalize a raw descriptor document. Shape errors of the sections this
/// pass touches are reported here; everything else is left to validation.
pub fn normalize(mut doc: Value) -> Result<Value, ConfigError> {
    if !doc.is_object() {
        return Err(ConfigError::new("descriptor", &doc, "(object required)"));
    }

    if let Value::Object(root) = &mut doc {
        rename_legacy_topology(root);
        default_instance_graphs(root);
        merge_common(root)?;

        if let Some(Value::Object(topology)) = root.get_mut("topology") {
            let transaction = topology.remove("transaction").unwrap_or(Value::Null);
            let tree = transaction_tree(&transaction, "topology.transaction")?;
            topology.insert("transaction".into(), Value::Object(tree));
        }
    }

    Ok(doc)
}

fn rename_legacy_topology(root: &mut Map<String, Value>) {
    let Some(Value::Object(topology)) = root.get_mut("topology") else {
        return;
    };
    for (legacy, current) in [("input", "transaction"), ("search", "dispatch")] {
        if !topology.contains_key(current) {
            if let Some(section) = topology.remove(legacy) {
                topology.insert(current.into(), section);
            }
        }
    }
}

fn default_instance_graphs(root: &mut Map<String, Value>) {
    let all = match root.get("graphs") {
        Some(Value::Array(graphs)) => graphs
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => return,
    };
    if let Some(Value::Object(instances)) = root.get_mut("instances") {
        for entry in instances.values_mut() {
            if let Value::Object(params) = entry {
                params
                    .entry("graph")
                    .or_insert_with(|| Value::String(all.clone()));
            }
        }
    }
}

fn merge_common(root: &mut Map<String, Value>) -> Result<(), ConfigError> {
    let common = match root.get("common") {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Object(common)) => common.clone(),
        Some(other) => return Err(ConfigError::new("common", other, "(object required)")),
    };
    if let Some(Value::Object(instances)) = root.get_mut("instances") {
        for entry in instances.values_mut() {
            if let Value::Object(params) = entry {
                for (key, value) in &common {
                    params.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
    Ok(())
}

static NULL: Value = Value::Null;

/// Convert any accepted transaction topology shape into a dict tree.
pub fn transaction_tree(value: &Value, path: &str) -> Result<Map<String, Value>, ConfigError> {
    let mut items: Vec<(String, &Value)> = Vec::new();
    match value {
        Value::Null => {}
        Value::Object(map) => items.extend(map.iter().map(|(k, v)| (k.clone(), v))),
        Value::Array(list) => {
            for item in list {
                match item {
                    Value::String(id) => items.push((id.clone(), &NULL)),
                    Value::Array(pair) if pair.len() == 2 && pair[0].is_string() => {
                        let id = pair[0].as_str().unwrap_or_default().to_string();
                        items.push((id, &pair[1]));
                    }
                    other => {
                        return Err(ConfigError::new(path, other, "(invalid transaction topology)"));
                    }
                }
            }
        }
        other => return Err(ConfigError::new(path, other, "(invalid transaction topology)")),
    }

    let mut tree = Map::new();
    for (id, sub) in items {
        let subtree = transaction_tree(sub, &format!("{path}.{id}"))?;
        if tree.insert(id.clone(), Value::Object(subtree)).is_some() {
            return Err(ConfigError::new(path, &Value::String(id), "(duplicate instance)"));
        }
    }
    Ok(tree)
}
