//! Typed view of `/vgx/nodestat`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use vgx_core::{AdminError, AdminResult, ServerError};

/// Node status snapshot. Unknown fields are ignored, missing ones default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Nodestat {
    pub digest: Option<String>,
    #[serde(deserialize_with = "counter")]
    pub idle_ms: i64,
    /// Bound transaction input port, 0 when unbound.
    #[serde(deserialize_with = "port")]
    pub txport: u16,
    #[serde(deserialize_with = "flag")]
    pub readonly: bool,
    #[serde(deserialize_with = "flag")]
    pub service_in: bool,
    /// Attached subscriber URIs; `null` placeholders are dropped.
    #[serde(deserialize_with = "present")]
    pub subscribers: Vec<Value>,
    /// Nodes report this as a decimal string.
    #[serde(deserialize_with = "counter")]
    pub master_serial: i64,
    #[serde(deserialize_with = "flag")]
    pub synchronizing: bool,
    #[serde(deserialize_with = "counter")]
    pub graph_order: i64,
    #[serde(deserialize_with = "counter")]
    pub graph_size: i64,
    #[serde(deserialize_with = "flag")]
    pub tx_in_halted: bool,
}

impl Nodestat {
    pub fn from_value(value: &Value) -> AdminResult<Self> {
        Nodestat::deserialize(value)
            .map_err(|e| AdminError::Server(ServerError::new(format!("malformed nodestat: {e}"))))
    }

    pub fn is_bound(&self) -> bool {
        self.txport != 0
    }
}

/// Integer counter sent as a number or a decimal string, `null` as 0.
fn counter<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| D::Error::custom(format!("counter out of range: {n}"))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid counter {s:?}"))),
        other => Err(D::Error::custom(format!("invalid counter {other}"))),
    }
}

fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let n = counter(deserializer)?;
    u16::try_from(n).map_err(|_| D::Error::custom(format!("port out of range: {n}")))
}

fn present<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter(|v| !v.is_null()).collect(),
        _ => Vec::new(),
    })
}

/// Nodes report flags as booleans or as 0/1 (or counts).
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(truthy(&Value::deserialize(deserializer)?))
}

/// Truthiness of a loosely typed status field.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mixed_flag_types() {
        let stat = Nodestat::from_value(&json!({
            "digest": "abc",
            "idle-ms": 7000,
            "txport": 9010,
            "readonly": 0,
            "service-in": 1,
            "synchronizing": false,
            "graph-order": 10,
            "graph-size": 20,
            "tx-in-halted": true,
            "subscribers": ["vgx://h:9110"],
            "extra": "ignored"
        }))
        .unwrap();
        assert_eq!(stat.digest.as_deref(), Some("abc"));
        assert!(stat.is_bound());
        assert!(!stat.readonly);
        assert!(stat.service_in);
        assert!(stat.tx_in_halted);
        assert_eq!(stat.subscribers.len(), 1);
    }

    #[test]
    fn missing_fields_default() {
        let stat = Nodestat::from_value(&json!({})).unwrap();
        assert_eq!(stat, Nodestat::default());
        assert!(!stat.is_bound());
    }

    #[test]
    fn reads_a_full_node_report() {
        let stat = Nodestat::from_value(&json!({
            "host": "something.local",
            "adminport": 9501,
            "txport": 10500,
            "digest": "a8a6fa7673b95b16cbe407d1c7a968c7",
            "master-serial": "1690412914493908",
            "idle-ms": 747828,
            "synchronizing": 0,
            "provider": null,
            "subscribers": [null],
            "tx-in-halted": false,
            "graph-order": 2902761,
            "graph-size": 2786355,
            "matrix": {"mode": "dispatch", "width": 5},
            "service-in": 1,
            "service-rate": 0.00,
            "durable": true
        }))
        .unwrap();
        assert_eq!(stat.txport, 10500);
        assert!(stat.is_bound());
        assert_eq!(stat.master_serial, 1_690_412_914_493_908);
        assert_eq!(stat.idle_ms, 747_828);
        assert_eq!(stat.graph_order, 2_902_761);
        assert_eq!(stat.graph_size, 2_786_355);
        assert!(stat.service_in);
        assert!(stat.subscribers.is_empty());
        assert_eq!(stat.digest.as_deref(), Some("a8a6fa7673b95b16cbe407d1c7a968c7"));
    }

    #[test]
    fn malformed_counters_are_errors() {
        let err = Nodestat::from_value(&json!({"master-serial": "soon"})).unwrap_err();
        assert_eq!(err.kind(), "ServerError");
        assert!(err.to_string().contains("soon"), "{err}");
        assert!(Nodestat::from_value(&json!({"txport": 70000})).is_err());
        assert!(Nodestat::from_value(&json!("down")).is_err());
    }
}
