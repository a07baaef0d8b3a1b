//! Request/response types and the [`Transport`] seam.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{TransportError, TransportResult};

/// Header telling the node how many attempts the client has left.
pub const MIN_EXECUTOR_HEADER: &str = "x-vgx-builtin-min-executor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// One request to a node. The method is POST when a body is present.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// Attach [`MIN_EXECUTOR_HEADER`].
    pub auto_executor: bool,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{path}") };
        Self {
            path,
            params: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeout: Duration::from_secs(4),
            auto_executor: true,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (k, v) in params {
            self.params.push((k.into(), v.to_string()));
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn accept_json(self) -> Self {
        self.header("accept", "application/json")
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_executor(mut self) -> Self {
        self.auto_executor = false;
        self
    }

    /// Replace or add a header, keys compared case-insensitively.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Method {
        if self.body.is_some() { Method::Post } else { Method::Get }
    }

    /// Path plus url-encoded query string.
    pub fn uri(&self) -> String {
        if self.params.is_empty() {
            return self.path.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        format!("{}?{}", self.path, query)
    }
}

/// Response exactly as received.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: String::new(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// JSON body with the matching content type.
    pub fn json(status: u16, value: &Value) -> Self {
        let mut raw = Self::new(status, value.to_string());
        raw.headers
            .insert("content-type".into(), "application/json; charset=UTF-8".into());
        raw
    }
}

/// Response body after content negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Raw(Bytes),
}

/// Parsed response. JSON envelopes are unwrapped to their `response` field.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl Response {
    pub fn from_raw(raw: RawResponse) -> TransportResult<Self> {
        let is_json = raw
            .headers
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"));
        let body = if is_json {
            let value: Value = serde_json::from_slice(&raw.body)
                .map_err(|e| TransportError::InvalidResponse(format!("bad JSON body: {e}")))?;
            match value {
                Value::Object(mut envelope) if envelope.contains_key("response") => {
                    Body::Json(envelope.remove("response").unwrap_or(Value::Null))
                }
                other => Body::Json(other),
            }
        } else {
            Body::Raw(raw.body)
        };
        Ok(Self {
            status: raw.status,
            reason: raw.reason,
            headers: raw.headers,
            body,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(v) => Some(v),
            Body::Raw(_) => None,
        }
    }

    /// Body as a JSON value; raw bodies become a string.
    pub fn into_value(self) -> Value {
        match self.body {
            Body::Json(v) => v,
            Body::Raw(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

/// One request/response exchange with a fixed node.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn host(&self) -> &str;

    fn port(&self) -> u16;

    /// Send `request` and read the full response. With `fresh` set any
    /// reusable connection is dropped first.
    async fn exchange(&self, request: &Request, fresh: bool) -> TransportResult<RawResponse>;
}

/// Creates transports for arbitrary node addresses.
pub trait Connector: Send + Sync + fmt::Debug {
    fn transport(&self, host: &str, port: u16) -> Arc<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_follows_body() {
        let req = Request::get("vgx/ping");
        assert_eq!(req.path, "/vgx/ping");
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.body("{}").method(), Method::Post);
    }

    #[test]
    fn uri_encodes_params() {
        let req = Request::get("/vgx/builtin/ADMIN_Console")
            .param("graph", "g1")
            .param("cmd", "a b&c");
        assert_eq!(req.uri(), "/vgx/builtin/ADMIN_Console?graph=g1&cmd=a+b%26c");
        assert_eq!(req.param_value("graph"), Some("g1"));
    }

    #[test]
    fn headers_replace_case_insensitively() {
        let mut req = Request::get("/x").header("Accept", "text/plain");
        req.set_header("accept", "application/json");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header_value("ACCEPT"), Some("application/json"));
    }

    #[test]
    fn envelope_is_unwrapped() {
        let raw = RawResponse::json(200, &json!({"status": "OK", "response": {"a": 1}, "exec_ms": 0.1}));
        let resp = Response::from_raw(raw).unwrap();
        assert_eq!(resp.json(), Some(&json!({"a": 1})));

        let raw = RawResponse::json(500, &json!({"status": "ERROR", "message": "x"}));
        let resp = Response::from_raw(raw).unwrap();
        assert_eq!(resp.json().unwrap()["message"], json!("x"));
        assert!(!resp.is_ok());
    }

    #[test]
    fn plain_bodies_stay_raw() {
        let resp = Response::from_raw(RawResponse::new(200, "VGX/3.6")).unwrap();
        assert_eq!(resp.body, Body::Raw(Bytes::from_static(b"VGX/3.6")));
        assert_eq!(resp.into_value(), json!("VGX/3.6"));

        let mut raw = RawResponse::new(200, "{oops");
        raw.headers.insert("content-type".into(), "application/json".into());
        assert!(matches!(Response::from_raw(raw), Err(TransportError::InvalidResponse(_))));
    }
}
