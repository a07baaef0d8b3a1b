//! vgx-remote — client side of the VGX admin HTTP surface.
//!
//! A [`RemoteNodeClient`] is bound to one `(host, port)` and speaks plain
//! HTTP/1.1 with JSON envelopes (`{"status", "response", "exec_ms"}`).
//! The wire is abstracted behind the [`Transport`] trait so the same
//! client logic runs over pooled hyper connections ([`HttpTransport`]) or
//! an in-process fake in tests.
//!
//! ```text
//! RemoteNodeClient ── retry, envelope unwrap, tokens, admin requests
//!        │
//!        ▼
//!   Transport ──► HttpTransport ──► ConnectionPool (host, port, timeout, thread)
//! ```

pub mod admin;
pub mod client;
pub mod error;
pub mod http;
pub mod pool;
pub mod transport;

pub use client::{RemoteNodeClient, lookup_key};
pub use error::{TransportError, TransportResult};
pub use http::{HttpConnector, HttpTransport};
pub use pool::{ConnectionPool, PoolKey};
pub use transport::{Body, Connector, Method, RawResponse, Request, Response, Transport};
