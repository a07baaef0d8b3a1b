//! HTTP/1.1 transport over pooled hyper client connections.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use vgx_core::RemoteConfig;

use crate::error::{TransportError, TransportResult};
use crate::pool::{ConnectionPool, PoolKey};
use crate::transport::{Connector, RawResponse, Request, Transport};

/// Sender half of an HTTP/1.1 client connection.
pub type Http1Sender = SendRequest<Full<Bytes>>;

/// Transport to one node over reusable hyper connections.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    host: String,
    port: u16,
    pool: Arc<ConnectionPool<Http1Sender>>,
}

impl HttpTransport {
    pub fn new(host: impl Into<String>, port: u16, pool: Arc<ConnectionPool<Http1Sender>>) -> Self {
        Self {
            host: host.into(),
            port,
            pool,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self, request: &Request) -> TransportResult<Http1Sender> {
        let address = self.address();
        let stream = tokio::time::timeout(
            request.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            address: address.clone(),
            timeout_ms: request.timeout.as_millis() as u64,
        })?
        .map_err(|e| TransportError::Connect {
            address: address.clone(),
            message: e.to_string(),
        })?;

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect {
                address: address.clone(),
                message: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, %address, "connection closed with error");
            }
        });
        Ok(sender)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn exchange(&self, request: &Request, fresh: bool) -> TransportResult<RawResponse> {
        let key = PoolKey::current(&self.host, self.port, request.timeout);
        if fresh {
            self.pool.discard(&key);
        }
        let (mut sender, opened) = match self.pool.checkout(&key) {
            Some((sender, opened)) if !sender.is_closed() => (sender, opened),
            _ => (self.connect(request).await?, Instant::now()),
        };

        let mut builder = http::Request::builder()
            .method(request.method().as_str())
            .uri(request.uri())
            .header(http::header::HOST, self.address())
            .header(http::header::USER_AGENT, "vgxadmin/0.1");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = request.body.clone().unwrap_or_default();
        let http_request = builder
            .body(Full::new(body))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let exchange = async {
            sender.ready().await.map_err(classify)?;
            let response = sender.send_request(http_request).await.map_err(classify)?;
            let (parts, body) = response.into_parts();
            let bytes = body.collect().await.map_err(classify)?.to_bytes();
            Ok::<_, TransportError>((parts, bytes))
        };
        let (parts, bytes) = tokio::time::timeout(request.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                address: self.address(),
                timeout_ms: request.timeout.as_millis() as u64,
            })??;

        let status = parts.status.as_u16();
        if status == 200 {
            self.pool.checkin(key, sender, opened);
        }
        let headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Ok(RawResponse {
            status,
            reason: parts.status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: bytes,
        })
    }
}

fn classify(err: hyper::Error) -> TransportError {
    if err.is_canceled() || err.is_closed() || err.is_incomplete_message() {
        TransportError::NotConnected(err.to_string())
    } else if err.is_parse() {
        TransportError::ImproperState(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout {
            address: String::new(),
            timeout_ms: 0,
        }
    } else {
        TransportError::Http(err.to_string())
    }
}

/// Hands out [`HttpTransport`]s sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    pool: Arc<ConnectionPool<Http1Sender>>,
}

impl HttpConnector {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(config.pool_capacity, config.pool_evict)),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<Http1Sender> {
        &self.pool
    }
}

impl Connector for HttpConnector {
    fn transport(&self, host: &str, port: u16) -> Arc<dyn Transport> {
        Arc::new(HttpTransport::new(host, port, Arc::clone(&self.pool)))
    }
}
