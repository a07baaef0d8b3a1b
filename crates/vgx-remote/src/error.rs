//! Transport level errors.

use thiserror::Error;
use vgx_core::{AdminError, ServerError};

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while exchanging one request with a node.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("request to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    /// The pooled connection was closed underneath us.
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("improper connection state: {0}")]
    ImproperState(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Connection state problems and timeouts are retried on a fresh
    /// connection; everything else propagates.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::NotConnected(_)
                | TransportError::ImproperState(_)
        )
    }
}

impl From<TransportError> for AdminError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect { .. } => AdminError::Address(err.to_string()),
            other => {
                let mut server = ServerError::new(other.to_string());
                server.errors.push(other.to_string());
                AdminError::Server(server)
            }
        }
    }
}
