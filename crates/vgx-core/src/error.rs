//! Error types for the VGX control plane.

use serde_json::Value;
use thiserror::Error;

/// Result type alias for control plane operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// A system descriptor failed validation.
///
/// Always fatal for the operation that loaded the descriptor, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("system descriptor {path}: {value} {message}")]
pub struct ConfigError {
    /// Dotted field path, e.g. `instances.S1.hport`.
    pub path: String,
    /// Offending value rendered as JSON.
    pub value: String,
    /// Human readable reason.
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, value: &Value, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.to_string(),
            message: message.into(),
        }
    }
}

/// A remote admin call failed after all retries.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
    /// Errors collected across attempts, oldest first.
    pub errors: Vec<String>,
    /// Body of the last response received, if any.
    pub last_response: Option<Value>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errors: Vec::new(),
            last_response: None,
        }
    }
}

/// Errors raised by descriptor handling, remote calls and protocols.
#[derive(Debug, Clone, Error)]
pub enum AdminError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("address error: {0}")]
    Address(String),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// A multi-step protocol could not confirm its end state.
    #[error("operation incomplete: {0}")]
    Incomplete(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// The admin gate is held by another token.
    #[error("{0}")]
    Busy(String),

    #[error("internal admin error: {0}")]
    Internal(String),
}

impl AdminError {
    /// Stable name of the error kind, printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            AdminError::Config(_) => "ConfigError",
            AdminError::Address(_) => "AddressError",
            AdminError::Server(_) => "ServerError",
            AdminError::Incomplete(_) => "OperationIncomplete",
            AdminError::Permission(_) => "PermissionError",
            AdminError::InvalidUsage(_) => "InvalidUsage",
            AdminError::Busy(_) => "AdminBusy",
            AdminError::Internal(_) => "InternalError",
        }
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        AdminError::Incomplete(message.into())
    }

    pub fn invalid_usage(message: impl Into<String>) -> Self {
        AdminError::InvalidUsage(message.into())
    }

    /// True for permission errors caused by an expired or consumed token.
    pub fn is_expired_token(&self) -> bool {
        matches!(self, AdminError::Permission(msg) if msg.starts_with("Expired"))
    }
}
