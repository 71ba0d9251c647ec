//! MCP client error types.

use crate::snapshot::ConnectionState;
use mcplink_auth::AuthError;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while connecting to or talking with an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// The transport could not be built (malformed URL, bad header, ...).
    #[error("Invalid transport configuration: {0}")]
    TransportConstruction(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request timeout.
    #[error("Request timed out")]
    Timeout,

    /// The server rejected the current credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// An authorization attempt failed (popup blocked, rejected, timed out).
    #[error("Authorization failed: {0}")]
    AuthFlow(String),

    /// Error from the authorization provider.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// An action that needs a ready connection was invoked too early.
    #[error("MCP client not ready (current state: {state})")]
    NotReady { state: ConnectionState },

    /// JSON-RPC error returned by the server.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Invalid connection options.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a transport construction error.
    pub fn construction(message: impl Into<String>) -> Self {
        Self::TransportConstruction(message.into())
    }

    /// Whether this is a 401-equivalent that should start authorization.
    pub fn is_auth_error(&self) -> bool {
        match self {
            McpError::Unauthorized => true,
            McpError::Http(e) => e.status() == Some(reqwest::StatusCode::UNAUTHORIZED),
            McpError::Rpc { code, message } => *code == 401 || message.contains("Unauthorized"),
            _ => false,
        }
    }
}
