//! MCP transports.
//!
//! A transport carries JSON-RPC messages to one server. Requests are
//! answered through the returned future; everything else the server sends
//! (notifications, server requests) and lifecycle changes (errors, close) are
//! reported as [`TransportEvent`]s, tagged with the generation of the
//! transport that produced them so events from a replaced transport can be
//! told apart.

mod event_stream;
mod http;
mod selector;
mod sse;

pub use event_stream::{EventStreamParser, SseEvent};
pub use http::HttpTransport;
pub use selector::TransportSelector;
pub use sse::SseTransport;

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use mcplink_auth::AuthProvider;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Wire-level transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Streamable HTTP.
    Http,
    /// Legacy HTTP+SSE.
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
        }
    }

    /// Upper-case name for log messages.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Http => "HTTP",
            TransportKind::Sse => "SSE",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured transport choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Try HTTP, fall back to SSE once.
    #[default]
    Auto,
    Http,
    Sse,
}

impl TransportPreference {
    /// Kinds to try, in order, for an attempt that starts with `first`.
    ///
    /// Only `auto` ever yields two kinds, and only when starting from HTTP.
    pub fn plan(&self, first: Option<TransportKind>) -> Vec<TransportKind> {
        match self {
            TransportPreference::Http => vec![TransportKind::Http],
            TransportPreference::Sse => vec![TransportKind::Sse],
            TransportPreference::Auto => match first {
                Some(TransportKind::Sse) => vec![TransportKind::Sse],
                _ => vec![TransportKind::Http, TransportKind::Sse],
            },
        }
    }
}

impl FromStr for TransportPreference {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TransportPreference::Auto),
            "http" => Ok(TransportPreference::Http),
            "sse" => Ok(TransportPreference::Sse),
            other => Err(McpError::InvalidConfig(format!(
                "unknown transport type '{other}' (expected auto, http or sse)"
            ))),
        }
    }
}

/// Something a transport reports outside of a request/response exchange.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message that is not a response to one of our requests.
    Message(serde_json::Value),
    /// A transport-level failure.
    Error(String),
    /// The transport is gone.
    Closed,
}

/// Sending half of a transport's event callbacks.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Events that go nowhere, for transports used standalone.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn message(&self, message: serde_json::Value) {
        self.send(TransportEvent::Message(message));
    }

    pub fn error(&self, error: impl Into<String>) {
        self.send(TransportEvent::Error(error.into()));
    }

    pub fn closed(&self) {
        self.send(TransportEvent::Closed);
    }

    fn send(&self, event: TransportEvent) {
        // The receiver is gone once the owning connection is dropped.
        let _ = self.tx.send((self.generation, event));
    }
}

/// Transport trait for MCP communication.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// Open the channel. Must be called once before any request.
    async fn start(&self) -> McpResult<()>;

    /// Send a request and wait for a response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Everything needed to build a transport.
#[derive(Clone)]
pub struct TransportParams {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub request_timeout: Duration,
    pub events: TransportEvents,
}

impl fmt::Debug for TransportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportParams")
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("auth", &self.auth.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Builds transports of a given kind.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportKind, params: TransportParams)
        -> McpResult<Arc<dyn Transport>>;
}

/// Factory for the built-in HTTP and SSE transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        params: TransportParams,
    ) -> McpResult<Arc<dyn Transport>> {
        Ok(match kind {
            TransportKind::Http => Arc::new(HttpTransport::new(params)?),
            TransportKind::Sse => Arc::new(SseTransport::new(params)?),
        })
    }
}

/// Parse and validate a server URL.
pub(crate) fn parse_server_url(url: &str) -> McpResult<url::Url> {
    let parsed =
        url::Url::parse(url).map_err(|e| McpError::construction(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(McpError::construction(format!(
            "{url}: unsupported scheme '{other}'"
        ))),
    }
}

/// Convert configured custom headers into a header map.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> McpResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::construction(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::construction(format!("header value for '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Add the bearer token from `auth`, if any, to a request.
pub(crate) async fn with_bearer(
    request: reqwest::RequestBuilder,
    auth: Option<&Arc<dyn AuthProvider>>,
) -> reqwest::RequestBuilder {
    let Some(auth) = auth else {
        return request;
    };
    match auth.tokens().await {
        Ok(Some(tokens)) => request.bearer_auth(tokens.access_token),
        Ok(None) => request,
        Err(e) => {
            warn!(error = %e, "Failed to load tokens, sending request without authorization");
            request
        }
    }
}

/// Map a reqwest send error onto the client taxonomy.
pub(crate) fn send_error(e: reqwest::Error) -> McpError {
    if e.is_timeout() {
        McpError::Timeout
    } else if e.is_connect() {
        McpError::connection_failed(e.to_string())
    } else {
        McpError::Http(e)
    }
}
