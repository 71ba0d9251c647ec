//! Streamable HTTP transport.
//!
//! Every message is POSTed to the server URL. The reply is either a JSON
//! body or an event stream carrying the response, possibly preceded by
//! notifications. The server may assign a session with the
//! `mcp-session-id` header; it is echoed on every later request and the
//! session is terminated with `DELETE` on close.

use super::event_stream::EventStreamParser;
use super::{
    header_map, parse_server_url, send_error, with_bearer, Transport, TransportEvents,
    TransportKind, TransportParams,
};
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use mcplink_auth::AuthProvider;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport for remote MCP servers.
pub struct HttpTransport {
    url: Url,
    client: Client,
    headers: HeaderMap,
    auth: Option<Arc<dyn AuthProvider>>,
    events: TransportEvents,
    connected: AtomicBool,
    /// Session ID assigned by the server.
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Create a new HTTP transport. No I/O happens until the first request.
    pub fn new(params: TransportParams) -> McpResult<Self> {
        let url = parse_server_url(&params.url)?;
        let headers = header_map(&params.headers)?;
        let client = Client::builder()
            .timeout(params.request_timeout)
            .build()
            .map_err(|e| McpError::construction(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url,
            client,
            headers,
            auth: params.auth,
            events: params.events,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Session ID assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn build(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url.clone())
            .headers(self.headers.clone());
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session_id);
        }
        with_bearer(req, self.auth.as_ref()).await
    }

    async fn post(&self, body: String) -> McpResult<reqwest::Response> {
        let response = self
            .build(reqwest::Method::POST)
            .await
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body)
            .send()
            .await
            .map_err(send_error)?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(id.to_string());
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if status == StatusCode::NOT_FOUND && self.session_id.read().await.is_some() {
            // The server forgot our session.
            self.connected.store(false, Ordering::SeqCst);
            *self.session_id.write().await = None;
            self.events.closed();
            return Err(McpError::connection_failed("Session expired"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::connection_failed(format!(
                "Server returned {status}: {text}"
            )));
        }
        Ok(response)
    }

    /// Read an event-stream reply until the response to `id` arrives.
    async fn read_stream(&self, response: reqwest::Response, id: u64) -> McpResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut parser = EventStreamParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::protocol(format!("Stream error: {e}")))?;
            for event in parser.push(&chunk) {
                if let Some(response) = self.route(&event.data, id) {
                    return Ok(response);
                }
            }
        }
        if let Some(event) = parser.finish() {
            if let Some(response) = self.route(&event.data, id) {
                return Ok(response);
            }
        }

        Err(McpError::protocol("Event stream ended without a response"))
    }

    /// Return the response to `id`; forward anything else as an event.
    fn route(&self, data: &str, id: u64) -> Option<JsonRpcResponse> {
        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed event data");
                return None;
            }
        };

        let is_ours = value.get("method").is_none()
            && value.get("id").and_then(serde_json::Value::as_u64) == Some(id);
        if is_ours {
            return serde_json::from_value(value).ok();
        }
        self.events.message(value);
        None
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self) -> McpResult<()> {
        // Streamable HTTP has no connect step; the first POST opens the session.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let body = serde_json::to_string(&request)?;
        debug!(id = request.id, method = %request.method, "Sending HTTP request");

        let response = self.post(body).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

        if is_stream {
            self.read_stream(response, request.id).await
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol(format!("Failed to read response: {e}")))?;
            serde_json::from_str(&text)
                .map_err(|e| McpError::protocol(format!("Invalid JSON response: {e}")))
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending HTTP notification");
        self.post(body).await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let session_id = self.session_id.write().await.take();

        if let Some(session_id) = session_id {
            let result = self
                .client
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, &session_id)
                .send()
                .await;
            match result {
                // 405: the server does not support client-initiated termination.
                Ok(r) if r.status().is_success() || r.status() == StatusCode::METHOD_NOT_ALLOWED => {}
                Ok(r) => warn!(status = %r.status(), "Session termination rejected"),
                Err(e) => {
                    if was_connected {
                        self.events.closed();
                    }
                    return Err(send_error(e));
                }
            }
        }

        if was_connected {
            self.events.closed();
        }
        debug!(url = %self.url, "Closed HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}
