//! Legacy HTTP+SSE transport.
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL to POST messages to; responses and
//! notifications come back over the stream. The stream ending closes the
//! transport.

use super::event_stream::{EventStreamParser, SseEvent};
use super::{
    header_map, parse_server_url, send_error, with_bearer, Transport, TransportEvents,
    TransportKind, TransportParams,
};
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use mcplink_auth::AuthProvider;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// SSE transport for servers that predate streamable HTTP.
pub struct SseTransport {
    url: Url,
    /// Client for the event stream; has no overall timeout.
    stream_client: Client,
    /// Client for POSTed messages.
    client: Client,
    headers: HeaderMap,
    auth: Option<Arc<dyn AuthProvider>>,
    events: TransportEvents,
    request_timeout: Duration,
    endpoint: RwLock<Option<Url>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl SseTransport {
    /// Create a new SSE transport. The stream is opened by [`Transport::start`].
    pub fn new(params: TransportParams) -> McpResult<Self> {
        let url = parse_server_url(&params.url)?;
        let headers = header_map(&params.headers)?;
        let client = Client::builder()
            .timeout(params.request_timeout)
            .build()
            .map_err(|e| McpError::construction(format!("Failed to create HTTP client: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(params.request_timeout)
            .build()
            .map_err(|e| McpError::construction(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url,
            stream_client,
            client,
            headers,
            auth: params.auth,
            events: params.events,
            request_timeout: params.request_timeout,
            endpoint: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    /// The message endpoint announced by the server.
    pub async fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }

    async fn post(&self, body: String) -> McpResult<reqwest::Response> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| McpError::connection_failed("SSE transport not started"))?;

        let req = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = with_bearer(req, self.auth.as_ref())
            .await
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::connection_failed(format!(
                "Server returned {status}: {text}"
            )));
        }
        Ok(response)
    }

    fn take_pending(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }
}

fn lock(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve the `endpoint` event payload against the stream URL.
///
/// The endpoint must share the stream's origin.
pub(crate) fn resolve_endpoint(base: &Url, data: &str) -> McpResult<Url> {
    let data = data.trim();
    let endpoint = base
        .join(data)
        .map_err(|e| McpError::protocol(format!("Invalid endpoint '{data}': {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(McpError::protocol(format!(
            "Endpoint origin does not match server: {endpoint}"
        )));
    }
    Ok(endpoint)
}

/// Deliver a `message` event: responses resolve their request, anything
/// else goes to the event callbacks.
pub(crate) fn route_message(data: &str, pending: &Pending, events: &TransportEvents) {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed SSE message");
            return;
        }
    };

    let response_id = match value.get("method") {
        None => value.get("id").and_then(serde_json::Value::as_u64),
        Some(_) => None,
    };
    let Some(id) = response_id else {
        events.message(value);
        return;
    };

    let sender = lock(pending).remove(&id);
    match (sender, serde_json::from_value::<JsonRpcResponse>(value)) {
        (Some(sender), Ok(response)) => {
            let _ = sender.send(response);
        }
        (None, _) => debug!(id, "Response for unknown request"),
        (Some(_), Err(e)) => warn!(id, error = %e, "Malformed response"),
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn start(&self) -> McpResult<()> {
        let req = self
            .stream_client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let response = with_bearer(req, self.auth.as_ref())
            .await
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE stream returned {status}"
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<McpResult<Url>>();
        let base = self.url.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = EventStreamParser::new();
            let mut endpoint_tx = Some(endpoint_tx);

            let handle = |event: SseEvent, endpoint_tx: &mut Option<oneshot::Sender<_>>| {
                match event.event.as_str() {
                    "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(resolve_endpoint(&base, &event.data));
                        }
                    }
                    "message" => route_message(&event.data, &pending, &events),
                    other => debug!(event = %other, "Ignoring SSE event"),
                }
            };

            let ended_by = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.push(&bytes) {
                                handle(event, &mut endpoint_tx);
                            }
                        }
                        Some(Err(e)) => break Some(format!("SSE stream error: {e}")),
                        None => {
                            if let Some(event) = parser.finish() {
                                handle(event, &mut endpoint_tx);
                            }
                            break Some("SSE stream ended".to_string());
                        }
                    }
                }
            };

            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(Err(McpError::connection_failed(
                    "SSE stream closed before announcing an endpoint",
                )));
            }
            lock(&pending).clear();

            if let Some(reason) = ended_by {
                debug!(%reason, "SSE stream finished");
                if connected.swap(false, Ordering::SeqCst) {
                    events.closed();
                }
            }
        });

        let announced = match tokio::time::timeout(self.request_timeout, endpoint_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::connection_failed("SSE reader stopped")),
            Err(_) => Err(McpError::Timeout),
        };
        let endpoint = match announced {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                self.shutdown.cancel();
                return Err(e);
            }
        };

        debug!(endpoint = %endpoint, "SSE endpoint announced");
        *self.endpoint.write().await = Some(endpoint);
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request.id;
        let body = serde_json::to_string(&request)?;
        debug!(id, method = %request.method, "Sending SSE request");

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.post(body).await {
            self.take_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed("SSE stream closed")),
            Err(_) => {
                self.take_pending(id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending SSE notification");
        self.post(body).await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.shutdown.cancel();
        lock(&self.pending).clear();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events.closed();
        }
        debug!(url = %self.url, "Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}
