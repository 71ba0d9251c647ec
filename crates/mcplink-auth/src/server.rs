//! Loopback HTTP server receiving OAuth redirects.
//!
//! The authorization server redirects the browser to `callbackUrl` with
//! `code` and `state`. The server looks up the provider that issued `state`,
//! exchanges the code, shows a result page and posts the completion message
//! on the [`CallbackChannel`] under the host origin.

use crate::callback::{CallbackChannel, CallbackMessage};
use crate::error::{AuthError, AuthResult};
use crate::oauth::OAuthProvider;
use crate::storage::AuthStorage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

/// Pending `state` records older than this are rejected.
const STATE_MAX_AGE_SECS: u64 = 10 * 60;

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>mcplink - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #10141f; color: #e5e7eb; }
    .box { text-align: center; padding: 2rem; }
    h1 { color: #34d399; }
  </style>
</head>
<body>
  <div class="box">
    <h1>Authorization Successful</h1>
    <p>The MCP connection will resume automatically. You can close this window.</p>
  </div>
  <script>setTimeout(() => window.close(), 1500);</script>
</body>
</html>"#;

fn html_error(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>mcplink - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #10141f; color: #e5e7eb; }}
    .box {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #f87171; }}
    pre {{ color: #fca5a5; white-space: pre-wrap; }}
  </style>
</head>
<body>
  <div class="box">
    <h1>Authorization Failed</h1>
    <pre>{}</pre>
  </div>
</body>
</html>"#,
        html_escape(message)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Everything a request handler needs.
struct Handler {
    path: String,
    host_origin: String,
    storage_key_prefix: String,
    storage: Arc<AuthStorage>,
    channel: CallbackChannel,
}

/// Loopback listener for the OAuth redirect URI.
pub struct CallbackServer {
    bind_addr: SocketAddr,
    handler: Arc<Handler>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl CallbackServer {
    /// Create a server for `callback_url`, which must be an `http` loopback URL.
    pub fn new(
        callback_url: &str,
        host_origin: impl Into<String>,
        storage_key_prefix: impl Into<String>,
        storage: Arc<AuthStorage>,
        channel: CallbackChannel,
    ) -> AuthResult<Self> {
        let url = Url::parse(callback_url)
            .map_err(|e| AuthError::InvalidUrl(format!("{callback_url}: {e}")))?;
        if url.scheme() != "http" {
            return Err(AuthError::InvalidUrl(format!(
                "{callback_url}: callback server only serves http"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::InvalidUrl(format!("{callback_url}: missing host")))?;
        let ip: std::net::IpAddr = match host {
            "localhost" => [127, 0, 0, 1].into(),
            other => other
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse()
                .map_err(|_| {
                    AuthError::InvalidUrl(format!("{callback_url}: host must be a loopback address"))
                })?,
        };
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            handler: Arc::new(Handler {
                path: url.path().to_string(),
                host_origin: host_origin.into(),
                storage_key_prefix: storage_key_prefix.into(),
                storage,
                channel,
            }),
            shutdown_tx: Mutex::new(None),
            local_addr: Arc::new(RwLock::new(None)),
        })
    }

    /// Start listening. Returns the bound address; idempotent while running.
    pub async fn start(&self) -> AuthResult<SocketAddr> {
        if let Some(addr) = *self.local_addr.read().await {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, path = %self.handler.path, "OAuth callback server started");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.local_addr.write().await = Some(addr);

        let handler = self.handler.clone();
        let local_addr = self.local_addr.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let handler = handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle_connection(stream).await {
                                        warn!(error = %e, "Error handling OAuth callback");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Error accepting connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("OAuth callback server shutting down");
                        break;
                    }
                }
            }

            *local_addr.write().await = None;
        });

        Ok(addr)
    }

    /// Address the server is listening on, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.local_addr.read().await.is_some()
    }

    pub async fn stop(&self) {
        if let Some(sender) = self.shutdown_tx.lock().await.take() {
            let _ = sender.send(());
        }
    }
}

impl Handler {
    async fn handle_connection(&self, mut stream: tokio::net::TcpStream) -> AuthResult<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        let (status, content_type, body) = self.respond(&request).await;
        let response = http_response(status, content_type, &body);
        stream.write_all(response.as_bytes()).await.ok();
        Ok(())
    }

    async fn respond(&self, request: &str) -> (u16, &'static str, String) {
        let first_line = request.lines().next().unwrap_or("");
        let parts: Vec<&str> = first_line.split_whitespace().collect();
        if parts.len() < 2 {
            return (400, "text/plain", "Bad Request".to_string());
        }
        if parts[0] != "GET" {
            return (405, "text/plain", "Method Not Allowed".to_string());
        }

        let Ok(parsed) = Url::parse(&format!("http://127.0.0.1{}", parts[1])) else {
            return (400, "text/plain", "Invalid URL".to_string());
        };
        if parsed.path() != self.path {
            return (404, "text/plain", "Not Found".to_string());
        }

        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        debug!(
            has_code = params.contains_key("code"),
            error = ?params.get("error"),
            "Received OAuth callback"
        );

        match self.complete(&params).await {
            Ok(()) => {
                self.post(&CallbackMessage::success());
                (200, "text/html", HTML_SUCCESS.to_string())
            }
            Err(message) => {
                error!(error = %message, "OAuth callback failed");
                self.post(&CallbackMessage::failure(message.clone()));
                (400, "text/html", html_error(&message))
            }
        }
    }

    async fn complete(&self, params: &HashMap<String, String>) -> Result<(), String> {
        if let Some(err) = params.get("error") {
            return Err(params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| err.clone()));
        }

        let state = params
            .get("state")
            .ok_or_else(|| "Missing required state parameter".to_string())?;
        let code = params
            .get("code")
            .ok_or_else(|| "No authorization code provided".to_string())?;

        let pending =
            OAuthProvider::take_pending_state(&self.storage, &self.storage_key_prefix, state)
                .await
                .map_err(|e| e.to_string())?;

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if now.saturating_sub(pending.created_at) > STATE_MAX_AGE_SECS {
            return Err(AuthError::InvalidState(state.clone()).to_string());
        }

        OAuthProvider::new(pending.provider, self.storage.clone())
            .finish_authorization(code)
            .await
            .map_err(|e| e.to_string())
    }

    fn post(&self, message: &CallbackMessage) {
        let delivered = self.channel.post_message(self.host_origin.clone(), message);
        debug!(delivered, success = message.success, "Posted authorization result");
    }
}

impl std::fmt::Debug for CallbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServer")
            .field("bind_addr", &self.bind_addr)
            .field("path", &self.handler.path)
            .finish()
    }
}
