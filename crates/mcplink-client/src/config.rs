//! Connection options.
//!
//! Options can be built in code with the `with_*` methods or loaded from a
//! JSON document using the same camelCase names:
//!
//! ```json
//! {
//!   "url": "https://mcp.example.com/mcp",
//!   "transportType": "auto",
//!   "autoRetry": 5000,
//!   "autoReconnect": true,
//!   "customHeaders": { "X-Team": "tools" }
//! }
//! ```

use crate::error::{McpError, McpResult};
use crate::protocol::Implementation;
use crate::transport::TransportPreference;
use mcplink_auth::{OAuthProviderConfig, OriginPolicy, PopupHandler, DEFAULT_STORAGE_KEY_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST_ORIGIN: &str = "http://127.0.0.1:19876";
pub const DEFAULT_CLIENT_URI: &str = "https://github.com/mcplink/mcplink";
pub const CALLBACK_PATH: &str = "/oauth/callback";

const DEFAULT_AUTO_RETRY_MS: u64 = 5000;
const DEFAULT_AUTO_RECONNECT_MS: u64 = 3000;
const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// A delay policy given either as an on/off switch or a delay in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    Toggle(bool),
    Milliseconds(u64),
}

impl RetryPolicy {
    /// Effective delay, `None` when disabled. `true` uses `default_ms`.
    pub fn delay(&self, default_ms: u64) -> Option<Duration> {
        match *self {
            RetryPolicy::Toggle(false) => None,
            RetryPolicy::Toggle(true) => Some(Duration::from_millis(default_ms)),
            RetryPolicy::Milliseconds(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Options for one MCP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// MCP server URL.
    pub url: String,
    /// Client name used for OAuth dynamic registration.
    pub client_name: String,
    /// Client URI used for OAuth dynamic registration.
    pub client_uri: String,
    /// Origin of the host; callback messages from it are trusted.
    pub host_origin: String,
    /// OAuth redirect URI. Defaults to `{hostOrigin}/oauth/callback`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub storage_key_prefix: String,
    /// `clientInfo` sent in the initialize handshake.
    pub client_config: Implementation,
    pub custom_headers: HashMap<String, String>,
    /// Keep debug entries in the session log.
    pub debug: bool,
    pub auto_retry: RetryPolicy,
    pub auto_reconnect: RetryPolicy,
    pub transport_type: TransportPreference,
    /// Stop at `pending_auth` instead of opening the authorization page.
    pub prevent_auto_auth: bool,
    /// Extra origins allowed to post callback messages.
    pub allowed_origins: Vec<String>,
    pub auth_timeout_ms: u64,
    pub request_timeout_secs: u64,
    /// Opens authorization URLs for the user.
    #[serde(skip)]
    pub on_popup_window: Option<PopupHandler>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_name: "mcplink".to_string(),
            client_uri: DEFAULT_CLIENT_URI.to_string(),
            host_origin: DEFAULT_HOST_ORIGIN.to_string(),
            callback_url: None,
            storage_key_prefix: DEFAULT_STORAGE_KEY_PREFIX.to_string(),
            client_config: Implementation::default(),
            custom_headers: HashMap::new(),
            debug: false,
            auto_retry: RetryPolicy::Toggle(false),
            auto_reconnect: RetryPolicy::Milliseconds(DEFAULT_AUTO_RECONNECT_MS),
            transport_type: TransportPreference::Auto,
            prevent_auto_auth: false,
            allowed_origins: Vec::new(),
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            on_popup_window: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport_type = transport;
        self
    }

    pub fn with_auto_retry(mut self, policy: RetryPolicy) -> Self {
        self.auto_retry = policy;
        self
    }

    pub fn with_auto_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.auto_reconnect = policy;
        self
    }

    pub fn with_prevent_auto_auth(mut self, prevent: bool) -> Self {
        self.prevent_auto_auth = prevent;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_host_origin(mut self, origin: impl Into<String>) -> Self {
        self.host_origin = origin.into();
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_popup_handler(mut self, handler: PopupHandler) -> Self {
        self.on_popup_window = Some(handler);
        self
    }

    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> McpResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| McpError::InvalidConfig(format!("invalid options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub async fn load(path: &Path) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| McpError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.url.trim().is_empty() {
            return Err(McpError::InvalidConfig("url is required".to_string()));
        }
        Ok(())
    }

    pub fn resolved_callback_url(&self) -> String {
        self.callback_url.clone().unwrap_or_else(|| {
            format!("{}{CALLBACK_PATH}", self.host_origin.trim_end_matches('/'))
        })
    }

    pub fn auto_retry_delay(&self) -> Option<Duration> {
        self.auto_retry.delay(DEFAULT_AUTO_RETRY_MS)
    }

    pub fn auto_reconnect_delay(&self) -> Option<Duration> {
        self.auto_reconnect.delay(DEFAULT_AUTO_RECONNECT_MS)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Configuration for the OAuth provider of this connection's server.
    pub fn provider_config(&self) -> OAuthProviderConfig {
        OAuthProviderConfig {
            storage_key_prefix: self.storage_key_prefix.clone(),
            client_name: self.client_name.clone(),
            client_uri: self.client_uri.clone(),
            ..OAuthProviderConfig::new(self.url.clone(), self.resolved_callback_url())
        }
    }

    /// Origins accepted for callback messages.
    pub fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::new(&self.host_origin, &self.allowed_origins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::new("https://mcp.example.com/mcp");
        assert_eq!(options.transport_type, TransportPreference::Auto);
        assert_eq!(options.auto_retry_delay(), None);
        assert_eq!(options.auto_reconnect_delay(), Some(Duration::from_millis(3000)));
        assert_eq!(options.auth_timeout(), Duration::from_secs(300));
        assert_eq!(options.storage_key_prefix, "mcp:auth");
        assert_eq!(
            options.resolved_callback_url(),
            "http://127.0.0.1:19876/oauth/callback"
        );
    }

    #[test]
    fn test_retry_policy_forms() {
        let options = ConnectionOptions::from_json(
            r#"{"url": "https://x.example", "autoRetry": true, "autoReconnect": 1000}"#,
        )
        .unwrap();
        assert_eq!(options.auto_retry_delay(), Some(Duration::from_millis(5000)));
        assert_eq!(options.auto_reconnect_delay(), Some(Duration::from_millis(1000)));

        let options = ConnectionOptions::from_json(
            r#"{"url": "https://x.example", "autoRetry": 250, "autoReconnect": false}"#,
        )
        .unwrap();
        assert_eq!(options.auto_retry_delay(), Some(Duration::from_millis(250)));
        assert_eq!(options.auto_reconnect_delay(), None);
    }

    #[test]
    fn test_from_json_fields() {
        let options = ConnectionOptions::from_json(
            r#"{
                "url": "https://mcp.example.com/mcp",
                "transportType": "sse",
                "preventAutoAuth": true,
                "customHeaders": {"X-Team": "tools"},
                "clientConfig": {"name": "inspector", "version": "2.0.0"},
                "allowedOrigins": ["https://auth.example.com"]
            }"#,
        )
        .unwrap();
        assert_eq!(options.transport_type, TransportPreference::Sse);
        assert!(options.prevent_auto_auth);
        assert_eq!(options.custom_headers["X-Team"], "tools");
        assert_eq!(options.client_config.name, "inspector");
        assert!(options.origin_policy().allows("https://auth.example.com"));
        assert!(options.origin_policy().allows("http://127.0.0.1:19876"));
        assert!(!options.origin_policy().allows("https://evil.example.com"));
    }

    #[test]
    fn test_url_required() {
        assert!(matches!(
            ConnectionOptions::from_json("{}"),
            Err(McpError::InvalidConfig(_))
        ));
        assert!(ConnectionOptions::from_json(r#"{"url": "https://x", "transportType": "ws"}"#).is_err());
    }

    #[test]
    fn test_provider_config() {
        let options = ConnectionOptions::new("https://mcp.example.com/mcp")
            .with_callback_url("http://localhost:4000/cb");
        let config = options.provider_config();
        assert_eq!(config.server_url, "https://mcp.example.com/mcp");
        assert_eq!(config.callback_url, "http://localhost:4000/cb");
        assert_eq!(config.client_name, "mcplink");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, r#"{"url": "https://mcp.example.com/mcp", "debug": true}"#).unwrap();

        let options = ConnectionOptions::load(&path).await.unwrap();
        assert!(options.debug);

        let missing = ConnectionOptions::load(&dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(McpError::InvalidConfig(_))));
    }
}
