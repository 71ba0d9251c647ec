//! Public connection handle.

use crate::config::ConnectionOptions;
use crate::coordinator::AuthFlowCoordinator;
use crate::error::McpResult;
use crate::machine::Inner;
use crate::protocol::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource};
use crate::snapshot::{ConnectionState, SessionSnapshot};
use crate::transport::{DefaultTransportFactory, TransportFactory, TransportSelector};
use mcplink_auth::{AuthProvider, AuthStorage, CallbackChannel, OAuthProvider};
use mcplink_util::SessionLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

/// A managed connection to one MCP server.
///
/// Cloning is cheap; clones share the same connection. Creating one does no
/// I/O: call [`connect`](Self::connect) to start. Observe progress through
/// [`snapshot`](Self::snapshot), [`subscribe`](Self::subscribe) or
/// [`state_changes`](Self::state_changes).
///
/// ```no_run
/// use mcplink_client::{ConnectionOptions, McpConnection};
///
/// # async fn run() -> mcplink_client::McpResult<()> {
/// let connection = McpConnection::new(ConnectionOptions::new("https://mcp.example.com/mcp"))?;
/// connection.connect().await;
///
/// let snapshot = connection.snapshot();
/// for tool in &snapshot.tools {
///     println!("{}", tool.name);
/// }
/// connection.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct McpConnection {
    inner: Arc<Inner>,
}

impl McpConnection {
    /// Create a connection with the built-in transports and OAuth provider.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: ConnectionOptions) -> McpResult<Self> {
        McpConnectionBuilder::new(options).build()
    }

    pub fn builder(options: ConnectionOptions) -> McpConnectionBuilder {
        McpConnectionBuilder::new(options)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receive every published snapshot (latest value semantics).
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.subscribe()
    }

    /// Receive every state the connection enters, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_changes()
    }

    /// Channel that delivers authorization completion messages.
    pub fn callback_channel(&self) -> CallbackChannel {
        self.inner.coordinator().channel().clone()
    }

    /// Start a connect sequence. A no-op while one is already running.
    pub async fn connect(&self) {
        self.inner.connect().await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> McpResult<CallToolResult> {
        self.inner.call_tool(name, arguments).await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.inner.list_resources().await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.inner.read_resource(uri).await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.inner.list_prompts().await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        self.inner.get_prompt(name, arguments).await
    }

    /// Retry after a failure. Ignored (with a warning) in any other state.
    pub async fn retry(&self) {
        self.inner.retry().await
    }

    /// Close the transport and reset to `discovering`.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Authenticate as appropriate for the current state.
    ///
    /// - `failed`: same as [`retry`](Self::retry)
    /// - `pending_auth`: run the authorization flow
    /// - `authenticating`, `ready`: nothing to do
    /// - otherwise: [`connect`](Self::connect)
    pub async fn authenticate(&self) {
        self.inner.authenticate().await
    }

    /// Remove stored credentials for this server and disconnect.
    ///
    /// Returns the number of removed storage entries.
    pub async fn clear_storage(&self) -> McpResult<usize> {
        self.inner.clear_storage().await
    }

    /// Tear the connection down for good.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

/// Builder for connections with custom collaborators.
pub struct McpConnectionBuilder {
    options: ConnectionOptions,
    factory: Option<Arc<dyn TransportFactory>>,
    provider: Option<Arc<dyn AuthProvider>>,
    storage: Option<Arc<AuthStorage>>,
    channel: Option<CallbackChannel>,
}

impl McpConnectionBuilder {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            factory: None,
            provider: None,
            storage: None,
            channel: None,
        }
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use `provider` instead of an [`OAuthProvider`].
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Storage for the default OAuth provider.
    pub fn with_storage(mut self, storage: Arc<AuthStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share a callback channel, e.g. with a [`mcplink_auth::CallbackServer`].
    pub fn with_callback_channel(mut self, channel: CallbackChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> McpResult<McpConnection> {
        let options = self.options;
        options.validate()?;

        let log = Arc::new(SessionLog::new(options.debug));
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let storage = match self.storage {
                    Some(storage) => storage,
                    None => Arc::new(AuthStorage::new().unwrap_or_else(|e| {
                        warn!(error = %e, "No auth storage directory, keeping tokens in memory");
                        AuthStorage::memory()
                    })),
                };
                let mut provider = OAuthProvider::new(options.provider_config(), storage);
                if let Some(handler) = options.on_popup_window.clone() {
                    provider = provider.with_popup_handler(handler);
                }
                Arc::new(provider)
            }
        };

        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultTransportFactory));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let selector = TransportSelector::new(factory, events_tx, log.clone());
        let coordinator = AuthFlowCoordinator::new(
            provider,
            self.channel.unwrap_or_default(),
            options.origin_policy(),
            options.auth_timeout(),
        );

        Ok(McpConnection {
            inner: Inner::spawn(options, log, selector, events_rx, coordinator),
        })
    }
}

impl std::fmt::Debug for McpConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnectionBuilder")
            .field("options", &self.options)
            .field("custom_factory", &self.factory.is_some())
            .field("custom_provider", &self.provider.is_some())
            .finish()
    }
}
