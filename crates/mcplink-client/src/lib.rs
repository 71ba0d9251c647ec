//! Managed connections to remote MCP servers.
//!
//! [`McpConnection`] drives a connection through its lifecycle:
//!
//! - picks a transport (streamable HTTP, falling back once to legacy SSE)
//! - runs the initialize handshake and loads tools, resources and prompts
//! - hands 401s to the OAuth flow, waits for the callback, and reconnects
//! - retries failed connections and reconnects dropped ones on a timer
//!
//! Every change is published as an immutable [`SessionSnapshot`].
//!
//! # Example
//!
//! ```no_run
//! use mcplink_client::{ConnectionOptions, ConnectionState, McpConnection, TransportPreference};
//!
//! # async fn run() -> mcplink_client::McpResult<()> {
//! let options = ConnectionOptions::new("https://mcp.example.com/mcp")
//!     .with_transport(TransportPreference::Auto);
//! let connection = McpConnection::new(options)?;
//!
//! let mut updates = connection.subscribe();
//! connection.connect().await;
//! while updates.borrow_and_update().state != ConnectionState::Ready {
//!     if updates.changed().await.is_err() {
//!         break;
//!     }
//! }
//!
//! let result = connection
//!     .call_tool("echo", Some(serde_json::json!({"text": "hi"})))
//!     .await?;
//! println!("{}", result.text());
//! # Ok(())
//! # }
//! ```

pub mod config;
mod coordinator;
mod error;
mod facade;
mod machine;
pub mod protocol;
pub mod session;
mod snapshot;
pub mod transport;

pub use config::{ConnectionOptions, RetryPolicy};
pub use coordinator::AuthFlowCoordinator;
pub use error::{McpError, McpResult};
pub use facade::{McpConnection, McpConnectionBuilder};
pub use protocol::{
    CallToolResult, Content, GetPromptResult, Implementation, Prompt, ReadResourceResult,
    Resource, ResourceTemplate, Tool,
};
pub use snapshot::{ConnectionState, SessionSnapshot};
pub use transport::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TransportKind,
    TransportParams, TransportPreference,
};

pub use mcplink_util::{LogEntry, LogLevel};
