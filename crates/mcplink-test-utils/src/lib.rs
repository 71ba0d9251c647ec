//! Testing utilities for mcplink.
//!
//! - **Transports**: scripted fake servers behind the `Transport` trait
//! - **Auth**: a recording authorization provider
//! - **Observe**: helpers for waiting on connection state
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use mcplink_test_utils::{RecordingAuthProvider, ScriptedTransportFactory, ServerScript};
//!
//! let factory = Arc::new(
//!     ScriptedTransportFactory::new().with_script(TransportKind::Http, ServerScript::healthy()),
//! );
//! let connection = McpConnection::builder(ConnectionOptions::new("http://scripted/mcp"))
//!     .with_transport_factory(factory.clone())
//!     .with_auth_provider(Arc::new(RecordingAuthProvider::new("http://scripted/mcp")))
//!     .build()?;
//! connection.connect().await;
//! assert_eq!(factory.created_kinds(), vec![TransportKind::Http]);
//! ```

pub mod auth;
pub mod observe;
pub mod transports;

pub use auth::RecordingAuthProvider;
pub use observe::{drain_states, wait_for_state};
pub use transports::{ScriptedFailure, ScriptedTransport, ScriptedTransportFactory, ServerScript};
