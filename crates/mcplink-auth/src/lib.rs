//! Authorization for remote MCP servers.
//!
//! - [`AuthProvider`]: the boundary the connection state machine talks to,
//!   plus the [`authorize`] operation that runs one authorization attempt
//! - [`OAuthProvider`]: OAuth 2.0 with metadata discovery, dynamic client
//!   registration and PKCE
//! - [`AuthStorage`]: prefix-keyed string storage for tokens and flow state
//! - [`CallbackChannel`]: delivery of `mcp_auth_callback` completion messages,
//!   filtered by origin
//! - [`CallbackServer`]: loopback listener for the OAuth redirect URI
//!
//! # Storage Location
//!
//! File-backed storage defaults to `auth.json` in the mcplink state directory
//! (e.g. `~/.local/share/mcplink/auth.json` on Linux), created with 0600
//! permissions on Unix.
//!
//! # Example
//!
//! ```no_run
//! use mcplink_auth::{authorize, AuthOutcome, AuthStorage, OAuthProvider, OAuthProviderConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> mcplink_auth::AuthResult<()> {
//! let storage = Arc::new(AuthStorage::new()?);
//! let config = OAuthProviderConfig::new(
//!     "https://mcp.example.com/mcp",
//!     "http://127.0.0.1:19876/oauth/callback",
//! );
//! let provider = OAuthProvider::new(config, storage);
//!
//! match authorize(&provider).await? {
//!     AuthOutcome::Authorized => println!("tokens refreshed"),
//!     AuthOutcome::Redirect => println!("waiting for the browser"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod error;
pub mod oauth;
pub mod provider;
pub mod server;
mod storage;

pub use callback::{
    AuthSignal, CallbackChannel, CallbackEnvelope, CallbackMessage, CallbackSubscription,
    OriginPolicy, CALLBACK_MESSAGE_TYPE,
};
pub use error::{AuthError, AuthResult};
pub use oauth::{OAuthProvider, OAuthProviderConfig, OAuthTokens, DEFAULT_STORAGE_KEY_PREFIX};
pub use provider::{authorize, AuthOutcome, AuthProvider, PopupHandler};
pub use server::CallbackServer;
pub use storage::AuthStorage;

/// Get the default auth storage path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_storage_path() -> Option<std::path::PathBuf> {
    mcplink_util::log::default_state_dir().map(|p| p.join("auth.json"))
}
