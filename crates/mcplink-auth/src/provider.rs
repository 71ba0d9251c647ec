//! The authorization provider boundary and the `authorize` operation.
//!
//! The connection state machine only ever talks to an [`AuthProvider`]; the
//! concrete OAuth implementation lives in [`crate::oauth`].

use crate::error::{AuthError, AuthResult};
use crate::oauth::OAuthTokens;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handler invoked with an authorization URL to open it for the user.
///
/// Returns `false` when the window could not be opened (e.g. a blocked
/// popup), which aborts the authorization attempt.
#[derive(Clone)]
pub struct PopupHandler(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl PopupHandler {
    pub fn new(handler: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// Ask the host to open `url`.
    pub fn open(&self, url: &str) -> bool {
        (self.0)(url)
    }
}

impl fmt::Debug for PopupHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PopupHandler(..)")
    }
}

/// Result of a single [`authorize`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Usable tokens are now stored; reconnect immediately.
    Authorized,
    /// The user was sent to the authorization server; completion arrives
    /// later as a callback message.
    Redirect,
}

/// Issues authorization URLs and owns the tokens for one MCP server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The MCP server these credentials belong to.
    fn server_url(&self) -> String;

    /// Currently stored tokens, if any.
    async fn tokens(&self) -> AuthResult<Option<OAuthTokens>>;

    /// Try to obtain fresh tokens without user interaction.
    ///
    /// Returns `false` when there is nothing to refresh with.
    async fn refresh_tokens(&self) -> AuthResult<bool>;

    /// Build (and remember) the URL the user must visit to authorize.
    async fn prepare_authorization_url(&self) -> AuthResult<String>;

    /// Send the user to `url`.
    async fn redirect_to_authorization(&self, url: &str) -> AuthResult<()>;

    /// Remove every stored entry for this server. Returns how many were removed.
    async fn clear_storage(&self) -> AuthResult<usize>;

    /// The most recently prepared authorization URL.
    async fn last_attempted_auth_url(&self) -> Option<String>;
}

/// Run one authorization attempt against `provider`.
///
/// Called after the server rejected the current credentials: a refresh is
/// tried first, and only if that is not possible is the user redirected.
pub async fn authorize(provider: &dyn AuthProvider) -> AuthResult<AuthOutcome> {
    let server_url = provider.server_url();

    match provider.refresh_tokens().await {
        Ok(true) => {
            info!(server = %server_url, "Refreshed OAuth tokens");
            return Ok(AuthOutcome::Authorized);
        }
        Ok(false) => {
            debug!(server = %server_url, "No refresh token available");
        }
        Err(e) => {
            warn!(server = %server_url, error = %e, "Token refresh failed, starting new authorization");
        }
    }

    let url = provider.prepare_authorization_url().await?;
    if url.is_empty() {
        return Err(AuthError::Failed(
            "authorization server returned no authorization URL".to_string(),
        ));
    }

    provider.redirect_to_authorization(&url).await?;
    info!(server = %server_url, "Redirected to authorization server");
    Ok(AuthOutcome::Redirect)
}
