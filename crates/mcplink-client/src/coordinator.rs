//! Authorization sub-flow driver.

use crate::error::{McpError, McpResult};
use mcplink_auth::{
    authorize, AuthError, AuthOutcome, AuthProvider, CallbackChannel, CallbackSubscription,
    OriginPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runs one authorization attempt per authorization failure.
///
/// Completion of a redirect arrives on the callback channel; subscriptions
/// made through [`subscribe`](Self::subscribe) only see messages from trusted
/// origins.
pub struct AuthFlowCoordinator {
    provider: Arc<dyn AuthProvider>,
    channel: CallbackChannel,
    policy: OriginPolicy,
    timeout: Duration,
}

impl AuthFlowCoordinator {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        channel: CallbackChannel,
        policy: OriginPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            channel,
            policy,
            timeout,
        }
    }

    pub fn provider(&self) -> &Arc<dyn AuthProvider> {
        &self.provider
    }

    pub fn channel(&self) -> &CallbackChannel {
        &self.channel
    }

    /// How long an attempt may stay in `authenticating`.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Listen for completion messages.
    pub fn subscribe(&self) -> CallbackSubscription {
        self.channel.subscribe(self.policy.clone())
    }

    /// Run the authorization operation against the provider.
    pub async fn run_auth(&self) -> McpResult<AuthOutcome> {
        debug!(server = %self.provider.server_url(), "Starting authorization");
        authorize(self.provider.as_ref()).await.map_err(flow_error)
    }

    /// Build an authorization URL for the user to open manually.
    pub async fn manual_url(&self) -> McpResult<String> {
        self.provider
            .prepare_authorization_url()
            .await
            .map_err(flow_error)
    }

    pub async fn last_url(&self) -> Option<String> {
        self.provider.last_attempted_auth_url().await
    }
}

fn flow_error(e: AuthError) -> McpError {
    match e {
        AuthError::PopupBlocked { url } => McpError::AuthFlow(format!(
            "Popup blocked; open {url} to authorize manually"
        )),
        other => McpError::AuthFlow(other.to_string()),
    }
}

impl std::fmt::Debug for AuthFlowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFlowCoordinator")
            .field("server", &self.provider.server_url())
            .field("timeout", &self.timeout)
            .finish()
    }
}
