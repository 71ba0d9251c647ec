//! OAuth 2.0 authorization provider for remote MCP servers.
//!
//! Implements authorization-server metadata discovery, dynamic client
//! registration, PKCE (S256) authorization URLs, code exchange and token
//! refresh. All state is kept in an [`AuthStorage`] under keys derived from
//! the configured prefix and a hash of the server URL.

use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthProvider, PopupHandler};
use crate::storage::AuthStorage;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Default prefix for storage keys.
pub const DEFAULT_STORAGE_KEY_PREFIX: &str = "mcp:auth";

/// OAuth tokens as returned by a token endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Tokens stored with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp when the access token expires.
    pub expires_at: Option<u64>,
    pub scope: Option<String>,
}

/// Client information (from dynamic registration or configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

/// The subset of RFC 8414 authorization server metadata that is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
}

impl AuthServerMetadata {
    /// Endpoints assumed when the server publishes no metadata.
    pub fn defaults_for(origin: &str) -> Self {
        Self {
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
        }
    }
}

/// Provider configuration.
///
/// Serializable because it is stored alongside the OAuth `state` parameter, so
/// the callback handler can rebuild the provider that started the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderConfig {
    /// MCP server URL.
    pub server_url: String,
    /// Prefix for all storage keys.
    pub storage_key_prefix: String,
    /// Client name used for dynamic registration.
    pub client_name: String,
    /// Client URI used for dynamic registration.
    pub client_uri: String,
    /// Redirect URI registered with the authorization server.
    pub callback_url: String,
    /// Pre-registered client ID (skips dynamic registration).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Pre-registered client secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Requested scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthProviderConfig {
    pub fn new(server_url: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            storage_key_prefix: DEFAULT_STORAGE_KEY_PREFIX.to_string(),
            client_name: "mcplink".to_string(),
            client_uri: "https://github.com/mcplink/mcplink".to_string(),
            callback_url: callback_url.into(),
            client_id: None,
            client_secret: None,
            scope: None,
        }
    }
}

/// Record stored under the OAuth `state` parameter while a flow is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingState {
    pub server_url_hash: String,
    pub provider: OAuthProviderConfig,
    /// Unix timestamp (seconds) when the flow was started.
    pub created_at: u64,
}

/// Storage key for a pending `state` parameter.
pub fn state_key(prefix: &str, state: &str) -> String {
    format!("{prefix}:state_{state}")
}

/// OAuth provider backed by [`AuthStorage`].
pub struct OAuthProvider {
    config: OAuthProviderConfig,
    server_hash: String,
    storage: Arc<AuthStorage>,
    http: reqwest::Client,
    popup: Option<PopupHandler>,
    metadata: RwLock<Option<AuthServerMetadata>>,
}

impl OAuthProvider {
    /// Create a new OAuth provider.
    pub fn new(config: OAuthProviderConfig, storage: Arc<AuthStorage>) -> Self {
        let server_hash = hash_server_url(&config.server_url);
        Self {
            config,
            server_hash,
            storage,
            http: reqwest::Client::new(),
            popup: None,
            metadata: RwLock::new(None),
        }
    }

    /// Set the handler used to open authorization URLs.
    pub fn with_popup_handler(mut self, handler: PopupHandler) -> Self {
        self.popup = Some(handler);
        self
    }

    /// Provider configuration.
    pub fn config(&self) -> &OAuthProviderConfig {
        &self.config
    }

    fn key(&self, name: &str) -> String {
        format!(
            "{}_{}_{}",
            self.config.storage_key_prefix, self.server_hash, name
        )
    }

    /// Client metadata sent for dynamic registration.
    pub fn client_metadata(&self) -> HashMap<String, serde_json::Value> {
        let mut metadata = HashMap::new();
        metadata.insert(
            "redirect_uris".to_string(),
            serde_json::json!([self.config.callback_url]),
        );
        metadata.insert(
            "client_name".to_string(),
            serde_json::json!(self.config.client_name),
        );
        metadata.insert(
            "client_uri".to_string(),
            serde_json::json!(self.config.client_uri),
        );
        metadata.insert(
            "grant_types".to_string(),
            serde_json::json!(["authorization_code", "refresh_token"]),
        );
        metadata.insert("response_types".to_string(), serde_json::json!(["code"]));

        let auth_method = if self.config.client_secret.is_some() {
            "client_secret_post"
        } else {
            "none"
        };
        metadata.insert(
            "token_endpoint_auth_method".to_string(),
            serde_json::json!(auth_method),
        );

        metadata
    }

    /// Authorization server metadata, discovered once per provider.
    pub async fn metadata(&self) -> AuthResult<AuthServerMetadata> {
        if let Some(metadata) = self.metadata.read().await.clone() {
            return Ok(metadata);
        }

        let origin = server_origin(&self.config.server_url)?;
        let well_known = format!("{origin}/.well-known/oauth-authorization-server");

        let discovered = match self.http.get(&well_known).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<AuthServerMetadata>().await {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        warn!(url = %well_known, error = %e, "Invalid authorization server metadata");
                        None
                    }
                }
            }
            Ok(response) => {
                debug!(url = %well_known, status = %response.status(), "No authorization server metadata");
                None
            }
            Err(e) => {
                debug!(url = %well_known, error = %e, "Metadata discovery failed");
                None
            }
        };

        let metadata = discovered.unwrap_or_else(|| AuthServerMetadata::defaults_for(&origin));
        *self.metadata.write().await = Some(metadata.clone());
        Ok(metadata)
    }

    /// Get client information from configuration or storage.
    pub async fn client_info(&self) -> AuthResult<Option<ClientInfo>> {
        if let Some(ref client_id) = self.config.client_id {
            return Ok(Some(ClientInfo {
                client_id: client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                client_id_issued_at: None,
                client_secret_expires_at: None,
            }));
        }

        let Some(info) = self
            .storage
            .get_json::<ClientInfo>(&self.key("client_info"))
            .await?
        else {
            return Ok(None);
        };

        if let Some(expires_at) = info.client_secret_expires_at {
            // Zero means "never expires" per RFC 7591.
            if expires_at != 0 && expires_at < now_secs() {
                info!(server = %self.config.server_url, "Client secret expired");
                return Ok(None);
            }
        }

        Ok(Some(info))
    }

    /// Save client information from dynamic registration.
    pub async fn save_client_info(&self, info: &ClientInfo) -> AuthResult<()> {
        self.storage.set_json(&self.key("client_info"), info).await?;
        info!(server = %self.config.server_url, "Saved dynamically registered client");
        Ok(())
    }

    async fn ensure_client(&self, metadata: &AuthServerMetadata) -> AuthResult<ClientInfo> {
        if let Some(info) = self.client_info().await? {
            return Ok(info);
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            AuthError::Registration(
                "server does not support dynamic client registration".to_string(),
            )
        })?;

        let response = self
            .http
            .post(endpoint)
            .json(&self.client_metadata())
            .send()
            .await
            .map_err(|e| AuthError::Registration(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::Registration(format!("{status}: {text}")));
        }

        let info: ClientInfo = response
            .json()
            .await
            .map_err(|e| AuthError::Registration(format!("invalid response: {e}")))?;
        self.save_client_info(&info).await?;
        Ok(info)
    }

    /// Get stored tokens.
    pub async fn stored_tokens(&self) -> AuthResult<Option<StoredTokens>> {
        self.storage.get_json(&self.key("tokens")).await
    }

    /// Save tokens.
    pub async fn save_tokens(&self, tokens: OAuthTokens) -> AuthResult<()> {
        let now = now_secs();
        let stored = StoredTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|exp| now + exp),
            scope: tokens.scope,
        };
        self.storage.set_json(&self.key("tokens"), &stored).await?;
        info!(server = %self.config.server_url, "Saved OAuth tokens");
        Ok(())
    }

    /// Generate PKCE code verifier.
    pub fn generate_code_verifier() -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        URL_SAFE_NO_PAD.encode(&bytes)
    }

    /// Generate PKCE code challenge from verifier.
    pub fn generate_code_challenge(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Generate OAuth state parameter.
    pub fn generate_state() -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        URL_SAFE_NO_PAD.encode(&bytes)
    }

    /// Complete a pending authorization by exchanging `code` for tokens.
    pub async fn finish_authorization(&self, code: &str) -> AuthResult<()> {
        let verifier = self
            .storage
            .get(&self.key("code_verifier"))
            .await?
            .ok_or_else(|| AuthError::MissingCodeVerifier(self.config.server_url.clone()))?;

        let metadata = self.metadata().await?;
        let client = self.client_info().await?.ok_or_else(|| {
            AuthError::Failed("no client information for token exchange".to_string())
        })?;

        let tokens = exchange_code(
            &self.http,
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            code,
            &self.config.callback_url,
            &verifier,
        )
        .await?;

        self.save_tokens(tokens).await?;
        self.storage.remove(&self.key("code_verifier")).await?;
        Ok(())
    }

    /// Look up the provider configuration recorded for a pending `state`.
    ///
    /// The record is consumed: a state parameter can only be used once.
    pub async fn take_pending_state(
        storage: &AuthStorage,
        prefix: &str,
        state: &str,
    ) -> AuthResult<PendingState> {
        let key = state_key(prefix, state);
        let record = storage
            .get_json::<PendingState>(&key)
            .await?
            .ok_or_else(|| AuthError::InvalidState(state.to_string()))?;
        storage.remove(&key).await?;
        Ok(record)
    }
}

#[async_trait]
impl AuthProvider for OAuthProvider {
    fn server_url(&self) -> String {
        self.config.server_url.clone()
    }

    async fn tokens(&self) -> AuthResult<Option<OAuthTokens>> {
        let now = now_secs();
        Ok(self.stored_tokens().await?.map(|t| OAuthTokens {
            access_token: t.access_token,
            token_type: default_token_type(),
            refresh_token: t.refresh_token,
            expires_in: t.expires_at.map(|exp| exp.saturating_sub(now)),
            scope: t.scope,
        }))
    }

    async fn refresh_tokens(&self) -> AuthResult<bool> {
        let Some(stored) = self.stored_tokens().await? else {
            return Ok(false);
        };
        let Some(refresh_token) = stored.refresh_token else {
            return Ok(false);
        };
        let Some(client) = self.client_info().await? else {
            return Ok(false);
        };

        let metadata = self.metadata().await?;
        let mut tokens = refresh_tokens(
            &self.http,
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            &refresh_token,
        )
        .await?;

        // Servers may omit the refresh token when it is not rotated.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        self.save_tokens(tokens).await?;
        Ok(true)
    }

    async fn prepare_authorization_url(&self) -> AuthResult<String> {
        let metadata = self.metadata().await?;
        let client = self.ensure_client(&metadata).await?;

        let verifier = Self::generate_code_verifier();
        let challenge = Self::generate_code_challenge(&verifier);
        let state = Self::generate_state();

        self.storage
            .set(&self.key("code_verifier"), verifier)
            .await?;
        self.storage
            .set_json(
                &state_key(&self.config.storage_key_prefix, &state),
                &PendingState {
                    server_url_hash: self.server_hash.clone(),
                    provider: self.config.clone(),
                    created_at: now_secs(),
                },
            )
            .await?;

        let url = build_auth_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &self.config.callback_url,
            self.config.scope.as_deref(),
            &state,
            &challenge,
        );

        self.storage.set(&self.key("last_auth_url"), url.clone()).await?;
        Ok(url)
    }

    async fn redirect_to_authorization(&self, url: &str) -> AuthResult<()> {
        match &self.popup {
            Some(handler) => {
                if !handler.open(url) {
                    return Err(AuthError::PopupBlocked {
                        url: url.to_string(),
                    });
                }
                debug!(server = %self.config.server_url, "Opened authorization window");
            }
            None => {
                info!(url = %url, "No popup handler configured; open the authorization URL manually");
            }
        }
        Ok(())
    }

    async fn clear_storage(&self) -> AuthResult<usize> {
        let own_prefix = format!("{}_{}_", self.config.storage_key_prefix, self.server_hash);
        let state_prefix = format!("{}:state_", self.config.storage_key_prefix);
        let hash = self.server_hash.clone();

        let removed = self
            .storage
            .remove_where(|key, value| {
                if key.starts_with(&own_prefix) {
                    return true;
                }
                key.starts_with(&state_prefix)
                    && serde_json::from_str::<PendingState>(value)
                        .map(|record| record.server_url_hash == hash)
                        .unwrap_or(false)
            })
            .await?;

        *self.metadata.write().await = None;
        info!(server = %self.config.server_url, removed, "Cleared OAuth storage");
        Ok(removed)
    }

    async fn last_attempted_auth_url(&self) -> Option<String> {
        self.storage
            .get(&self.key("last_auth_url"))
            .await
            .ok()
            .flatten()
    }
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server_url", &self.config.server_url)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Stable short hash of a server URL, used to namespace storage keys.
pub fn hash_server_url(server_url: &str) -> String {
    let digest = Sha256::digest(server_url.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..9])
}

/// Origin (`scheme://host[:port]`) of a URL.
pub fn server_origin(url: &str) -> AuthResult<String> {
    let parsed = Url::parse(url).map_err(|e| AuthError::InvalidUrl(format!("{url}: {e}")))?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(AuthError::InvalidUrl(format!("{url}: opaque origin")));
    }
    Ok(origin.ascii_serialization())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Exchange authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params, "Token exchange").await
}

/// Refresh tokens using refresh token.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params, "Token refresh").await
}

async fn token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    params: &[(&str, &str)],
    what: &str,
) -> AuthResult<OAuthTokens> {
    let response = http
        .post(token_endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| AuthError::Token(format!("{what} request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::Token(format!("{what} failed: {text}")));
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::Token(format!("Invalid {what} response: {e}")))
}
