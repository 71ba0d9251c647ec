//! Authorization provider double.

use async_trait::async_trait;
use mcplink_auth::{AuthError, AuthProvider, AuthResult, OAuthTokens};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// An [`AuthProvider`] that records calls and answers from configuration.
///
/// By default it has no tokens, cannot refresh, and "redirects" successfully
/// to `https://auth.example.com/authorize?state=test`.
#[derive(Debug)]
pub struct RecordingAuthProvider {
    server_url: String,
    auth_url: String,
    refresh: AtomicBool,
    popup_blocked: AtomicBool,
    tokens: Mutex<Option<OAuthTokens>>,
    stored_entries: AtomicUsize,
    last_url: Mutex<Option<String>>,
    refreshes: AtomicUsize,
    prepares: AtomicUsize,
    redirects: Mutex<Vec<String>>,
    clears: AtomicUsize,
}

impl RecordingAuthProvider {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_url: "https://auth.example.com/authorize?state=test".to_string(),
            refresh: AtomicBool::new(false),
            popup_blocked: AtomicBool::new(false),
            tokens: Mutex::new(None),
            stored_entries: AtomicUsize::new(0),
            last_url: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            redirects: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    /// Whether `refresh_tokens` succeeds.
    pub fn with_refresh(self, refresh: bool) -> Self {
        self.refresh.store(refresh, Ordering::SeqCst);
        self
    }

    /// Make `redirect_to_authorization` fail as if the popup was blocked.
    pub fn with_popup_blocked(self) -> Self {
        self.popup_blocked.store(true, Ordering::SeqCst);
        self
    }

    /// Pretend `count` entries are stored, with an access token.
    pub fn with_stored_entries(self, count: usize) -> Self {
        self.stored_entries.store(count, Ordering::SeqCst);
        *self.tokens.lock().unwrap() = Some(OAuthTokens {
            access_token: "test-token".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expires_in: None,
            scope: None,
        });
        self
    }

    pub fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// URLs passed to `redirect_to_authorization`.
    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn stored_entries(&self) -> usize {
        self.stored_entries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for RecordingAuthProvider {
    fn server_url(&self) -> String {
        self.server_url.clone()
    }

    async fn tokens(&self) -> AuthResult<Option<OAuthTokens>> {
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn refresh_tokens(&self) -> AuthResult<bool> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.refresh.load(Ordering::SeqCst))
    }

    async fn prepare_authorization_url(&self) -> AuthResult<String> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(self.auth_url.clone());
        Ok(self.auth_url.clone())
    }

    async fn redirect_to_authorization(&self, url: &str) -> AuthResult<()> {
        self.redirects.lock().unwrap().push(url.to_string());
        if self.popup_blocked.load(Ordering::SeqCst) {
            return Err(AuthError::PopupBlocked {
                url: url.to_string(),
            });
        }
        Ok(())
    }

    async fn clear_storage(&self) -> AuthResult<usize> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        *self.tokens.lock().unwrap() = None;
        *self.last_url.lock().unwrap() = None;
        Ok(self.stored_entries.swap(0, Ordering::SeqCst))
    }

    async fn last_attempted_auth_url(&self) -> Option<String> {
        self.last_url.lock().unwrap().clone()
    }
}
