//! Error types for authorization operations.

use thiserror::Error;

/// Errors that can occur while authorizing against an MCP server.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the storage file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize stored data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request to the authorization server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Dynamic client registration failed.
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// Authorization code exchange or token refresh failed.
    #[error("Token request failed: {0}")]
    Token(String),

    /// The authorization window could not be opened.
    #[error("Authorization popup was blocked; open {url} manually")]
    PopupBlocked { url: String },

    /// The callback carried an unknown or expired state parameter.
    #[error("Invalid or expired OAuth state: {0}")]
    InvalidState(String),

    /// No PKCE code verifier is stored for the pending authorization.
    #[error("No code verifier stored for {0}")]
    MissingCodeVerifier(String),

    /// Authorization failed for another reason.
    #[error("Authorization failed: {0}")]
    Failed(String),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                AuthError::InvalidUrl("nope".to_string()),
                "Invalid URL: nope",
            ),
            (
                AuthError::PopupBlocked {
                    url: "https://auth.example.com/authorize".to_string(),
                },
                "Authorization popup was blocked; open https://auth.example.com/authorize manually",
            ),
            (
                AuthError::InvalidState("abc".to_string()),
                "Invalid or expired OAuth state: abc",
            ),
            (AuthError::NoDataDir, "Could not determine data directory"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }
}
