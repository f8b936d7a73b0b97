//! Token Source Port
//!
//! Supplies the bearer token a connection presents in its
//! `Sec-WebSocket-Protocol` header.

use async_trait::async_trait;
use thiserror::Error;

/// Errors obtaining a token.
///
/// None of these are retried automatically: they need new credentials or
/// caller intervention.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Authentication endpoint rejected the request.
    ///
    /// The server diagnostic and suggested action are kept verbatim.
    #[error("Error: {error}.\n{suggested_action}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided `ApiClientError`.
        error: String,
        /// Server-provided `SuggestedAction`.
        suggested_action: String,
    },

    /// Endpoint answered 200 without an `AccessToken`.
    #[error("something has gone wrong while authenticating: no token as response")]
    MissingToken,

    /// Token payload could not be decoded.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Request never produced a response.
    #[error("authentication request failed: {0}")]
    Http(String),

    /// API key is empty.
    #[error("API key cannot be empty")]
    EmptyApiKey,
}

/// Source of the current bearer token.
///
/// Implementations return an unexpired token, refreshing it if needed.
/// Callers must tolerate added latency at refresh boundaries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if a refresh is needed and fails.
    async fn token(&self) -> Result<String, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_keeps_server_text_verbatim() {
        let err = AuthError::Rejected {
            status: 401,
            error: "Invalid API key".to_string(),
            suggested_action: "Contact support to renew your key".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Error: Invalid API key.\nContact support to renew your key"
        );
    }

    #[tokio::test]
    async fn mock_source_returns_configured_token() {
        let mut source = MockTokenSource::new();
        source
            .expect_token()
            .times(1)
            .returning(|| Ok("jwt".to_string()));
        assert_eq!(source.token().await.unwrap(), "jwt");
    }
}
