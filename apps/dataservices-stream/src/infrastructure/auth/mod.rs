//! Token Provider
//!
//! Exchanges an API key for a bearer token at the Data Services
//! authentication endpoint and caches it until its `exp` claim passes.
//!
//! # Authentication Flow
//!
//! 1. `POST {auth_url}/authenticate` with `{"api_key": "...", "client_id": "..."}`
//! 2. `200` → `{"AccessToken": "<jwt>"}`
//! 3. Any other status → `{"ApiClientError": "...", "SuggestedAction": "..."}`
//!
//! The JWT payload is read without verifying its signature; only the `exp`
//! claim is used. Expiry is compared against the local wall clock with no
//! skew compensation.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::application::ports::{AuthError, TokenSource};

/// Default REST API root holding the authentication endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://dataservices.btgpactualsolutions.com/api/v2";

/// Client identifier sent with every authentication request.
pub const CLIENT_ID: &str = "btgsolutions-client-rust";

/// Default timeout of the authentication request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct AuthenticateRequest<'a> {
    api_key: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct AuthenticateResponse {
    #[serde(rename = "AccessToken")]
    access_token: Option<String>,
    #[serde(rename = "ApiClientError")]
    api_client_error: Option<String>,
    #[serde(rename = "SuggestedAction")]
    suggested_action: Option<String>,
}

// =============================================================================
// JWT Expiry
// =============================================================================

/// Read the `exp` claim of a JWT without verifying it.
///
/// Returns `Ok(None)` for tokens that carry no `exp` claim.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the payload segment is missing
/// or is not base64url-encoded JSON.
pub fn token_expiry(token: &str) -> Result<Option<DateTime<Utc>>, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::MalformedToken("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| AuthError::MalformedToken(e.to_string()))?;

    #[allow(clippy::cast_possible_truncation)]
    let exp = match claims.get("exp") {
        None | Some(Value::Null) => return Ok(None),
        Some(exp) => exp
            .as_i64()
            .or_else(|| exp.as_f64().map(|f| f as i64))
            .ok_or_else(|| AuthError::MalformedToken("`exp` is not numeric".to_string()))?,
    };
    DateTime::from_timestamp(exp, 0)
        .map(Some)
        .ok_or_else(|| AuthError::MalformedToken(format!("`exp` out of range: {exp}")))
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

// =============================================================================
// Token Provider
// =============================================================================

/// Token source backed by the authentication endpoint.
///
/// No request is made at construction; the first [`TokenSource::token`]
/// call fetches. Concurrent callers share a single refresh.
pub struct TokenProvider {
    client: reqwest::Client,
    auth_url: String,
    api_key: String,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("auth_url", &self.auth_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// Create a provider for `api_key` against `auth_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::EmptyApiKey`] for an empty key, or
    /// [`AuthError::Http`] if the HTTP client cannot be built.
    pub fn new(
        api_key: impl Into<String>,
        auth_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AuthError::EmptyApiKey);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Http(e.to_string()))?;

        Ok(Self {
            client,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            api_key,
            cached: Mutex::new(None),
        })
    }

    /// Create a provider against the production endpoint.
    ///
    /// # Errors
    ///
    /// See [`TokenProvider::new`].
    pub fn production(api_key: impl Into<String>) -> Result<Self, AuthError> {
        Self::new(api_key, DEFAULT_AUTH_URL, DEFAULT_HTTP_TIMEOUT)
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        let url = format!("{}/authenticate", self.auth_url);
        tracing::debug!(url = %url, "Requesting access token");

        let response = self
            .client
            .post(&url)
            .json(&AuthenticateRequest {
                api_key: &self.api_key,
                client_id: CLIENT_ID,
            })
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;
        let body: AuthenticateResponse = serde_json::from_str(&text).unwrap_or_default();

        if status != reqwest::StatusCode::OK {
            tracing::warn!(status = status.as_u16(), "Authentication rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                error: body.api_client_error.unwrap_or_else(|| "None".to_string()),
                suggested_action: body.suggested_action.unwrap_or_else(|| "None".to_string()),
            });
        }

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let expires_at = token_expiry(&token)?;
        tracing::info!(
            expires_at = expires_at.map(|t| t.to_rfc3339()),
            "Access token refreshed"
        );
        Ok(CachedToken { token, expires_at })
    }
}

#[async_trait]
impl TokenSource for TokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref()
            && !current.is_expired(Utc::now())
        {
            return Ok(current.token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

// =============================================================================
// Static Token
// =============================================================================

/// Token source returning a fixed token. It never refreshes.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a caller-supplied token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&"[REDACTED]").finish()
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
