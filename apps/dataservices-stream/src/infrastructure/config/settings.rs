//! Stream Client Configuration Settings
//!
//! Configuration types for the stream client, loaded from environment
//! variables prefixed with `DATASERVICES_`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{AuthError, TokenSource};
use crate::application::services::{DEFAULT_TIMESTAMP_FIELD, DeliveryMode, LatencyConfig};
use crate::domain::command::{BOOK_DEPTH_RANGE, Command, CommandError};
use crate::domain::routing::{
    DEFAULT_STREAM_BASE_URL, DataType, EndpointResolver, MarketDataRoute, RoutingError,
};
use crate::domain::session::DEFAULT_MAX_RECONNECT_ATTEMPTS;
use crate::infrastructure::auth::{DEFAULT_AUTH_URL, DEFAULT_HTTP_TIMEOUT, StaticToken, TokenProvider};
use crate::infrastructure::websocket::SupervisorConfig;

/// Prefix shared by every variable.
pub const ENV_PREFIX: &str = "DATASERVICES_";

/// Default interval between queue depth and latency reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Error Type
// =============================================================================

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value `{value}` for {key}: expected {expected}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
        /// What the variable accepts.
        expected: String,
    },
    /// Exchange, data type, subtype and stream type have no endpoint.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// Subscription parameters are invalid.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// `.env` file could not be read.
    #[error("failed to load env file: {0}")]
    DotEnv(String),
}

// =============================================================================
// Credentials
// =============================================================================

/// How the client obtains its bearer token.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key exchanged for tokens at the authentication endpoint.
    ApiKey(String),
    /// Pre-issued token used as is.
    Token(String),
}

impl Credentials {
    /// Build the token source these credentials describe.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot
    /// be built.
    pub fn token_source(
        &self,
        auth_url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn TokenSource>, AuthError> {
        Ok(match self {
            Self::ApiKey(key) => Arc::new(TokenProvider::new(key.clone(), auth_url, timeout)?),
            Self::Token(token) => Arc::new(StaticToken::new(token.clone())),
        })
    }

    /// Variable name and value that carry these credentials.
    #[must_use]
    pub fn env_pair(&self) -> (String, String) {
        match self {
            Self::ApiKey(key) => (env_key("API_KEY"), key.clone()),
            Self::Token(token) => (env_key("TOKEN"), token.clone()),
        }
    }

    pub(crate) fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(key) = lookup(&env_key("API_KEY")) {
            return non_empty("API_KEY", key).map(Self::ApiKey);
        }
        if let Some(token) = lookup(&env_key("TOKEN")) {
            return non_empty("TOKEN", token).map(Self::Token);
        }
        Err(ConfigError::MissingEnvVar(env_key("API_KEY")))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.debug_tuple("ApiKey").field(&"[REDACTED]").finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"[REDACTED]").finish(),
        }
    }
}

// =============================================================================
// Stream Configuration
// =============================================================================

/// Complete stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Token credentials.
    pub credentials: Credentials,
    /// REST API root holding the authentication endpoint.
    pub auth_url: String,
    /// Requested route.
    pub route: MarketDataRoute,
    /// Endpoint resolved from `route`.
    pub url: String,
    /// Verify server certificates.
    pub ssl: bool,
    /// Reconnect after abnormal closes.
    pub reconnect: bool,
    /// Reconnect attempts allowed between two successful opens.
    pub max_reconnect_attempts: u32,
    /// Where handler hooks run.
    pub delivery: DeliveryMode,
    /// Run the connection inside a worker process.
    pub process_isolation: bool,
    /// Instruments subscribed from the on-open hook.
    pub tickers: Vec<String>,
    /// Book depth for book subscriptions.
    pub book_depth: Option<u32>,
    /// Latency sampling, when enabled.
    pub latency: Option<LatencyConfig>,
    /// Interval between queue depth reports.
    pub queue_log_interval: Duration,
    /// Timeout of the authentication request.
    pub http_timeout: Duration,
    /// Prometheus listener port (0 = disabled).
    pub metrics_port: u16,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing, a value cannot be
    /// parsed, or the route has no endpoint.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a `.env` file layered over the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DotEnv`] if the file cannot be read, or any
    /// error of [`StreamConfig::from_lookup`].
    pub fn from_dotenv_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file: HashMap<String, String> = dotenvy::from_path_iter(path.as_ref())
            .map_err(|e| ConfigError::DotEnv(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| ConfigError::DotEnv(e.to_string()))?;
        Self::from_lookup(|key| file.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`StreamConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let credentials = Credentials::from_lookup(&lookup)?;
        let auth_url = lookup_or(&lookup, "AUTH_URL", DEFAULT_AUTH_URL);
        let base_url = lookup_or(&lookup, "STREAM_BASE_URL", DEFAULT_STREAM_BASE_URL);

        let exchange = lookup_or(&lookup, "EXCHANGE", "b3");
        let data_type = lookup_or(&lookup, "DATA_TYPE", "trades");
        let subtype = lookup(&env_key("DATA_SUBTYPE")).filter(|s| !s.trim().is_empty());
        let stream_type = lookup_or(&lookup, "STREAM_TYPE", "realtime");
        let route = MarketDataRoute::parse(
            exchange.trim(),
            data_type.trim(),
            subtype.as_deref().map(str::trim),
            stream_type.trim(),
        )?;
        let url = EndpointResolver::new(base_url).resolve_route(&route)?;

        let delivery = match lookup(&env_key("DELIVERY_MODE")) {
            None => DeliveryMode::default(),
            Some(raw) => DeliveryMode::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: env_key("DELIVERY_MODE"),
                value: raw,
                expected: "inline, queued or concurrent".to_string(),
            })?,
        };

        let book_depth = parse_opt::<u32>(&lookup, "BOOK_DEPTH")?;
        if let Some(depth) = book_depth
            && !BOOK_DEPTH_RANGE.contains(&depth)
        {
            return Err(CommandError::BookDepthOutOfRange(depth).into());
        }

        let latency = if parse_bool(&lookup, "LATENCY_ENABLED", false)? {
            Some(LatencyConfig {
                interval: parse_secs(&lookup, "LATENCY_INTERVAL_SECS", DEFAULT_REPORT_INTERVAL)?,
                timestamp_field: lookup_or(&lookup, "LATENCY_FIELD", DEFAULT_TIMESTAMP_FIELD),
            })
        } else {
            None
        };

        Ok(Self {
            credentials,
            auth_url,
            route,
            url,
            ssl: parse_bool(&lookup, "SSL", true)?,
            reconnect: parse_bool(&lookup, "RECONNECT", true)?,
            max_reconnect_attempts: parse_opt(&lookup, "MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            delivery,
            process_isolation: parse_bool(&lookup, "PROCESS_ISOLATION", false)?,
            tickers: parse_list(&lookup, "TICKERS"),
            book_depth,
            latency,
            queue_log_interval: parse_secs(
                &lookup,
                "QUEUE_LOG_INTERVAL_SECS",
                DEFAULT_REPORT_INTERVAL,
            )?,
            http_timeout: parse_secs(&lookup, "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT)?,
            metrics_port: parse_opt(&lookup, "METRICS_PORT")?.unwrap_or(0),
        })
    }

    /// Token source for these credentials.
    ///
    /// # Errors
    ///
    /// See [`Credentials::token_source`].
    pub fn token_source(&self) -> Result<Arc<dyn TokenSource>, AuthError> {
        self.credentials.token_source(&self.auth_url, self.http_timeout)
    }

    /// Supervisor settings for an in-process connection.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            url: self.url.clone(),
            ssl: self.ssl,
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            delivery: self.delivery,
            latency: self.latency.clone(),
        }
    }

    /// Subscription for the configured tickers, if any.
    ///
    /// Book feeds with a configured depth subscribe with that depth.
    #[must_use]
    pub fn initial_subscription(&self) -> Option<Command> {
        if self.tickers.is_empty() {
            return None;
        }
        match (self.route.data_type, self.book_depth) {
            (DataType::Books, Some(depth)) => {
                Command::subscribe_book(self.tickers.iter().cloned(), depth).ok()
            }
            _ => Some(Command::subscribe(self.tickers.iter().cloned())),
        }
    }
}

// =============================================================================
// Lookup Helpers
// =============================================================================

/// Full variable name for a suffix.
#[must_use]
pub fn env_key(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

fn non_empty(suffix: &str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::EmptyValue(env_key(suffix)))
    } else {
        Ok(value)
    }
}

pub(crate) fn lookup_or(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
    default: &str,
) -> String {
    lookup(&env_key(suffix))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn lookup_required(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<String, ConfigError> {
    let value = lookup(&env_key(suffix)).ok_or_else(|| ConfigError::MissingEnvVar(env_key(suffix)))?;
    non_empty(suffix, value)
}

pub(crate) fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(&env_key(suffix)) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "" => Ok(default),
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: env_key(suffix),
            value: raw,
            expected: "true or false".to_string(),
        }),
    }
}

pub(crate) fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(&env_key(suffix)).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: env_key(suffix),
            value: raw,
            expected: "a non-negative integer".to_string(),
        })
}

pub(crate) fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    suffix: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse_opt::<u64>(lookup, suffix)?.map_or(default, Duration::from_secs))
}

fn parse_list(lookup: &impl Fn(&str) -> Option<String>, suffix: &str) -> Vec<String> {
    lookup(&env_key(suffix))
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
