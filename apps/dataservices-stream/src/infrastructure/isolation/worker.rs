//! Feed Worker
//!
//! Runs a [`Supervisor`] inside the isolated worker process. Events leave
//! through stdout as envelopes; commands arrive through stdin as JSON
//! lines. Logs go to stderr.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::FeedError;
use super::protocol::EnvelopeHandler;
use crate::application::ports::{CloseInfo, StreamError, StreamHandler};
use crate::application::services::DeliveryMode;
use crate::domain::command::Command;
use crate::domain::session::DEFAULT_MAX_RECONNECT_ATTEMPTS;
use crate::infrastructure::auth::{DEFAULT_AUTH_URL, DEFAULT_HTTP_TIMEOUT};
use crate::infrastructure::config::{
    ConfigError, Credentials, StreamConfig, env_key, lookup_or, lookup_required, parse_bool,
    parse_opt, parse_secs,
};
use crate::infrastructure::websocket::{Supervisor, SupervisorConfig, SupervisorError};

/// File name of the worker binary.
pub const WORKER_BINARY_NAME: &str = "dataservices-feed-worker";

/// Variable carrying the resolved endpoint.
const WORKER_URL_KEY: &str = "WORKER_URL";

// =============================================================================
// Worker Settings
// =============================================================================

/// Settings handed to the worker through its environment.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Resolved endpoint URL.
    pub url: String,
    /// Token credentials.
    pub credentials: Credentials,
    /// REST API root holding the authentication endpoint.
    pub auth_url: String,
    /// Timeout of the authentication request.
    pub http_timeout: Duration,
    /// Verify server certificates.
    pub ssl: bool,
    /// Reconnect after abnormal closes.
    pub reconnect: bool,
    /// Reconnect attempts allowed between two successful opens.
    pub max_reconnect_attempts: u32,
}

impl WorkerSettings {
    /// Worker settings for a stream configuration.
    #[must_use]
    pub fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            credentials: config.credentials.clone(),
            auth_url: config.auth_url.clone(),
            http_timeout: config.http_timeout,
            ssl: config.ssl,
            reconnect: config.reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// Variables the worker reads back with [`WorkerSettings::from_lookup`].
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (env_key(WORKER_URL_KEY), self.url.clone()),
            self.credentials.env_pair(),
            (env_key("AUTH_URL"), self.auth_url.clone()),
            (
                env_key("HTTP_TIMEOUT_SECS"),
                self.http_timeout.as_secs().to_string(),
            ),
            (env_key("SSL"), self.ssl.to_string()),
            (env_key("RECONNECT"), self.reconnect.to_string()),
            (
                env_key("MAX_RECONNECT_ATTEMPTS"),
                self.max_reconnect_attempts.to_string(),
            ),
        ]
    }

    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// See [`WorkerSettings::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint or credentials are missing, or a
    /// value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: lookup_required(&lookup, WORKER_URL_KEY)?,
            credentials: Credentials::from_lookup(&lookup)?,
            auth_url: lookup_or(&lookup, "AUTH_URL", DEFAULT_AUTH_URL),
            http_timeout: parse_secs(&lookup, "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT)?,
            ssl: parse_bool(&lookup, "SSL", true)?,
            reconnect: parse_bool(&lookup, "RECONNECT", true)?,
            max_reconnect_attempts: parse_opt(&lookup, "MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        })
    }

    /// Supervisor settings used inside the worker.
    ///
    /// Delivery is queued so that socket reads never wait on stdout.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            url: self.url.clone(),
            ssl: self.ssl,
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            delivery: DeliveryMode::Queued,
            latency: None,
        }
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

/// Run the worker until the supervisor stops or `input` reaches EOF.
///
/// # Errors
///
/// Returns an error if the token source cannot be built or the supervisor
/// stops with an error. The terminal close envelope has been written in
/// both cases.
pub async fn run_worker<R, W>(settings: WorkerSettings, input: R, output: W) -> Result<(), FeedError>
where
    R: AsyncBufRead + Unpin,
    W: Write + Send + 'static,
{
    let handler = Arc::new(EnvelopeHandler::new(output));

    let tokens = match settings
        .credentials
        .token_source(&settings.auth_url, settings.http_timeout)
    {
        Ok(tokens) => tokens,
        Err(e) => {
            handler.on_error(&StreamError::Auth(e.clone()));
            handler.on_close(&CloseInfo::terminal(None, e.to_string()));
            return Err(FeedError::Auth(e));
        }
    };

    let supervisor = Arc::new(Supervisor::new(
        settings.supervisor_config(),
        tokens,
        handler,
    ));
    let commands = supervisor.commands();
    let runner = Arc::clone(&supervisor);
    let mut run = tokio::spawn(async move { runner.run().await });
    let mut lines = input.lines();

    tracing::info!(session_id = %supervisor.session_id(), "Worker started");

    loop {
        tokio::select! {
            result = &mut run => return join_result(result),
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        if let Err(e) = commands.send(command) {
                            tracing::warn!(error = %e, "Dropping command from parent");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring undecodable command line"),
                },
                Ok(None) | Err(_) => {
                    tracing::info!("Parent closed stdin, shutting down");
                    supervisor.close().await;
                    return join_result(run.await);
                }
            },
        }
    }
}

fn join_result(
    result: Result<Result<(), SupervisorError>, tokio::task::JoinError>,
) -> Result<(), FeedError> {
    match result {
        Ok(outcome) => outcome.map_err(FeedError::from),
        Err(e) => Err(FeedError::WorkerPanicked(e.to_string())),
    }
}
