//! Connection Supervisor
//!
//! Owns one logical market data connection and keeps it alive across
//! disconnects.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──► Connecting ──► Open ──► Closing ──► Closed
//!              ▲  │         │
//!              │  ▼         │ abnormal close
//!          Reconnecting ◄───┘
//! ```
//!
//! Reconnection is immediate and bounded by a retry cap that resets on
//! every successful open. Subscriptions are not replayed on reconnect:
//! the open hook runs again and is expected to reissue them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::tls;
use super::writer::{CLIENT_CLOSE_REASON, write_commands};
use crate::application::ports::{AuthError, CloseInfo, StreamError, StreamHandler, TokenSource};
use crate::application::services::{
    CommandChannel, CommandQueue, DeliveryMode, Dispatcher, LatencyConfig, command_channel,
};
use crate::domain::session::{ConnectionState, DEFAULT_MAX_RECONNECT_ATTEMPTS, RetryCounter};
use crate::domain::subscription::SubscriptionSet;
use crate::infrastructure::metrics;

/// User agent presented during the handshake.
pub const USER_AGENT_VALUE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/94.0.4606.54 Safari/537.36";

/// Close code reported for a client-initiated close.
const NORMAL_CLOSURE: u16 = 1000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that end [`Supervisor::run`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Token could not be obtained.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Token cannot be carried in a header.
    #[error("token is not a valid Sec-WebSocket-Protocol value")]
    InvalidToken,

    /// Endpoint is not a WebSocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS client configuration failed.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    /// Queued-mode consumer thread could not be started.
    #[error("failed to start dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),

    /// Retry cap reached without a successful open.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// `run` was called twice.
    #[error("supervisor already started")]
    AlreadyStarted,
}

impl SupervisorError {
    /// Error reported through the error hook before the terminal close.
    fn to_stream_error(&self) -> StreamError {
        match self {
            Self::Auth(e) => StreamError::Auth(e.clone()),
            other => StreamError::Connection(other.to_string()),
        }
    }
}

/// Transient failures of a single connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Transport or handshake failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Stream ended without a close frame.
    #[error("WebSocket stream ended")]
    StreamEnded,

    /// Command writer could not write to the socket.
    #[error("failed to write command to the socket")]
    WriteFailed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Endpoint URL.
    pub url: String,
    /// Verify server certificates.
    pub ssl: bool,
    /// Reconnect after abnormal closes.
    pub reconnect: bool,
    /// Reconnect attempts allowed between two successful opens.
    pub max_reconnect_attempts: u32,
    /// Where handler hooks run.
    pub delivery: DeliveryMode,
    /// Latency sampling, when enabled.
    pub latency: Option<LatencyConfig>,
}

impl SupervisorConfig {
    /// Defaults for `url`: verified TLS, reconnect with a cap of 5, inline
    /// delivery.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ssl: true,
            reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delivery: DeliveryMode::Inline,
            latency: None,
        }
    }
}

// =============================================================================
// Session Outcome
// =============================================================================

/// How one connection ended.
enum SessionEnd {
    /// Explicit close.
    Closed,
    /// Connection lost; eligible for retry.
    Lost {
        error: Option<ConnectionError>,
        code: Option<u16>,
        reason: String,
    },
    /// Not retryable.
    Fatal(SupervisorError),
}

impl SessionEnd {
    fn from_error(error: ConnectionError) -> Self {
        Self::Lost {
            reason: error.to_string(),
            error: Some(error),
            code: None,
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Reconnecting WebSocket connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use dataservices_stream::{Hooks, StaticToken, Supervisor, SupervisorConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let hooks = Hooks::new().on_open(|commands| {
///     let _ = commands.subscribe(["PETR4"]);
/// });
/// let supervisor = Arc::new(Supervisor::new(
///     SupervisorConfig::new("wss://example.com/stream"),
///     Arc::new(StaticToken::new("token")),
///     Arc::new(hooks),
/// ));
///
/// let runner = Arc::clone(&supervisor);
/// let task = tokio::spawn(async move { runner.run().await });
/// supervisor.close().await;
/// task.await??;
/// # Ok(())
/// # }
/// ```
pub struct Supervisor {
    config: SupervisorConfig,
    session_id: Uuid,
    tokens: Arc<dyn TokenSource>,
    handler: Arc<dyn StreamHandler>,
    commands: CommandChannel,
    queue: Arc<Mutex<CommandQueue>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    subscriptions: Arc<SubscriptionSet>,
    retries: parking_lot::Mutex<RetryCounter>,
    started: AtomicBool,
    finished: watch::Sender<bool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("session_id", &self.session_id)
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        tokens: Arc<dyn TokenSource>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let (commands, queue) = command_channel();
        let retries = RetryCounter::new(config.max_reconnect_attempts);
        Self {
            config,
            session_id: Uuid::new_v4(),
            tokens,
            handler,
            commands,
            queue: Arc::new(Mutex::new(queue)),
            state: watch::channel(ConnectionState::Idle).0,
            cancel: CancellationToken::new(),
            subscriptions: Arc::new(SubscriptionSet::new()),
            retries: parking_lot::Mutex::new(retries),
            started: AtomicBool::new(false),
            finished: watch::channel(false).0,
        }
    }

    /// Command channel. Commands sent while disconnected are delivered
    /// after the next open.
    #[must_use]
    pub fn commands(&self) -> CommandChannel {
        self.commands.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Instruments subscribed on the current connection.
    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionSet> {
        Arc::clone(&self.subscriptions)
    }

    /// Identifier carried by this supervisor's log spans.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Connect and keep the connection alive until closed.
    ///
    /// Returns `Ok` after [`Supervisor::close`] or when a connection ends
    /// with reconnection disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails, the endpoint or token is
    /// unusable, or the retry cap is exhausted. The close hook has
    /// already been invoked when this returns.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted);
        }

        let span = tracing::info_span!(
            "supervisor",
            session_id = %self.session_id,
            url = %self.config.url
        );

        async {
            if self.cancel.is_cancelled() {
                self.finish();
                return Ok(());
            }

            let dispatcher = match Dispatcher::new(Arc::clone(&self.handler), self.config.delivery)
            {
                Ok(dispatcher) => dispatcher,
                Err(e) => {
                    self.finish();
                    return Err(SupervisorError::Dispatcher(e));
                }
            };
            let dispatcher = match self.config.latency.clone() {
                Some(latency) => dispatcher.with_latency(latency),
                None => dispatcher,
            };

            let result = self.supervise(&dispatcher).await;

            // Queued hooks are drained before Closed is published
            if tokio::task::spawn_blocking(move || dispatcher.shutdown())
                .await
                .is_err()
            {
                tracing::error!("Dispatcher shutdown panicked");
            }
            self.finish();

            if let Err(e) = &result {
                tracing::error!(error = %e, "Supervisor stopped");
            } else {
                tracing::info!("Supervisor stopped");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Close the connection and wait until the supervisor is closed.
    ///
    /// Once started, waits for [`Supervisor::run`] to deliver its last
    /// hook, so no hook runs after this returns. Safe to call repeatedly
    /// and before [`Supervisor::run`].
    pub async fn close(&self) {
        let mut state = self.state.subscribe();
        let mut finished = self.finished.subscribe();
        self.state.send_if_modified(|current| match *current {
            ConnectionState::Idle => {
                *current = ConnectionState::Closed;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
            _ => {
                *current = ConnectionState::Closing;
                true
            }
        });
        metrics::set_connection_state(self.state());
        self.cancel.cancel();

        // run() checks the token after setting `started`
        if self.started.load(Ordering::SeqCst) {
            if finished.wait_for(|done| *done).await.is_err() {
                tracing::debug!("Finished channel closed while waiting for close");
            }
        } else if state.wait_for(|s| s.is_closed()).await.is_err() {
            tracing::debug!("State channel closed while waiting for close");
        }
    }

    async fn supervise(&self, dispatcher: &Dispatcher) -> Result<(), SupervisorError> {
        // Set once a reconnecting close was delivered; the session then
        // owes the handler a terminal close.
        let mut reconnecting = false;
        loop {
            if self.cancel.is_cancelled() {
                if reconnecting {
                    dispatcher.close(CloseInfo::terminal(
                        Some(NORMAL_CLOSURE),
                        CLIENT_CLOSE_REASON,
                    ));
                }
                return Ok(());
            }
            self.transition(ConnectionState::Connecting);

            match self.connect_and_run(dispatcher).await {
                SessionEnd::Closed => {
                    self.subscriptions.clear();
                    dispatcher.close(CloseInfo::terminal(
                        Some(NORMAL_CLOSURE),
                        CLIENT_CLOSE_REASON,
                    ));
                    return Ok(());
                }
                SessionEnd::Fatal(error) => {
                    dispatcher.error(error.to_stream_error());
                    self.subscriptions.clear();
                    dispatcher.close(CloseInfo::terminal(None, error.to_string()));
                    return Err(error);
                }
                SessionEnd::Lost {
                    error,
                    code,
                    reason,
                } => {
                    if let Some(error) = &error {
                        tracing::warn!(error = %error, "Connection lost");
                        dispatcher.error(StreamError::Connection(error.to_string()));
                    } else {
                        tracing::warn!(code, reason = %reason, "Server closed the connection");
                    }
                    self.subscriptions.clear();

                    let attempt = if self.config.reconnect && !self.cancel.is_cancelled() {
                        self.retries.lock().next_attempt()
                    } else {
                        None
                    };

                    let Some(attempt) = attempt else {
                        let exhausted = self.config.reconnect && !self.cancel.is_cancelled();
                        let reason = if exhausted {
                            format!("{reason}; maximum reconnect attempts reached")
                        } else {
                            reason
                        };
                        dispatcher.close(CloseInfo::terminal(code, reason));
                        return if exhausted {
                            Err(SupervisorError::MaxReconnectAttemptsExceeded)
                        } else {
                            Ok(())
                        };
                    };

                    dispatcher.close(CloseInfo {
                        code,
                        reason,
                        reconnecting: true,
                        attempt: Some(attempt),
                    });
                    reconnecting = true;
                    self.transition(ConnectionState::Reconnecting);
                    metrics::record_reconnect();
                    tracing::info!(
                        attempt,
                        max_attempts = self.config.max_reconnect_attempts,
                        "Reconnecting"
                    );
                }
            }
        }
    }

    async fn connect_and_run(&self, dispatcher: &Dispatcher) -> SessionEnd {
        let token = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Closed,
            token = self.tokens.token() => match token {
                Ok(token) => token,
                Err(e) => return SessionEnd::Fatal(e.into()),
            },
        };

        let request = match build_request(&self.config.url, &token) {
            Ok(request) => request,
            Err(e) => return SessionEnd::Fatal(e),
        };
        let connector = match tls::connector_for(&self.config.url, self.config.ssl) {
            Ok(connector) => connector,
            Err(e) => return SessionEnd::Fatal(e.into()),
        };

        tracing::info!("Connecting to market data stream");
        let connected = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Closed,
            connected = tokio_tungstenite::connect_async_tls_with_config(
                request,
                None,
                false,
                connector,
            ) => connected,
        };
        let (ws_stream, _response) = match connected {
            Ok(connected) => connected,
            Err(e) => return SessionEnd::from_error(e.into()),
        };

        let (write, mut read) = ws_stream.split();
        let detach = self.cancel.child_token();
        let writer = tokio::spawn(write_commands(
            write,
            Arc::clone(&self.queue),
            Arc::clone(&self.subscriptions),
            detach.clone(),
            self.cancel.clone(),
        ));

        if self.transition(ConnectionState::Open) {
            self.retries.lock().reset();
            tracing::info!("Connection open");
            dispatcher.open(&self.commands);
        }

        let end = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break SessionEnd::Closed,
                () = detach.cancelled() => {
                    break SessionEnd::from_error(ConnectionError::WriteFailed);
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => dispatcher.dispatch_text(&text),
                    Some(Ok(Message::Binary(bytes))) => dispatcher.dispatch_bytes(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or_else(
                            || (None, String::from("connection closed")),
                            |f| (Some(u16::from(f.code)), f.reason.to_string()),
                        );
                        break SessionEnd::Lost { error: None, code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::from_error(e.into()),
                    None => break SessionEnd::from_error(ConnectionError::StreamEnded),
                },
            }
        };

        detach.cancel();
        match writer.await {
            Ok(exit) => tracing::debug!(?exit, "Command writer stopped"),
            Err(e) => tracing::error!(error = %e, "Command writer panicked"),
        }
        end
    }

    /// Apply a validated transition. Returns whether it was applied.
    fn transition(&self, next: ConnectionState) -> bool {
        let applied = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if applied {
            metrics::set_connection_state(next);
            tracing::debug!(state = %next, "State changed");
        }
        applied
    }

    fn finish(&self) {
        self.state.send_replace(ConnectionState::Closed);
        metrics::set_connection_state(ConnectionState::Closed);
        self.finished.send_replace(true);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handshake request carrying the token as subprotocol.
fn build_request(url: &str, token: &str) -> Result<Request, SupervisorError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SupervisorError::InvalidEndpoint(e.to_string()))?;
    let protocol = HeaderValue::from_str(token).map_err(|_| SupervisorError::InvalidToken)?;
    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    Ok(request)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{Hooks, MockTokenSource};

    fn rejecting_source() -> Arc<dyn TokenSource> {
        let mut source = MockTokenSource::new();
        source.expect_token().times(1).returning(|| {
            Err(AuthError::Rejected {
                status: 401,
                error: "Invalid API key".to_string(),
                suggested_action: "Renew your key".to_string(),
            })
        });
        Arc::new(source)
    }

    #[test]
    fn request_carries_token_and_user_agent() {
        let request = build_request("wss://example.com/stream", "abc.def.ghi").unwrap();
        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "abc.def.ghi");
        assert_eq!(request.headers()[USER_AGENT], USER_AGENT_VALUE);
    }

    #[test]
    fn token_with_control_characters_is_rejected() {
        let err = build_request("wss://example.com/stream", "bad\ntoken").unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidToken));
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let err = build_request("not a url", "token").unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidEndpoint(_)));
    }

    #[test]
    fn default_config() {
        let config = SupervisorConfig::new("wss://example.com");
        assert!(config.ssl);
        assert!(config.reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.delivery, DeliveryMode::Inline);
    }

    #[tokio::test]
    async fn close_before_run_goes_straight_to_closed() {
        let supervisor = Supervisor::new(
            SupervisorConfig::new("ws://127.0.0.1:1"),
            Arc::new(MockTokenSource::new()),
            Arc::new(Hooks::new()),
        );
        supervisor.close().await;
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        supervisor.close().await;

        assert!(supervisor.run().await.is_ok());
        assert_eq!(supervisor.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn authentication_failure_is_terminal() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors = Arc::clone(&events);
        let closes = Arc::clone(&events);
        let hooks = Hooks::new()
            .on_error(move |e| errors.lock().push(format!("error: {e}")))
            .on_close(move |c| {
                closes
                    .lock()
                    .push(format!("close: reconnecting={}", c.reconnecting));
            });

        let supervisor = Supervisor::new(
            SupervisorConfig::new("ws://127.0.0.1:1"),
            rejecting_source(),
            Arc::new(hooks),
        );
        let err = supervisor.run().await.unwrap_err();

        assert!(matches!(err, SupervisorError::Auth(AuthError::Rejected { status: 401, .. })));
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("error: authentication failed: Error: Invalid API key."));
        assert_eq!(events[1], "close: reconnecting=false");
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let supervisor = Supervisor::new(
            SupervisorConfig::new("ws://127.0.0.1:1"),
            rejecting_source(),
            Arc::new(Hooks::new()),
        );
        let _ = supervisor.run().await;
        assert!(matches!(
            supervisor.run().await,
            Err(SupervisorError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn refused_connection_exhausts_retries() {
        let mut source = MockTokenSource::new();
        source
            .expect_token()
            .times(3)
            .returning(|| Ok("token".to_string()));

        let closes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&closes);
        let hooks = Hooks::new()
            .on_error(|_| {})
            .on_close(move |c| recorded.lock().push((c.reconnecting, c.attempt)));

        let mut config = SupervisorConfig::new("ws://127.0.0.1:1");
        config.max_reconnect_attempts = 2;
        let supervisor = Supervisor::new(config, Arc::new(source), Arc::new(hooks));

        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::MaxReconnectAttemptsExceeded));
        assert_eq!(
            *closes.lock(),
            vec![(true, Some(1)), (true, Some(2)), (false, None)]
        );
    }

    #[tokio::test]
    async fn no_hook_runs_after_close_returns() {
        for _ in 0..20 {
            let mut source = MockTokenSource::new();
            source.expect_token().returning(|| Ok("token".to_string()));

            let closes = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let recorded = Arc::clone(&closes);
            let hooks = Hooks::new()
                .on_error(|_| {})
                .on_close(move |c: &CloseInfo| recorded.lock().push(c.clone()));
            let supervisor = Arc::new(Supervisor::new(
                SupervisorConfig::new("ws://127.0.0.1:1"),
                Arc::new(source),
                Arc::new(hooks),
            ));

            let runner = Arc::clone(&supervisor);
            let run = tokio::spawn(async move { runner.run().await });
            tokio::task::yield_now().await;
            supervisor.close().await;

            let seen = closes.lock().len();
            let _ = run.await.unwrap();
            assert_eq!(closes.lock().len(), seen);
            assert_eq!(supervisor.state(), ConnectionState::Closed);
        }
    }

    #[tokio::test]
    async fn reconnect_disabled_closes_after_first_failure() {
        let mut source = MockTokenSource::new();
        source
            .expect_token()
            .times(1)
            .returning(|| Ok("token".to_string()));

        let mut config = SupervisorConfig::new("ws://127.0.0.1:1");
        config.reconnect = false;
        let supervisor = Supervisor::new(
            config,
            Arc::new(source),
            Arc::new(Hooks::new().on_error(|_| {})),
        );

        assert!(supervisor.run().await.is_ok());
        assert_eq!(supervisor.state(), ConnectionState::Closed);
    }
}
