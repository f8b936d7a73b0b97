//! Stream Handler Port
//!
//! Every connection event reaches the application through four hook
//! points. Each hook has a default that writes a diagnostic line through
//! `tracing`; implementors override only what they need.
//!
//! # Example
//!
//! ```rust
//! use dataservices_stream::application::ports::Hooks;
//!
//! let hooks = Hooks::new()
//!     .on_open(|commands| {
//!         let _ = commands.subscribe(["PETR4", "VALE3"]);
//!     })
//!     .on_message(|frame| {
//!         println!("{}", frame.value());
//!         Ok(())
//!     });
//! # let _ = hooks;
//! ```

use std::fmt;

use crate::application::ports::AuthError;
use crate::application::services::CommandChannel;
use crate::domain::frame::{Frame, FrameError};

// =============================================================================
// Hook Payloads
// =============================================================================

/// Errors reported through the error hook.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Payload could not be decoded. The connection stays open.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Message hook returned an error or panicked.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// Transport failure or handshake rejection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Token could not be obtained.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Isolated worker failure.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Details passed to the close hook.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// Close code sent by the server, if any.
    pub code: Option<u16>,
    /// Close reason or failure description.
    pub reason: String,
    /// Whether the client will reconnect.
    pub reconnecting: bool,
    /// Reconnect attempt about to be made, when reconnecting.
    pub attempt: Option<u32>,
}

impl CloseInfo {
    /// A close after which the client stays closed.
    #[must_use]
    pub fn terminal(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            reconnecting: false,
            attempt: None,
        }
    }

    /// Whether no reconnect follows.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.reconnecting
    }
}

// =============================================================================
// Handler Trait
// =============================================================================

/// Receiver of connection events.
///
/// Hooks run on whichever execution unit the delivery mode selects, so
/// implementations must be `Send + Sync`.
pub trait StreamHandler: Send + Sync + 'static {
    /// Connection opened. Reissue subscriptions here.
    fn on_open(&self, commands: &CommandChannel) {
        default_on_open(commands);
    }

    /// Frame received.
    ///
    /// # Errors
    ///
    /// Errors are reported through [`StreamHandler::on_error`] and never
    /// stop the read loop.
    fn on_message(&self, frame: Frame) -> anyhow::Result<()> {
        default_on_message(&frame);
        Ok(())
    }

    /// Error occurred.
    fn on_error(&self, error: &StreamError) {
        default_on_error(error);
    }

    /// Connection closed.
    fn on_close(&self, close: &CloseInfo) {
        default_on_close(close);
    }
}

fn default_on_open(_commands: &CommandChannel) {
    tracing::info!("### Open Connection ###");
}

fn default_on_message(frame: &Frame) {
    tracing::info!(ev = frame.ev().unwrap_or_default(), "{}", frame.value());
}

fn default_on_error(error: &StreamError) {
    tracing::error!("### Error: {error} ###");
}

fn default_on_close(close: &CloseInfo) {
    tracing::info!(
        code = close.code,
        reason = %close.reason,
        reconnecting = close.reconnecting,
        "### Closed Connection ###"
    );
}

/// Handler that keeps every default hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl StreamHandler for LoggingHandler {}

// =============================================================================
// Closure Hooks
// =============================================================================

type OpenHook = Box<dyn Fn(&CommandChannel) + Send + Sync>;
type MessageHook = Box<dyn Fn(Frame) -> anyhow::Result<()> + Send + Sync>;
type ErrorHook = Box<dyn Fn(&StreamError) + Send + Sync>;
type CloseHook = Box<dyn Fn(&CloseInfo) + Send + Sync>;

/// Handler assembled from closures; unset hooks keep their default.
#[derive(Default)]
pub struct Hooks {
    open: Option<OpenHook>,
    message: Option<MessageHook>,
    error: Option<ErrorHook>,
    close: Option<CloseHook>,
}

impl Hooks {
    /// Start with every default hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the open hook.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn(&CommandChannel) + Send + Sync + 'static) -> Self {
        self.open = Some(Box::new(hook));
        self
    }

    /// Override the message hook.
    #[must_use]
    pub fn on_message(
        mut self,
        hook: impl Fn(Frame) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Box::new(hook));
        self
    }

    /// Override the error hook.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(hook));
        self
    }

    /// Override the close hook.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.close = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_open", &self.open.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_close", &self.close.is_some())
            .finish()
    }
}

impl StreamHandler for Hooks {
    fn on_open(&self, commands: &CommandChannel) {
        match &self.open {
            Some(hook) => hook(commands),
            None => default_on_open(commands),
        }
    }

    fn on_message(&self, frame: Frame) -> anyhow::Result<()> {
        match &self.message {
            Some(hook) => hook(frame),
            None => {
                default_on_message(&frame);
                Ok(())
            }
        }
    }

    fn on_error(&self, error: &StreamError) {
        match &self.error {
            Some(hook) => hook(error),
            None => default_on_error(error),
        }
    }

    fn on_close(&self, close: &CloseInfo) {
        match &self.close {
            Some(hook) => hook(close),
            None => default_on_close(close),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::application::services::command_channel;

    #[test]
    fn unset_hooks_fall_back_to_defaults() {
        let hooks = Hooks::new();
        let frame = Frame::decode(r#"{"ev":"trade"}"#).unwrap();
        assert!(StreamHandler::on_message(&hooks, frame).is_ok());
        StreamHandler::on_close(&hooks, &CloseInfo::terminal(Some(1000), "bye"));
    }

    #[test]
    fn overridden_hooks_are_called() {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opens);
        let hooks = Hooks::new()
            .on_open(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_message(|_| anyhow::bail!("rejected"));

        let (commands, _queue) = command_channel();
        StreamHandler::on_open(&hooks, &commands);
        StreamHandler::on_open(&hooks, &commands);
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        let frame = Frame::decode("{}").unwrap();
        assert_eq!(StreamHandler::on_message(&hooks, frame).unwrap_err().to_string(), "rejected");
    }

    #[test]
    fn debug_lists_overridden_hooks() {
        let debug = format!("{:?}", Hooks::new().on_error(|_| {}));
        assert!(debug.contains("on_error: true"));
        assert!(debug.contains("on_open: false"));
    }

    #[test]
    fn terminal_close_info() {
        let close = CloseInfo::terminal(None, "maximum reconnect attempts reached");
        assert!(close.is_terminal());
        assert_eq!(close.attempt, None);
    }
}
