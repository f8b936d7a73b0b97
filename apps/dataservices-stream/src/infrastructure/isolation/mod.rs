//! Process Isolation Layer
//!
//! Moves the connection into a `dataservices-feed-worker` child process.
//! The parent keeps the handler, the command channel and the queues
//! between them; the worker keeps the socket.

mod feed;
mod protocol;
mod worker;

use std::path::PathBuf;

pub use feed::{FeedConfig, MarketDataFeed, WORKER_EXITED_REASON, default_worker_path};
pub use protocol::{EnvelopeHandler, WorkerEnvelope};
pub use worker::{WORKER_BINARY_NAME, WorkerSettings, run_worker};

use crate::application::ports::AuthError;
use crate::infrastructure::config::ConfigError;
use crate::infrastructure::websocket::SupervisorError;

/// Errors of the isolated feed and its worker.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Worker binary could not be started.
    #[error("failed to spawn worker {}: {source}", .path.display())]
    Spawn {
        /// Worker binary.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Worker started without piped stdin or stdout.
    #[error("worker stdio is not piped")]
    MissingPipe,

    /// Thread or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `run` was called twice.
    #[error("feed already started")]
    AlreadyStarted,

    /// Worker settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Token source could not be built.
    #[error("authentication failed: {0}")]
    Auth(AuthError),

    /// Worker supervisor stopped with an error.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Worker supervisor task panicked.
    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),
}
