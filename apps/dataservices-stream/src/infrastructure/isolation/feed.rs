//! Process-Isolated Market Data Feed
//!
//! Runs the connection inside a separate worker process so that a slow or
//! crashing handler never stalls socket reads.
//!
//! ```text
//!            ┌──────────── worker process ─────────────┐
//!  stdin  ──►│ commands ──► Supervisor ──► WebSocket   │
//!  stdout ◄──│ envelopes ◄── EnvelopeHandler           │
//!            └─────────────────────────────────────────┘
//!  reader task ──► inbound queue ──► consumer thread ──► handler
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::FeedError;
use super::protocol::WorkerEnvelope;
use super::worker::{WORKER_BINARY_NAME, WorkerSettings};
use crate::application::ports::{CloseInfo, StreamError, StreamHandler};
use crate::application::services::{
    CommandChannel, CommandQueue, DeliveryMode, Dispatcher, LatencyConfig, command_channel,
};
use crate::infrastructure::config::{DEFAULT_REPORT_INTERVAL, StreamConfig};
use crate::infrastructure::metrics::{self, QueueKind};

/// Name of the parent-side consumer thread.
const CONSUMER_THREAD_NAME: &str = "dataservices-feed-consumer";

/// Close reason reported when the worker dies on its own.
pub const WORKER_EXITED_REASON: &str = "worker exited";

// =============================================================================
// Configuration
// =============================================================================

/// Isolated feed settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Worker binary.
    pub worker_path: PathBuf,
    /// Settings handed to the worker.
    pub worker: WorkerSettings,
    /// Interval between queue depth reports.
    pub queue_log_interval: Duration,
    /// Latency sampling on the consumer side, when enabled.
    pub latency: Option<LatencyConfig>,
}

impl FeedConfig {
    /// Settings with the worker binary next to the current executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn new(worker: WorkerSettings) -> Result<Self, FeedError> {
        Ok(Self {
            worker_path: default_worker_path()?,
            worker,
            queue_log_interval: DEFAULT_REPORT_INTERVAL,
            latency: None,
        })
    }

    /// Settings for a stream configuration.
    ///
    /// # Errors
    ///
    /// See [`FeedConfig::new`].
    pub fn from_stream_config(config: &StreamConfig) -> Result<Self, FeedError> {
        let mut feed = Self::new(WorkerSettings::from_stream_config(config))?;
        feed.queue_log_interval = config.queue_log_interval;
        feed.latency.clone_from(&config.latency);
        Ok(feed)
    }

    /// Use a specific worker binary.
    #[must_use]
    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = path.into();
        self
    }
}

/// Worker binary installed next to the current executable.
///
/// # Errors
///
/// Returns an error if the current executable cannot be located.
pub fn default_worker_path() -> std::io::Result<PathBuf> {
    let name = format!("{WORKER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
    Ok(std::env::current_exe()?.with_file_name(name))
}

// =============================================================================
// Feed
// =============================================================================

/// Units owned by a running feed.
struct Running {
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    monitor: JoinHandle<()>,
    consumer: std::thread::JoinHandle<()>,
}

/// Market data feed whose connection lives in a worker process.
///
/// The handler runs on a parent-side consumer thread, in the order the
/// worker forwarded events.
pub struct MarketDataFeed {
    config: FeedConfig,
    handler: Arc<dyn StreamHandler>,
    commands: CommandChannel,
    queue: parking_lot::Mutex<Option<CommandQueue>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    finished: Arc<watch::Sender<bool>>,
    units: tokio::sync::Mutex<Option<Running>>,
}

impl std::fmt::Debug for MarketDataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFeed")
            .field("worker_path", &self.config.worker_path)
            .field("url", &self.config.worker.url)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl MarketDataFeed {
    /// Create a feed that has not started its worker.
    #[must_use]
    pub fn new(config: FeedConfig, handler: Arc<dyn StreamHandler>) -> Self {
        let (commands, queue) = command_channel();
        Self {
            config,
            handler,
            commands,
            queue: parking_lot::Mutex::new(Some(queue)),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(watch::channel(false).0),
            units: tokio::sync::Mutex::new(None),
        }
    }

    /// Command channel. Commands are forwarded to the worker's stdin.
    #[must_use]
    pub fn commands(&self) -> CommandChannel {
        self.commands.clone()
    }

    /// Whether the consumer is delivering events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Worker binary this feed spawns.
    #[must_use]
    pub fn worker_path(&self) -> &Path {
        &self.config.worker_path
    }

    /// Spawn the worker and start forwarding events. Returns once every
    /// unit is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed was already started or the worker or
    /// consumer thread cannot be spawned.
    pub async fn run(&self) -> Result<(), FeedError> {
        let mut units = self.units.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let queue = self.queue.lock().take().ok_or(FeedError::AlreadyStarted)?;

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.handler), DeliveryMode::Inline)?;
        if let Some(latency) = self.config.latency.clone() {
            dispatcher = dispatcher.with_latency(latency);
        }

        let (tx, rx) = mpsc::unbounded_channel::<WorkerEnvelope>();
        let depth = Arc::new(AtomicUsize::new(0));
        self.running.store(true, Ordering::SeqCst);

        let consumer = {
            let commands = self.commands.clone();
            let running = Arc::clone(&self.running);
            let depth = Arc::clone(&depth);
            let finished = Arc::clone(&self.finished);
            std::thread::Builder::new()
                .name(CONSUMER_THREAD_NAME.to_string())
                .spawn(move || consume(rx, &dispatcher, &commands, &running, &depth, &finished))
        };
        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(FeedError::Io(e));
            }
        };

        let spawned = ProcessCommand::new(&self.config.worker_path)
            .envs(self.config.worker.to_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                drop(tx);
                join_consumer(consumer).await;
                return Err(FeedError::Spawn {
                    path: self.config.worker_path.clone(),
                    source,
                });
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.running.store(false, Ordering::SeqCst);
            drop(tx);
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Worker already gone");
            }
            join_consumer(consumer).await;
            return Err(FeedError::MissingPipe);
        };

        tracing::info!(
            pid = child.id(),
            worker = %self.config.worker_path.display(),
            url = %self.config.worker.url,
            "Worker started"
        );

        let reader = tokio::spawn(read_envelopes(
            stdout,
            tx,
            Arc::clone(&depth),
            self.cancel.clone(),
        ));
        let writer = tokio::spawn(forward_commands(stdin, queue, self.cancel.clone()));
        let monitor = tokio::spawn(log_queue_depths(
            self.config.queue_log_interval,
            depth,
            self.commands.clone(),
            self.cancel.clone(),
        ));

        *units = Some(Running {
            child,
            reader,
            writer,
            monitor,
            consumer,
        });
        Ok(())
    }

    /// Wait until the feed delivered a terminal close or was closed.
    pub async fn wait(&self) {
        let mut finished = self.finished.subscribe();
        if finished.wait_for(|done| *done).await.is_err() {
            tracing::debug!("Finished channel closed");
        }
    }

    /// Kill the worker and stop every unit.
    ///
    /// Events still queued from the worker are discarded. Safe to call
    /// repeatedly and on a feed that never ran.
    pub async fn close(&self) {
        self.cancel.cancel();
        let Some(mut units) = self.units.lock().await.take() else {
            self.finished.send_replace(true);
            return;
        };

        if let Err(e) = units.child.kill().await {
            tracing::debug!(error = %e, "Worker already gone");
        }
        self.running.store(false, Ordering::SeqCst);

        for (name, task) in [
            ("reader", units.reader),
            ("writer", units.writer),
            ("monitor", units.monitor),
        ] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Feed task panicked");
            }
        }
        join_consumer(units.consumer).await;

        self.finished.send_replace(true);
        tracing::info!("Feed closed");
    }
}

async fn join_consumer(consumer: std::thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || consumer.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::error!("Consumer thread panicked"),
        Err(e) => tracing::error!(error = %e, "Failed to join consumer thread"),
    }
}

// =============================================================================
// Units
// =============================================================================

/// Parse worker stdout into the inbound queue.
///
/// A worker that exits without a terminal close gets one synthesized,
/// unless the feed is being closed.
async fn read_envelopes(
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<WorkerEnvelope>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut terminal = false;

    let reason = loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match WorkerEnvelope::decode(&line) {
                Ok(envelope) => {
                    terminal |= envelope.is_terminal();
                    depth.fetch_add(1, Ordering::Relaxed);
                    if tx.send(envelope).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring undecodable worker line"),
            },
            Ok(None) => break WORKER_EXITED_REASON.to_string(),
            Err(e) => break format!("{WORKER_EXITED_REASON}: {e}"),
        }
    };

    if terminal || cancel.is_cancelled() {
        return;
    }
    tracing::error!(reason = %reason, "Worker exited unexpectedly");
    depth.fetch_add(1, Ordering::Relaxed);
    let _ = tx.send(WorkerEnvelope::from_close(&CloseInfo::terminal(None, reason)));
}

/// Forward commands to the worker's stdin, one JSON line each.
async fn forward_commands(mut stdin: ChildStdin, mut queue: CommandQueue, cancel: CancellationToken) {
    loop {
        let command = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = queue.recv() => command,
        };
        let Some(command) = command else { break };
        let line = match command.to_json() {
            Ok(json) => json + "\n",
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unencodable command");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Worker stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(error = %e, "Worker stdin closed");
            break;
        }
    }
}

/// Log and record queue depths every `interval`.
async fn log_queue_depths(
    interval: Duration,
    inbound: Arc<AtomicUsize>,
    commands: CommandChannel,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let server = inbound.load(Ordering::Relaxed);
                let client = commands.pending();
                metrics::set_queue_depth(QueueKind::Inbound, server);
                metrics::set_queue_depth(QueueKind::Outbound, client);
                tracing::info!(
                    server_queue = server,
                    client_queue = client,
                    "Server queue: {server} | Client queue: {client}"
                );
            }
        }
    }
}

/// Deliver envelopes to the handler until the queue closes or the feed
/// stops running.
fn consume(
    mut rx: mpsc::UnboundedReceiver<WorkerEnvelope>,
    dispatcher: &Dispatcher,
    commands: &CommandChannel,
    running: &AtomicBool,
    depth: &AtomicUsize,
    finished: &watch::Sender<bool>,
) {
    while let Some(envelope) = rx.blocking_recv() {
        depth.fetch_sub(1, Ordering::Relaxed);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match envelope {
            WorkerEnvelope::Open => dispatcher.open(commands),
            WorkerEnvelope::Frame { value } => dispatcher.dispatch_value(value),
            WorkerEnvelope::Error { message } => dispatcher.error(StreamError::Worker(message)),
            close @ WorkerEnvelope::Close { .. } => {
                let terminal = close.is_terminal();
                if let Some(info) = close.close_info() {
                    dispatcher.close(info);
                }
                if terminal {
                    finished.send_replace(true);
                }
            }
        }
    }
    tracing::debug!("Feed consumer stopped");
}
