//! Inbound Dispatcher
//!
//! Decodes raw frames handed over by the read loop and delivers them, with
//! the other connection events, to the user handler.
//!
//! # Delivery Modes
//!
//! | Mode | Runs on | Ordering |
//! |------|---------|----------|
//! | `Inline` | The read loop | Wire order, but a slow handler stalls reads |
//! | `Queued` | One dedicated consumer thread | Wire order, all hooks in sequence |
//! | `Concurrent` | One blocking-pool unit per frame | **None** |
//!
//! Handler failures never reach the read loop: errors and panics raised by
//! `on_message` are reported through `on_error`, and undecodable payloads
//! are reported as [`StreamError::MalformedFrame`].

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::commands::CommandChannel;
use super::latency::{LatencyConfig, LatencySampler};
use crate::application::ports::{CloseInfo, StreamError, StreamHandler};
use crate::domain::frame::{Frame, FrameError};
use crate::infrastructure::metrics;

/// Name of the queued-mode consumer thread.
const CONSUMER_THREAD_NAME: &str = "dataservices-consumer";

// =============================================================================
// Delivery Mode
// =============================================================================

/// Where handler hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    /// On the read loop itself.
    #[default]
    Inline,
    /// On a single consumer thread fed by an unbounded queue.
    Queued,
    /// Each frame on its own blocking-pool unit. Frames may be reordered.
    Concurrent,
}

impl DeliveryMode {
    /// Every mode.
    pub const ALL: [Self; 3] = [Self::Inline, Self::Queued, Self::Concurrent];

    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Queued => "queued",
            Self::Concurrent => "concurrent",
        }
    }

    /// Parse a configuration name, ignoring case.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|mode| mode.as_str() == s)
    }

    /// Whether frames reach the handler in wire-arrival order.
    #[must_use]
    pub const fn preserves_order(self) -> bool {
        !matches!(self, Self::Concurrent)
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Handler Events
// =============================================================================

enum HandlerEvent {
    Open(CommandChannel),
    Message(Frame),
    Error(StreamError),
    Close(CloseInfo),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

fn report_failure(handler: &dyn StreamHandler, failure: String) {
    metrics::record_handler_error();
    let error = StreamError::Handler(failure);
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_error(&error))) {
        tracing::error!(
            error = %error,
            panic = %panic_message(panic.as_ref()),
            "Error hook panicked"
        );
    }
}

fn deliver(handler: &dyn StreamHandler, event: HandlerEvent) {
    match event {
        HandlerEvent::Message(frame) => {
            match catch_unwind(AssertUnwindSafe(|| handler.on_message(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report_failure(handler, format!("{e:#}")),
                Err(panic) => report_failure(handler, panic_message(panic.as_ref())),
            }
        }
        HandlerEvent::Open(commands) => {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_open(&commands))) {
                report_failure(handler, panic_message(panic.as_ref()));
            }
        }
        HandlerEvent::Error(error) => {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_error(&error))) {
                tracing::error!(
                    error = %error,
                    panic = %panic_message(panic.as_ref()),
                    "Error hook panicked"
                );
            }
        }
        HandlerEvent::Close(close) => {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_close(&close))) {
                report_failure(handler, panic_message(panic.as_ref()));
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Delivers connection events to a [`StreamHandler`].
pub struct Dispatcher {
    handler: Arc<dyn StreamHandler>,
    mode: DeliveryMode,
    queue: Option<mpsc::UnboundedSender<HandlerEvent>>,
    consumer: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
    sampler: Option<Mutex<LatencySampler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("pending", &self.pending())
            .field("latency", &self.sampler.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher. `Queued` mode starts its consumer thread here.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer thread cannot be spawned.
    pub fn new(handler: Arc<dyn StreamHandler>, mode: DeliveryMode) -> std::io::Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let (queue, consumer) = if mode == DeliveryMode::Queued {
            let (tx, mut rx) = mpsc::unbounded_channel::<HandlerEvent>();
            let consumer_handler = Arc::clone(&handler);
            let consumer_pending = Arc::clone(&pending);
            let consumer = std::thread::Builder::new()
                .name(CONSUMER_THREAD_NAME.to_string())
                .spawn(move || {
                    while let Some(event) = rx.blocking_recv() {
                        consumer_pending.fetch_sub(1, Ordering::Relaxed);
                        deliver(consumer_handler.as_ref(), event);
                    }
                    tracing::debug!("Consumer thread drained");
                })?;
            (Some(tx), Some(consumer))
        } else {
            (None, None)
        };

        Ok(Self {
            handler,
            mode,
            queue,
            consumer,
            pending,
            sampler: None,
        })
    }

    /// Sample latency and throughput of every decoded frame.
    #[must_use]
    pub fn with_latency(mut self, config: LatencyConfig) -> Self {
        self.sampler = Some(Mutex::new(LatencySampler::new(config)));
        self
    }

    /// Delivery mode.
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Events queued for the consumer thread.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Decode and deliver a text frame.
    pub fn dispatch_text(&self, text: &str) {
        self.dispatch_decoded(Frame::decode(text));
    }

    /// Decode and deliver a binary frame holding UTF-8 JSON.
    pub fn dispatch_bytes(&self, bytes: &[u8]) {
        self.dispatch_decoded(Frame::decode_bytes(bytes));
    }

    fn dispatch_decoded(&self, decoded: Result<Frame, FrameError>) {
        match decoded {
            Ok(frame) => {
                metrics::record_frame_received(frame.kind());
                if let Some(sampler) = &self.sampler {
                    sampler.lock().observe(&frame);
                }
                self.dispatch_frame(frame);
            }
            Err(e) => {
                metrics::record_malformed_frame();
                tracing::warn!(error = %e, "Dropping undecodable frame");
                self.error(StreamError::MalformedFrame(e));
            }
        }
    }

    /// Deliver a frame decoded elsewhere, counting and sampling it like a
    /// wire frame.
    pub fn dispatch_value(&self, value: serde_json::Value) {
        self.dispatch_decoded(Ok(Frame::from_value(value)));
    }

    /// Deliver an already decoded frame.
    pub fn dispatch_frame(&self, frame: Frame) {
        self.route(HandlerEvent::Message(frame));
    }

    /// Deliver the open event.
    pub fn open(&self, commands: &CommandChannel) {
        self.route(HandlerEvent::Open(commands.clone()));
    }

    /// Deliver an error.
    pub fn error(&self, error: StreamError) {
        self.route(HandlerEvent::Error(error));
    }

    /// Deliver a close event.
    pub fn close(&self, close: CloseInfo) {
        self.route(HandlerEvent::Close(close));
    }

    fn route(&self, event: HandlerEvent) {
        match (self.mode, event) {
            (DeliveryMode::Queued, event) => self.enqueue(event),
            (DeliveryMode::Concurrent, HandlerEvent::Message(frame)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let handler = Arc::clone(&self.handler);
                    runtime.spawn_blocking(move || {
                        deliver(handler.as_ref(), HandlerEvent::Message(frame));
                    });
                } else {
                    deliver(self.handler.as_ref(), HandlerEvent::Message(frame));
                }
            }
            (_, event) => deliver(self.handler.as_ref(), event),
        }
    }

    fn enqueue(&self, event: HandlerEvent) {
        let Some(queue) = &self.queue else {
            deliver(self.handler.as_ref(), event);
            return;
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        if queue.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("Consumer thread is gone, dropping event");
        }
    }

    /// Stop accepting events and join the consumer thread.
    ///
    /// Events already queued are delivered before this returns.
    pub fn shutdown(mut self) {
        drop(self.queue.take());
        if let Some(consumer) = self.consumer.take()
            && consumer.join().is_err()
        {
            tracing::error!("Consumer thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::application::ports::Hooks;
    use crate::application::services::command_channel;
    use test_case::test_case;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_hooks(log: &Log) -> Hooks {
        let messages = Arc::clone(log);
        let errors = Arc::clone(log);
        let closes = Arc::clone(log);
        let opens = Arc::clone(log);
        Hooks::new()
            .on_open(move |_| opens.lock().push("open".to_string()))
            .on_message(move |frame| {
                let seq = frame.value()["seq"].as_u64().unwrap_or_default();
                messages.lock().push(format!("msg:{seq}"));
                Ok(())
            })
            .on_error(move |e| errors.lock().push(format!("error:{e}")))
            .on_close(move |c| closes.lock().push(format!("close:{}", c.reason)))
    }

    #[test_case("inline", DeliveryMode::Inline)]
    #[test_case("Queued", DeliveryMode::Queued)]
    #[test_case(" CONCURRENT ", DeliveryMode::Concurrent)]
    fn mode_parses(input: &str, expected: DeliveryMode) {
        assert_eq!(DeliveryMode::parse(input), Some(expected));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert_eq!(DeliveryMode::parse("parallel"), None);
        assert!(!DeliveryMode::Concurrent.preserves_order());
        assert!(DeliveryMode::Queued.preserves_order());
    }

    #[test]
    fn inline_handler_errors_do_not_stop_delivery() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let hooks = Hooks::new()
            .on_message(|_| anyhow::bail!("handler rejected frame"))
            .on_error(move |e| {
                assert!(matches!(e, StreamError::Handler(msg) if msg == "handler rejected frame"));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let dispatcher = Dispatcher::new(Arc::new(hooks), DeliveryMode::Inline).unwrap();

        for seq in 0..3 {
            dispatcher.dispatch_text(&format!(r#"{{"ev":"trade","seq":{seq}}}"#));
        }
        assert_eq!(errors.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn handler_panics_are_contained() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let hooks = Hooks::new()
            .on_message(|_| panic!("boom"))
            .on_error(move |e| {
                assert_eq!(e.to_string(), "message handler failed: boom");
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let dispatcher = Dispatcher::new(Arc::new(hooks), DeliveryMode::Inline).unwrap();

        dispatcher.dispatch_text(r#"{"ev":"trade"}"#);
        dispatcher.dispatch_text(r#"{"ev":"trade"}"#);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_frames_go_to_error_hook() {
        let log: Log = Arc::default();
        let dispatcher = Dispatcher::new(Arc::new(recording_hooks(&log)), DeliveryMode::Inline)
            .unwrap();

        dispatcher.dispatch_text("{not json");
        dispatcher.dispatch_bytes(&[0xc3, 0x28]);
        dispatcher.dispatch_text(r#"{"seq":7}"#);

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(log[0].starts_with("error:malformed frame"));
        assert!(log[1].starts_with("error:malformed frame"));
        assert_eq!(log[2], "msg:7");
    }

    #[test]
    fn queued_mode_preserves_order_across_hooks() {
        let log: Log = Arc::default();
        let dispatcher =
            Dispatcher::new(Arc::new(recording_hooks(&log)), DeliveryMode::Queued).unwrap();
        let (commands, _queue) = command_channel();

        dispatcher.open(&commands);
        for seq in 0..100 {
            dispatcher.dispatch_text(&format!(r#"{{"seq":{seq}}}"#));
        }
        dispatcher.close(CloseInfo::terminal(Some(1000), "done"));
        dispatcher.shutdown();

        let log = log.lock();
        assert_eq!(log.len(), 102);
        assert_eq!(log[0], "open");
        for (i, entry) in log[1..101].iter().enumerate() {
            assert_eq!(entry, &format!("msg:{i}"));
        }
        assert_eq!(log[101], "close:done");
    }

    #[test]
    fn queued_mode_does_not_block_on_slow_handler() {
        let hooks = Hooks::new().on_message(|_| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        let dispatcher = Dispatcher::new(Arc::new(hooks), DeliveryMode::Queued).unwrap();

        let started = std::time::Instant::now();
        for _ in 0..10 {
            dispatcher.dispatch_text("{}");
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        dispatcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_mode_delivers_every_frame() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let hooks = Hooks::new().on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let dispatcher = Dispatcher::new(Arc::new(hooks), DeliveryMode::Concurrent).unwrap();

        for seq in 0..50 {
            dispatcher.dispatch_text(&format!(r#"{{"seq":{seq}}}"#));
        }

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn latency_sampling_does_not_affect_delivery() {
        let log: Log = Arc::default();
        let dispatcher = Dispatcher::new(Arc::new(recording_hooks(&log)), DeliveryMode::Inline)
            .unwrap()
            .with_latency(LatencyConfig::default());

        dispatcher.dispatch_text(r#"{"ev":"trade","seq":1,"tms":"garbage"}"#);
        dispatcher.dispatch_text(r#"{"ev":"trade","seq":2,"tms":1718000000000}"#);
        assert_eq!(*log.lock(), vec!["msg:1", "msg:2"]);
    }
}
