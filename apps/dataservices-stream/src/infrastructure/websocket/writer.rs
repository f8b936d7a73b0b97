//! Command Writer
//!
//! Per-connection task that forwards queued commands to the socket.
//!
//! The queue outlives the connection: commands sent while disconnected
//! wait in it and are written, in order, by the writer of the next
//! connection.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use crate::application::services::CommandQueue;
use crate::domain::subscription::SubscriptionSet;
use crate::infrastructure::metrics;

/// Reason sent with a client-initiated close frame.
pub const CLIENT_CLOSE_REASON: &str = "client closed";

/// Why the writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Connection ended; the socket is gone.
    Detached,
    /// Explicit close; a close frame was sent.
    Closed,
    /// A write failed.
    Failed,
    /// Every command sender is gone.
    Exhausted,
}

/// Forward commands until `stop` fires or a write fails.
///
/// A failed write cancels `stop`, ending the session's read loop too.
/// When `closing` has fired by the time the writer stops, a normal close
/// frame is written before returning.
pub async fn write_commands<S>(
    mut sink: S,
    queue: Arc<Mutex<CommandQueue>>,
    subscriptions: Arc<SubscriptionSet>,
    stop: CancellationToken,
    closing: CancellationToken,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut queue = queue.lock().await;

    let exit = loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break WriterExit::Detached,
            command = queue.recv() => {
                let Some(command) = command else {
                    break WriterExit::Exhausted;
                };
                let json = match command.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unencodable command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    tracing::warn!(
                        action = command.action.as_str(),
                        error = %e,
                        "Failed to write command"
                    );
                    stop.cancel();
                    break WriterExit::Failed;
                }
                subscriptions.apply(&command);
                metrics::record_command_sent(command.action);
                tracing::debug!(
                    action = command.action.as_str(),
                    pending = queue.pending(),
                    "Command sent"
                );
            }
        }
    };

    if closing.is_cancelled() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: CLIENT_CLOSE_REASON.into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
        return WriterExit::Closed;
    }
    exit
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::PollSender;

    use super::*;
    use crate::application::services::command_channel;
    use crate::domain::command::Command;

    fn text(message: &Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_queued_commands_in_order() {
        let (commands, queue) = command_channel();
        let queue = Arc::new(Mutex::new(queue));
        let subscriptions = Arc::new(SubscriptionSet::new());
        commands.subscribe(["PETR4"]).unwrap();
        commands.subscribed_to().unwrap();

        let (tx, mut rx) = mpsc::channel::<Message>(16);
        let stop = CancellationToken::new();
        let writer = tokio::spawn(write_commands(
            PollSender::new(tx),
            Arc::clone(&queue),
            Arc::clone(&subscriptions),
            stop.clone(),
            CancellationToken::new(),
        ));

        assert_eq!(
            text(&rx.recv().await.unwrap()),
            r#"{"action":"subscribe","params":["PETR4"]}"#
        );
        assert_eq!(
            text(&rx.recv().await.unwrap()),
            r#"{"action":"subscribed_to"}"#
        );
        assert!(subscriptions.contains("PETR4"));

        stop.cancel();
        assert_eq!(writer.await.unwrap(), WriterExit::Detached);
        assert_eq!(queue.lock().await.pending(), 0);
    }

    #[tokio::test]
    async fn detached_writer_leaves_commands_queued() {
        let (commands, queue) = command_channel();
        let queue = Arc::new(Mutex::new(queue));
        let stop = CancellationToken::new();
        stop.cancel();

        let (tx, _rx) = mpsc::channel::<Message>(16);
        let exit = write_commands(
            PollSender::new(tx),
            Arc::clone(&queue),
            Arc::new(SubscriptionSet::new()),
            stop,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, WriterExit::Detached);

        commands.send(Command::unsubscribe(["VALE3"])).unwrap();
        assert_eq!(queue.lock().await.pending(), 1);
    }

    #[tokio::test]
    async fn failed_write_stops_the_session() {
        let (commands, queue) = command_channel();
        let subscriptions = Arc::new(SubscriptionSet::new());
        commands.subscribe(["PETR4"]).unwrap();

        let (tx, rx) = mpsc::channel::<Message>(16);
        drop(rx);
        let stop = CancellationToken::new();
        let exit = write_commands(
            PollSender::new(tx),
            Arc::new(Mutex::new(queue)),
            Arc::clone(&subscriptions),
            stop.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, WriterExit::Failed);
        assert!(stop.is_cancelled());
        assert!(!subscriptions.contains("PETR4"));
    }

    #[tokio::test]
    async fn explicit_close_sends_close_frame() {
        let (_commands, queue) = command_channel();
        let stop = CancellationToken::new();
        let closing = stop.clone();
        stop.cancel();

        let (tx, mut rx) = mpsc::channel::<Message>(16);
        let exit = write_commands(
            PollSender::new(tx),
            Arc::new(Mutex::new(queue)),
            Arc::new(SubscriptionSet::new()),
            stop,
            closing,
        )
        .await;

        assert_eq!(exit, WriterExit::Closed);
        match rx.recv().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), CLIENT_CLOSE_REASON);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
