//! Command Channel
//!
//! Outbound control messages are appended to an unbounded queue and
//! drained by whichever connection is currently open. Commands queued while
//! disconnected are flushed, in order, after the next open.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::command::{Command, CommandError};

/// Create a connected channel and queue pair.
#[must_use]
pub fn command_channel() -> (CommandChannel, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        CommandChannel {
            tx,
            pending: Arc::clone(&pending),
        },
        CommandQueue { rx, pending },
    )
}

// =============================================================================
// Sending Half
// =============================================================================

/// Cloneable handle for queueing commands.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandChannel {
    /// Queue a command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn send(&self, command: Command) -> Result<(), CommandError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.tx.send(command).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            CommandError::Closed
        })
    }

    /// Subscribe to a list of instruments.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn subscribe<I, S>(&self, instruments: I) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::subscribe(instruments))
    }

    /// Subscribe to book instruments up to `depth` levels.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::BookDepthOutOfRange`] unless `depth` is in
    /// 1..=10, or [`CommandError::Closed`] once the queue has been dropped.
    pub fn subscribe_book<I, S>(&self, instruments: I, depth: u32) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::subscribe_book(instruments, depth)?)
    }

    /// Unsubscribe from a list of instruments.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn unsubscribe<I, S>(&self, instruments: I) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::unsubscribe(instruments))
    }

    /// Subscribe to candle updates of one variant.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn candle_subscribe<I, S>(
        &self,
        instruments: I,
        candle_type: impl Into<String>,
    ) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::candle_subscribe(instruments, candle_type))
    }

    /// Unsubscribe from candle updates of one variant.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn candle_unsubscribe<I, S>(
        &self,
        instruments: I,
        candle_type: impl Into<String>,
    ) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::candle_unsubscribe(instruments, candle_type))
    }

    /// Ask which instruments are subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn subscribed_to(&self) -> Result<(), CommandError> {
        self.send(Command::subscribed_to())
    }

    /// Ask which instruments are available.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn available_to_subscribe(&self) -> Result<(), CommandError> {
        self.send(Command::available_to_subscribe())
    }

    /// Ask for the last event of one instrument.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn get_last_event(&self, ticker: impl Into<String>) -> Result<(), CommandError> {
        self.send(Command::get_last_event(ticker))
    }

    /// Register stop loss notifications.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn notify_stoploss(&self, params: Value) -> Result<(), CommandError> {
        self.send(Command::notify_stoploss(params))
    }

    /// Ask for the stop loss notification status.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn stoploss_status(&self) -> Result<(), CommandError> {
        self.send(Command::stoploss_status())
    }

    /// Remove every stop loss notification.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn clear_stoploss(&self) -> Result<(), CommandError> {
        self.send(Command::clear_stoploss())
    }

    /// Ask a news feed for its latest headlines.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Closed`] once the queue has been dropped.
    pub fn latest_news(&self) -> Result<(), CommandError> {
        self.send(Command::latest_news())
    }

    /// Commands queued but not yet taken by a writer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Whether the queue has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Receiving Half
// =============================================================================

/// Single-consumer end of the command channel.
#[derive(Debug)]
pub struct CommandQueue {
    rx: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    /// Wait for the next command. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Command> {
        let command = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(command)
    }

    /// Take a command without waiting.
    pub fn try_recv(&mut self) -> Option<Command> {
        let command = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(command)
    }

    /// Commands queued but not yet taken.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::Action;

    #[tokio::test]
    async fn commands_drain_in_order() {
        let (channel, mut queue) = command_channel();
        channel.subscribe(["PETR4"]).unwrap();
        channel.get_last_event("PETR4").unwrap();
        channel.unsubscribe(["PETR4"]).unwrap();
        assert_eq!(channel.pending(), 3);

        let actions: Vec<Action> = [
            queue.recv().await.unwrap(),
            queue.recv().await.unwrap(),
            queue.recv().await.unwrap(),
        ]
        .iter()
        .map(|c| c.action)
        .collect();
        assert_eq!(
            actions,
            vec![Action::Subscribe, Action::GetLastEvent, Action::Unsubscribe]
        );
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn book_depth_is_validated_before_queueing() {
        let (channel, mut queue) = command_channel();
        assert!(matches!(
            channel.subscribe_book(["PETR4"], 11),
            Err(CommandError::BookDepthOutOfRange(11))
        ));
        assert_eq!(channel.pending(), 0);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn send_fails_once_queue_is_dropped() {
        let (channel, queue) = command_channel();
        drop(queue);
        assert!(channel.is_closed());
        assert!(matches!(channel.latest_news(), Err(CommandError::Closed)));
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn clones_share_one_queue() {
        let (channel, mut queue) = command_channel();
        let other = channel.clone();
        channel.stoploss_status().unwrap();
        other.clear_stoploss().unwrap();
        assert_eq!(channel.pending(), 2);
        assert_eq!(queue.try_recv().unwrap().action, Action::StoplossStatus);
        assert_eq!(queue.try_recv().unwrap().action, Action::ClearStoploss);
    }
}
