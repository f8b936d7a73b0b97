//! Control Commands
//!
//! Client-to-server messages sent over a market data socket. Every command
//! serializes to `{"action": ..., "params": ...}`, with `params` omitted for
//! parameterless actions and an optional `type` tag for candle variants.
//!
//! # Examples
//!
//! ```json
//! {"action":"subscribe","params":["PETR4","VALE3"]}
//! {"action":"subscribe","params":{"tickers":["PETR4"],"n":5}}
//! {"action":"get_last_event","params":"PETR4"}
//! {"action":"subscribe","params":["PETR4"],"type":"partial"}
//! {"action":"stoploss_status"}
//! ```

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Accepted book depth for `subscribe` on book feeds.
pub const BOOK_DEPTH_RANGE: RangeInclusive<u32> = 1..=10;

// =============================================================================
// Error Type
// =============================================================================

/// Errors building or sending commands.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Book depth outside [`BOOK_DEPTH_RANGE`].
    #[error("book depth `n` must be between 1 and 10, got {0}")]
    BookDepthOutOfRange(u32),

    /// The connection that drains the channel no longer exists.
    #[error("command channel is closed")]
    Closed,

    /// Command could not be encoded.
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// Command Types
// =============================================================================

/// Control action understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Start receiving instruments.
    Subscribe,
    /// Stop receiving instruments.
    Unsubscribe,
    /// List instruments the connection is subscribed to.
    SubscribedTo,
    /// List instruments the connection may subscribe to.
    AvailableToSubscribe,
    /// Fetch the most recent event of an instrument.
    GetLastEvent,
    /// Register stop loss notifications.
    NotifyStoploss,
    /// Report registered stop loss notifications.
    StoplossStatus,
    /// Remove all stop loss notifications.
    ClearStoploss,
    /// Fetch the latest headlines of a news feed.
    LatestNews,
}

impl Action {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::SubscribedTo => "subscribed_to",
            Self::AvailableToSubscribe => "available_to_subscribe",
            Self::GetLastEvent => "get_last_event",
            Self::NotifyStoploss => "notify_stoploss",
            Self::StoplossStatus => "stoploss_status",
            Self::ClearStoploss => "clear_stoploss",
            Self::LatestNews => "latest_news",
        }
    }
}

/// A control message queued for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Requested action.
    pub action: Action,
    /// Action parameters, absent for parameterless actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Candle subscription variant.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub candle_type: Option<String>,
}

fn ticker_list<I, S>(instruments: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Array(
        instruments
            .into_iter()
            .map(|s| Value::String(s.into()))
            .collect(),
    )
}

impl Command {
    const fn bare(action: Action) -> Self {
        Self {
            action,
            params: None,
            candle_type: None,
        }
    }

    const fn with_params(action: Action, params: Value) -> Self {
        Self {
            action,
            params: Some(params),
            candle_type: None,
        }
    }

    /// Subscribe to a list of instruments.
    pub fn subscribe<I, S>(instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_params(Action::Subscribe, ticker_list(instruments))
    }

    /// Subscribe to book instruments with a maximum book level.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::BookDepthOutOfRange`] unless `depth` is in 1..=10.
    pub fn subscribe_book<I, S>(instruments: I, depth: u32) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !BOOK_DEPTH_RANGE.contains(&depth) {
            return Err(CommandError::BookDepthOutOfRange(depth));
        }
        Ok(Self::with_params(
            Action::Subscribe,
            json!({ "tickers": ticker_list(instruments), "n": depth }),
        ))
    }

    /// Unsubscribe from a list of instruments.
    pub fn unsubscribe<I, S>(instruments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_params(Action::Unsubscribe, ticker_list(instruments))
    }

    /// Subscribe to partial or closed candle updates.
    pub fn candle_subscribe<I, S>(instruments: I, candle_type: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candle_type: Some(candle_type.into()),
            ..Self::subscribe(instruments)
        }
    }

    /// Unsubscribe from partial or closed candle updates.
    pub fn candle_unsubscribe<I, S>(instruments: I, candle_type: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candle_type: Some(candle_type.into()),
            ..Self::unsubscribe(instruments)
        }
    }

    /// Ask which instruments the connection is subscribed to.
    #[must_use]
    pub const fn subscribed_to() -> Self {
        Self::bare(Action::SubscribedTo)
    }

    /// Ask which instruments are available.
    #[must_use]
    pub const fn available_to_subscribe() -> Self {
        Self::bare(Action::AvailableToSubscribe)
    }

    /// Ask for the last event of one instrument.
    pub fn get_last_event(ticker: impl Into<String>) -> Self {
        Self::with_params(Action::GetLastEvent, Value::String(ticker.into()))
    }

    /// Register stop loss notifications.
    #[must_use]
    pub const fn notify_stoploss(params: Value) -> Self {
        Self::with_params(Action::NotifyStoploss, params)
    }

    /// Ask for the stop loss notification status.
    #[must_use]
    pub const fn stoploss_status() -> Self {
        Self::bare(Action::StoplossStatus)
    }

    /// Remove every stop loss notification.
    #[must_use]
    pub const fn clear_stoploss() -> Self {
        Self::bare(Action::ClearStoploss)
    }

    /// Ask a news feed for its latest headlines.
    #[must_use]
    pub const fn latest_news() -> Self {
        Self::bare(Action::LatestNews)
    }

    /// Instruments named by a subscribe or unsubscribe command.
    #[must_use]
    pub fn instruments(&self) -> Vec<String> {
        let list = match &self.params {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Object(map)) => match map.get("tickers") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            },
            _ => &[],
        };
        list.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    /// Book depth of a `subscribe_book` command.
    #[must_use]
    pub fn book_depth(&self) -> Option<u32> {
        self.params
            .as_ref()?
            .get("n")?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, CommandError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn encoded(command: &Command) -> Value {
        serde_json::from_str(&command.to_json().unwrap()).unwrap()
    }

    #[test]
    fn subscribe_shape() {
        let cmd = Command::subscribe(["PETR4", "VALE3"]);
        assert_eq!(
            encoded(&cmd),
            json!({"action": "subscribe", "params": ["PETR4", "VALE3"]})
        );
        assert_eq!(cmd.instruments(), vec!["PETR4", "VALE3"]);
        assert_eq!(cmd.book_depth(), None);
    }

    #[test]
    fn book_subscribe_shape() {
        let cmd = Command::subscribe_book(["PETR4"], 5).unwrap();
        assert_eq!(
            encoded(&cmd),
            json!({"action": "subscribe", "params": {"tickers": ["PETR4"], "n": 5}})
        );
        assert_eq!(cmd.instruments(), vec!["PETR4"]);
        assert_eq!(cmd.book_depth(), Some(5));
    }

    #[test_case(0)]
    #[test_case(11)]
    fn book_depth_out_of_range(depth: u32) {
        let err = Command::subscribe_book(["PETR4"], depth).unwrap_err();
        assert!(matches!(err, CommandError::BookDepthOutOfRange(d) if d == depth));
    }

    #[test]
    fn candle_commands_carry_type() {
        let cmd = Command::candle_subscribe(["WINFUT"], "partial");
        assert_eq!(
            encoded(&cmd),
            json!({"action": "subscribe", "params": ["WINFUT"], "type": "partial"})
        );
        let cmd = Command::candle_unsubscribe(["WINFUT"], "closed");
        assert_eq!(
            encoded(&cmd),
            json!({"action": "unsubscribe", "params": ["WINFUT"], "type": "closed"})
        );
    }

    #[test]
    fn get_last_event_takes_single_ticker() {
        assert_eq!(
            encoded(&Command::get_last_event("ABEVM138")),
            json!({"action": "get_last_event", "params": "ABEVM138"})
        );
    }

    #[test_case(Command::subscribed_to(), "subscribed_to")]
    #[test_case(Command::available_to_subscribe(), "available_to_subscribe")]
    #[test_case(Command::stoploss_status(), "stoploss_status")]
    #[test_case(Command::clear_stoploss(), "clear_stoploss")]
    #[test_case(Command::latest_news(), "latest_news")]
    fn parameterless_actions_omit_params(cmd: Command, action: &str) {
        assert_eq!(encoded(&cmd), json!({ "action": action }));
        assert_eq!(cmd.action.as_str(), action);
    }

    #[test]
    fn notify_stoploss_passes_object_through() {
        let params = json!({"PETR4": {"price": 30.5, "side": "sell"}});
        assert_eq!(
            encoded(&Command::notify_stoploss(params.clone())),
            json!({"action": "notify_stoploss", "params": params})
        );
    }

    #[test]
    fn decodes_from_wire_form() {
        let cmd: Command =
            serde_json::from_str(r#"{"action":"unsubscribe","params":["BBAS3"]}"#).unwrap();
        assert_eq!(cmd, Command::unsubscribe(["BBAS3"]));
    }
}
