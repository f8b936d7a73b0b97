//! Inbound Frames
//!
//! Server-to-client payloads decoded from the wire. Every frame is a JSON
//! value; objects usually carry an `ev` discriminator naming the event kind.
//!
//! ```json
//! {"ev":"trade","symb":"PETR4","px":36.12,"qty":100}
//! {"ev":"book","symb":"PETR4","bid":[{"px":36.11,"qty":300}],"offer":[{"px":36.13,"qty":200}]}
//! {"ev":"get_last_event","message":null}
//! ```

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

/// Errors decoding a raw frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Payload is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary payload is not UTF-8 text.
    #[error("binary frame is not UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// Payload is empty or whitespace.
    #[error("empty frame")]
    Empty,
}

/// Event kind carried in the `ev` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Free-form server message.
    Message,
    /// Trade print.
    Trade,
    /// Book update.
    Book,
    /// Reply to `available_to_subscribe`.
    AvailableToSubscribe,
    /// Reply to `subscribed_to`.
    SubscribedTo,
    /// Reply to `get_last_event`.
    GetLastEvent,
    /// Any other or missing discriminator.
    Other,
}

impl EventKind {
    /// Map an `ev` value to a kind.
    #[must_use]
    pub fn from_ev(ev: &str) -> Self {
        match ev {
            "message" => Self::Message,
            "trade" => Self::Trade,
            "book" => Self::Book,
            "available_to_subscribe" => Self::AvailableToSubscribe,
            "subscribed_to" => Self::SubscribedTo,
            "get_last_event" => Self::GetLastEvent,
            _ => Self::Other,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Trade => "trade",
            Self::Book => "book",
            Self::AvailableToSubscribe => "available_to_subscribe",
            Self::SubscribedTo => "subscribed_to",
            Self::GetLastEvent => "get_last_event",
            Self::Other => "other",
        }
    }
}

/// One price level of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    /// Price.
    pub price: Decimal,
    /// Quantity.
    pub quantity: Decimal,
}

/// Best bid and offer of a book event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopOfBook {
    /// Instrument, when the frame names one.
    pub ticker: Option<String>,
    /// Best bid.
    pub bid: Option<BookLevel>,
    /// Best offer.
    pub offer: Option<BookLevel>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    value: Value,
}

impl Frame {
    /// Decode a text payload.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or non-JSON payloads.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(Self {
            value: serde_json::from_str(trimmed)?,
        })
    }

    /// Decode a binary payload holding UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error for non-UTF-8, empty or non-JSON payloads.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::decode(std::str::from_utf8(bytes)?)
    }

    /// Wrap an already decoded value.
    #[must_use]
    pub const fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// Raw `ev` discriminator.
    #[must_use]
    pub fn ev(&self) -> Option<&str> {
        self.value.get("ev").and_then(Value::as_str)
    }

    /// Event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.ev().map_or(EventKind::Other, EventKind::from_ev)
    }

    /// Instrument symbol (`symb`).
    #[must_use]
    pub fn ticker(&self) -> Option<&str> {
        self.value.get("symb").and_then(Value::as_str)
    }

    /// Reply payload (`message`) of query events. `null` maps to `None`.
    #[must_use]
    pub fn message(&self) -> Option<&Value> {
        self.value.get("message").filter(|v| !v.is_null())
    }

    /// Best bid and offer, if the frame carries `bid` or `offer` levels.
    #[must_use]
    pub fn top_of_book(&self) -> Option<TopOfBook> {
        let bid = self.best_level("bid");
        let offer = self.best_level("offer");
        if bid.is_none() && offer.is_none() {
            return None;
        }
        Some(TopOfBook {
            ticker: self.ticker().map(str::to_string),
            bid,
            offer,
        })
    }

    fn best_level(&self, side: &str) -> Option<BookLevel> {
        let level = self.value.get(side)?.as_array()?.first()?;
        Some(BookLevel {
            price: decimal(level.get("px")?)?,
            quantity: decimal(level.get("qty")?)?,
        })
    }

    /// Borrow the decoded value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Take the decoded value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_trade() {
        let frame = Frame::decode(r#" {"ev":"trade","symb":"PETR4","px":36.12} "#).unwrap();
        assert_eq!(frame.kind(), EventKind::Trade);
        assert_eq!(frame.ticker(), Some("PETR4"));
        assert!(frame.top_of_book().is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Frame::decode("not json"), Err(FrameError::Json(_))));
        assert!(matches!(Frame::decode("   "), Err(FrameError::Empty)));
        assert!(matches!(
            Frame::decode_bytes(&[0xff, 0xfe]),
            Err(FrameError::NotUtf8(_))
        ));
    }

    #[test]
    fn unknown_or_missing_ev_is_other() {
        assert_eq!(Frame::decode(r#"{"ev":"news"}"#).unwrap().kind(), EventKind::Other);
        assert_eq!(Frame::decode("[1,2,3]").unwrap().kind(), EventKind::Other);
    }

    #[test]
    fn top_of_book_reads_first_levels() {
        let frame = Frame::decode(
            r#"{"ev":"book","symb":"ABEVM138","bid":[{"px":13.8,"qty":100},{"px":13.7,"qty":5}],"offer":[{"px":"13.9","qty":200}]}"#,
        )
        .unwrap();
        let tob = frame.top_of_book().unwrap();
        assert_eq!(tob.ticker.as_deref(), Some("ABEVM138"));
        let bid = tob.bid.unwrap();
        assert_eq!(bid.price, Decimal::from_str("13.8").unwrap());
        assert_eq!(bid.quantity, Decimal::from(100));
        assert_eq!(tob.offer.unwrap().price, Decimal::from_str("13.9").unwrap());
    }

    #[test]
    fn empty_side_is_none() {
        let frame = Frame::decode(r#"{"ev":"book","bid":[],"offer":[{"px":1,"qty":1}]}"#).unwrap();
        let tob = frame.top_of_book().unwrap();
        assert!(tob.bid.is_none());
        assert!(tob.offer.is_some());
    }

    #[test]
    fn null_message_is_none() {
        let frame = Frame::decode(r#"{"ev":"get_last_event","message":null}"#).unwrap();
        assert_eq!(frame.kind(), EventKind::GetLastEvent);
        assert!(frame.message().is_none());

        let frame =
            Frame::decode(r#"{"ev":"available_to_subscribe","message":["PETR4"]}"#).unwrap();
        assert_eq!(frame.message().and_then(Value::as_array).map(Vec::len), Some(1));
    }
}
