//! Subscription Set
//!
//! Instruments requested on the current connection, with their optional
//! book depth or candle type.
//!
//! # Semantics
//!
//! - Updated when a subscribe/unsubscribe command is written to the socket
//! - Cleared when the connection ends
//! - Never replayed automatically: reissue subscriptions from the on-open hook

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::domain::command::{Action, Command};

/// Annotations of one subscribed instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionEntry {
    /// Maximum book level, for book feeds.
    pub depth: Option<u32>,
    /// Candle variant, for candle feeds.
    pub candle_type: Option<String>,
}

/// Thread-safe set of subscribed instruments.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: RwLock<BTreeMap<String, SubscriptionEntry>>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a command that reached the socket.
    ///
    /// Returns `true` if the set changed.
    pub fn apply(&self, command: &Command) -> bool {
        let instruments = command.instruments();
        if instruments.is_empty() {
            return false;
        }

        let mut entries = self.entries.write();
        match command.action {
            Action::Subscribe => {
                let entry = SubscriptionEntry {
                    depth: command.book_depth(),
                    candle_type: command.candle_type.clone(),
                };
                for instrument in instruments {
                    entries.insert(instrument, entry.clone());
                }
                true
            }
            Action::Unsubscribe => instruments
                .iter()
                .fold(false, |changed, i| entries.remove(i).is_some() || changed),
            _ => false,
        }
    }

    /// Drop every subscription. Returns how many were held.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Whether an instrument is subscribed.
    #[must_use]
    pub fn contains(&self, instrument: &str) -> bool {
        self.entries.read().contains_key(instrument)
    }

    /// Annotations of one instrument.
    #[must_use]
    pub fn entry(&self, instrument: &str) -> Option<SubscriptionEntry> {
        self.entries.read().get(instrument).cloned()
    }

    /// Subscribed instruments, sorted.
    #[must_use]
    pub fn instruments(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of subscribed instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_unsubscribe() {
        let set = SubscriptionSet::new();
        assert!(set.apply(&Command::subscribe(["PETR4", "VALE3"])));
        assert_eq!(set.instruments(), vec!["PETR4", "VALE3"]);

        assert!(set.apply(&Command::unsubscribe(["PETR4"])));
        assert!(!set.contains("PETR4"));
        assert!(set.contains("VALE3"));

        assert!(!set.apply(&Command::unsubscribe(["ITUB4"])));
    }

    #[test]
    fn annotations_are_kept() {
        let set = SubscriptionSet::new();
        set.apply(&Command::subscribe_book(["PETR4"], 3).unwrap());
        set.apply(&Command::candle_subscribe(["WINFUT"], "partial"));

        assert_eq!(set.entry("PETR4").unwrap().depth, Some(3));
        assert_eq!(
            set.entry("WINFUT").unwrap().candle_type.as_deref(),
            Some("partial")
        );
    }

    #[test]
    fn queries_do_not_change_the_set() {
        let set = SubscriptionSet::new();
        assert!(!set.apply(&Command::subscribed_to()));
        assert!(!set.apply(&Command::get_last_event("PETR4")));
        assert!(set.is_empty());
    }

    #[test]
    fn clear_reports_dropped_count() {
        let set = SubscriptionSet::new();
        set.apply(&Command::subscribe(["PETR4", "VALE3", "BBAS3"]));
        assert_eq!(set.clear(), 3);
        assert_eq!(set.len(), 0);
    }
}
