//! Connection Session
//!
//! State machine of one logical streaming client and its bounded retry
//! counter. Reconnection is immediate: a fixed number of attempts, no
//! backoff and no jitter.
//!
//! ```text
//! Idle ──► Connecting ──► Open ──► Closing ──► Closed
//!              │  ▲          │
//!              ▼  │          │
//!          Reconnecting ◄────┘
//! ```

use std::fmt;

/// Reconnect attempts allowed between two successful opens.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Constructed, never started.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, frames flowing.
    Open,
    /// Transport lost, about to retry.
    Reconnecting,
    /// Explicit close in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether frames are flowing.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether a close has started or finished.
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Idle => matches!(next, Self::Connecting | Self::Closed),
            Self::Connecting => matches!(
                next,
                Self::Open | Self::Reconnecting | Self::Closing | Self::Closed
            ),
            Self::Open => matches!(next, Self::Reconnecting | Self::Closing | Self::Closed),
            Self::Reconnecting => matches!(next, Self::Connecting | Self::Closing | Self::Closed),
            Self::Closing => matches!(next, Self::Closed),
            Self::Closed => false,
        }
    }

    /// Numeric encoding for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Open => 2.0,
            Self::Reconnecting => 3.0,
            Self::Closing => 4.0,
            Self::Closed => 5.0,
        }
    }

    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Retry Counter
// =============================================================================

/// Bounded reconnect counter.
///
/// # Example
///
/// ```rust
/// use dataservices_stream::domain::session::RetryCounter;
///
/// let mut retries = RetryCounter::new(2);
/// assert_eq!(retries.next_attempt(), Some(1));
/// assert_eq!(retries.next_attempt(), Some(2));
/// assert_eq!(retries.next_attempt(), None);
///
/// // Successful open
/// retries.reset();
/// assert_eq!(retries.attempts(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCounter {
    max_attempts: u32,
    attempts: u32,
}

impl Default for RetryCounter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl RetryCounter {
    /// Create a counter allowing `max_attempts` reconnects. `0` disables them.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    /// Claim the next attempt, or `None` once the cap is reached.
    #[must_use]
    pub const fn next_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Whether another attempt is available.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Reset after a successful open.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured cap.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
