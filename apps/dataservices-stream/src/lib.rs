#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Data Services Stream - Reconnecting Market Data Client
//!
//! A WebSocket client for BTG Solutions Data Services market data feeds.
//! One connection supervisor keeps the socket alive across disconnects,
//! multiplexes control commands over it and hands decoded frames to a
//! user handler, optionally from inside an isolated worker process.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types with no I/O
//!   - `routing`: (exchange, data type, subtype, stream type) → endpoint
//!   - `command`: Client-to-server control messages
//!   - `frame`: Decoded server-to-client events
//!   - `session`: Connection state machine and retry counter
//!   - `subscription`: Instruments requested on the current connection
//!
//! - **Application**: Ports and services
//!   - `ports`: Token source and the four-hook stream handler
//!   - `services`: Command channel, inbound dispatcher, latency sampler
//!
//! - **Infrastructure**: Adapters
//!   - `auth`: Token provider backed by the authentication endpoint
//!   - `websocket`: Connection supervisor and TLS setup
//!   - `isolation`: Worker process and its stdio protocol
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                     ┌──────────────┐   commands   ┌──────────────┐
//!  subscribe(...) ───►│CommandChannel│─────────────►│ writer task  │──┐
//!                     └──────────────┘              └──────────────┘  │
//!                                                                     ▼
//!  handler ◄── Dispatcher ◄── read loop ◄──────────────────────── WebSocket
//!   (inline | queued | concurrent)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core stream types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::command::{Action, Command, CommandError};
pub use domain::frame::{BookLevel, EventKind, Frame, FrameError, TopOfBook};
pub use domain::routing::{
    Country, DataType, EndpointResolver, Exchange, MarketDataRoute, RouteField, RoutingError,
    StreamType, Subtype,
};
pub use domain::session::{ConnectionState, RetryCounter};
pub use domain::subscription::{SubscriptionEntry, SubscriptionSet};

// Ports and services
pub use application::ports::{
    AuthError, CloseInfo, Hooks, LoggingHandler, StreamError, StreamHandler, TokenSource,
};
pub use application::services::{
    CommandChannel, DeliveryMode, Dispatcher, LatencyConfig, LatencyReport, LatencySampler,
    command_channel,
};

// Infrastructure
pub use infrastructure::auth::{StaticToken, TokenProvider};
pub use infrastructure::config::{ConfigError, Credentials, StreamConfig};
pub use infrastructure::isolation::{FeedConfig, FeedError, MarketDataFeed};
pub use infrastructure::websocket::{Supervisor, SupervisorConfig, SupervisorError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    LogTarget, TelemetryConfig, TelemetryGuard, init as init_telemetry,
};
