//! Domain Layer - Core stream types with no I/O.
//!
//! This layer holds the routing table, the control and data message
//! shapes, and the connection state machine. Nothing here touches the
//! network.

/// Endpoint lookup for market data and news feeds.
pub mod routing;

/// Client-to-server control messages.
pub mod command;

/// Decoded server-to-client events.
pub mod frame;

/// Connection state machine and retry counter.
pub mod session;

/// Instruments requested on the current connection.
pub mod subscription;
