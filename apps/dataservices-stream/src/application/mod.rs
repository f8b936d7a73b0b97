//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for token sources and stream handlers.
pub mod ports;

/// Command channel, inbound dispatch and latency sampling.
pub mod services;
