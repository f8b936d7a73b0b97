//! Application Services
//!
//! - `commands`: Outbound FIFO of control messages
//! - `dispatcher`: Decoding and delivery of inbound frames
//! - `latency`: Rolling latency and throughput sampling

mod commands;
mod dispatcher;
mod latency;

pub use commands::{CommandChannel, CommandQueue, command_channel};
pub use dispatcher::{DeliveryMode, Dispatcher};
pub use latency::{
    DEFAULT_LATENCY_INTERVAL, DEFAULT_TIMESTAMP_FIELD, LatencyConfig, LatencyReport,
    LatencySampler,
};
