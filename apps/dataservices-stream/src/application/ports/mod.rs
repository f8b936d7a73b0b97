//! Port Interfaces
//!
//! Defines the interfaces (ports) between the stream client and the code
//! around it, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TokenSource`: Supplies the bearer token presented on connect
//!
//! ## Driver Ports (Inbound)
//!
//! - `StreamHandler`: The four hook points (open, message, error, close)

mod handler;
mod token;

pub use handler::{CloseInfo, Hooks, LoggingHandler, StreamError, StreamHandler};
pub use token::{AuthError, TokenSource};

#[cfg(test)]
pub use token::MockTokenSource;
