//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Token provider backed by the authentication endpoint.
pub mod auth;

/// Configuration loading.
pub mod config;

/// Worker process isolation and its stdio protocol.
pub mod isolation;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket connection supervisor.
pub mod websocket;
