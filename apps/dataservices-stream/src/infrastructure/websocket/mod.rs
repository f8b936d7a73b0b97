//! WebSocket Connection Layer
//!
//! The [`Supervisor`] owns one logical connection: it authenticates,
//! connects, forwards commands, dispatches frames and reconnects after
//! abnormal closes.

mod supervisor;
mod tls;
mod writer;

pub use supervisor::{
    ConnectionError, Supervisor, SupervisorConfig, SupervisorError, USER_AGENT_VALUE,
};
pub use tls::{connector_for, insecure_client_config};
pub use writer::{CLIENT_CLOSE_REASON, WriterExit, write_commands};
