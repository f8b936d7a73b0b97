//! Worker Stdio Protocol
//!
//! The worker writes one JSON envelope per line to stdout and reads one
//! command per line from stdin.
//!
//! ```text
//! {"kind":"open"}
//! {"kind":"frame","value":{"ev":"trade","tk":"PETR4"}}
//! {"kind":"error","message":"connection error: ..."}
//! {"kind":"close","code":1006,"reason":"...","reconnecting":true,"attempt":1}
//! ```

use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::ports::{CloseInfo, StreamError, StreamHandler};
use crate::application::services::CommandChannel;
use crate::domain::frame::Frame;

/// Event forwarded from the worker to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEnvelope {
    /// Connection opened.
    Open,
    /// Decoded frame.
    Frame {
        /// Frame payload.
        value: Value,
    },
    /// Error reported by the worker's supervisor.
    Error {
        /// Rendered error.
        message: String,
    },
    /// Connection closed.
    Close {
        /// Close code, if any.
        #[serde(default)]
        code: Option<u16>,
        /// Close reason.
        reason: String,
        /// Whether the worker will reconnect.
        reconnecting: bool,
        /// Reconnect attempt about to be made.
        #[serde(default)]
        attempt: Option<u32>,
    },
}

impl WorkerEnvelope {
    /// Encode as one line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame value cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not an envelope.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Envelope for a close event.
    #[must_use]
    pub fn from_close(close: &CloseInfo) -> Self {
        Self::Close {
            code: close.code,
            reason: close.reason.clone(),
            reconnecting: close.reconnecting,
            attempt: close.attempt,
        }
    }

    /// Close details, for close envelopes.
    #[must_use]
    pub fn close_info(&self) -> Option<CloseInfo> {
        match self {
            Self::Close {
                code,
                reason,
                reconnecting,
                attempt,
            } => Some(CloseInfo {
                code: *code,
                reason: reason.clone(),
                reconnecting: *reconnecting,
                attempt: *attempt,
            }),
            _ => None,
        }
    }

    /// Whether this is a close after which the worker exits.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Close {
                reconnecting: false,
                ..
            }
        )
    }
}

// =============================================================================
// Envelope Handler
// =============================================================================

/// Handler that writes every event as an envelope line.
///
/// Runs inside the worker, where `out` is stdout.
pub struct EnvelopeHandler<W> {
    out: Mutex<W>,
}

impl<W: Write> EnvelopeHandler<W> {
    /// Write envelopes to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    /// Write one envelope line and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn emit(&self, envelope: &WorkerEnvelope) -> std::io::Result<()> {
        let line = envelope.encode()?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()
    }

    fn emit_or_log(&self, envelope: &WorkerEnvelope) {
        if let Err(e) = self.emit(envelope) {
            tracing::error!(error = %e, "Failed to write envelope");
        }
    }
}

impl<W: Write + Send + 'static> StreamHandler for EnvelopeHandler<W> {
    fn on_open(&self, _commands: &CommandChannel) {
        self.emit_or_log(&WorkerEnvelope::Open);
    }

    fn on_message(&self, frame: Frame) -> anyhow::Result<()> {
        self.emit(&WorkerEnvelope::Frame {
            value: frame.into_value(),
        })?;
        Ok(())
    }

    fn on_error(&self, error: &StreamError) {
        tracing::warn!(error = %error, "Forwarding error to parent");
        self.emit_or_log(&WorkerEnvelope::Error {
            message: error.to_string(),
        });
    }

    fn on_close(&self, close: &CloseInfo) {
        self.emit_or_log(&WorkerEnvelope::from_close(close));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::application::services::command_channel;

    #[test_case(r#"{"kind":"open"}"#, WorkerEnvelope::Open ; "open")]
    #[test_case(
        r#"{"kind":"error","message":"boom"}"#,
        WorkerEnvelope::Error { message: "boom".to_string() } ;
        "error"
    )]
    #[test_case(
        r#"{"kind":"close","reason":"gone","reconnecting":false}"#,
        WorkerEnvelope::Close { code: None, reason: "gone".to_string(), reconnecting: false, attempt: None } ;
        "close without optional fields"
    )]
    fn decodes_envelopes(line: &str, expected: WorkerEnvelope) {
        assert_eq!(WorkerEnvelope::decode(line).unwrap(), expected);
    }

    #[test]
    fn frame_envelope_wire_shape() {
        let envelope = WorkerEnvelope::Frame {
            value: json!({"ev": "trade", "tk": "PETR4"}),
        };
        assert_eq!(
            envelope.encode().unwrap(),
            r#"{"kind":"frame","value":{"ev":"trade","tk":"PETR4"}}"#
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(WorkerEnvelope::decode(r#"{"kind":"ping"}"#).is_err());
        assert!(WorkerEnvelope::decode("not json").is_err());
    }

    #[test]
    fn close_info_survives_the_pipe() {
        let close = CloseInfo {
            code: Some(1006),
            reason: "abnormal".to_string(),
            reconnecting: true,
            attempt: Some(2),
        };
        let line = WorkerEnvelope::from_close(&close).encode().unwrap();
        let decoded = WorkerEnvelope::decode(&line).unwrap();
        assert!(!decoded.is_terminal());
        assert_eq!(decoded.close_info(), Some(close));
        assert_eq!(WorkerEnvelope::Open.close_info(), None);
    }

    #[test]
    fn handler_writes_one_line_per_event() {
        let handler = EnvelopeHandler::new(Vec::new());
        let (commands, _queue) = command_channel();

        handler.on_open(&commands);
        handler
            .on_message(Frame::decode(r#"{"ev":"book","tk":"VALE3"}"#).unwrap())
            .unwrap();
        handler.on_error(&StreamError::Connection("reset".to_string()));
        handler.on_close(&CloseInfo::terminal(None, "maximum reconnect attempts reached"));

        let output = String::from_utf8(handler.into_inner()).unwrap();
        let lines: Vec<WorkerEnvelope> = output
            .lines()
            .map(|line| WorkerEnvelope::decode(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], WorkerEnvelope::Open);
        assert!(matches!(&lines[1], WorkerEnvelope::Frame { value } if value["tk"] == "VALE3"));
        assert!(matches!(&lines[2], WorkerEnvelope::Error { message } if message.contains("reset")));
        assert!(lines[3].is_terminal());
    }
}
