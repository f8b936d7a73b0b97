//! Latency Sampler
//!
//! Compares event timestamps carried in frames against the local clock and
//! reports average latency and throughput once per window.
//!
//! # Timestamp Forms
//!
//! | Form | Example |
//! |------|---------|
//! | Epoch seconds | `1718000000` |
//! | Epoch milliseconds | `1718000000123` |
//! | Epoch microseconds | `1718000000123456` |
//! | Epoch nanoseconds | `1718000000123456789` |
//! | RFC 3339 | `"2024-06-10T06:13:20.123Z"` |
//!
//! Numeric units are told apart by magnitude. Book events carry the field
//! under each `bid`/`offer` level; the newest one is used.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::frame::{EventKind, Frame};
use crate::infrastructure::metrics;

/// Default reporting window.
pub const DEFAULT_LATENCY_INTERVAL: Duration = Duration::from_secs(5);

/// Default timestamp field.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "tms";

/// Sampler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyConfig {
    /// Reporting window.
    pub interval: Duration,
    /// Field holding the event timestamp.
    pub timestamp_field: String,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_LATENCY_INTERVAL,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
        }
    }
}

/// Summary of one reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    /// Frames observed.
    pub frames: u64,
    /// Frames with a usable timestamp.
    pub samples: u64,
    /// Mean of `now - event time`, if any frame had a timestamp.
    pub average_latency: Option<Duration>,
    /// Frames per second over the window.
    pub throughput_per_sec: f64,
    /// Window length.
    pub window: Duration,
}

/// Rolling latency and throughput accumulator.
#[derive(Debug)]
pub struct LatencySampler {
    config: LatencyConfig,
    frames: u64,
    samples: u64,
    total_latency: Duration,
    window_start: Instant,
    last: Option<LatencyReport>,
}

impl LatencySampler {
    /// Create a sampler whose first window starts now.
    #[must_use]
    pub fn new(config: LatencyConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Create a sampler whose first window starts at `start`.
    #[must_use]
    pub const fn starting_at(config: LatencyConfig, start: Instant) -> Self {
        Self {
            config,
            frames: 0,
            samples: 0,
            total_latency: Duration::ZERO,
            window_start: start,
            last: None,
        }
    }

    /// Account for one frame against the current clock.
    pub fn observe(&mut self, frame: &Frame) -> Option<LatencyReport> {
        self.observe_at(frame, Utc::now(), Instant::now())
    }

    /// Account for one frame at the given wall and monotonic times.
    ///
    /// Returns the report when this frame closes a window.
    pub fn observe_at(
        &mut self,
        frame: &Frame,
        now: DateTime<Utc>,
        instant: Instant,
    ) -> Option<LatencyReport> {
        self.frames += 1;
        if let Some(latency) = self
            .event_timestamp(frame)
            .and_then(|ts| (now - ts).to_std().ok())
        {
            self.samples += 1;
            self.total_latency += latency;
        }

        let window = instant.saturating_duration_since(self.window_start);
        if window < self.config.interval {
            return None;
        }

        let report = self.close_window(window);
        self.window_start = instant;
        tracing::info!(
            frames = report.frames,
            samples = report.samples,
            average_latency_ms = report.average_latency.map(|d| d.as_secs_f64() * 1000.0),
            throughput_per_sec = report.throughput_per_sec,
            "Latency report"
        );
        metrics::record_latency_report(&report);
        self.last = Some(report.clone());
        Some(report)
    }

    fn close_window(&mut self, window: Duration) -> LatencyReport {
        let average_latency = (self.samples > 0).then(|| {
            let nanos = self.total_latency.as_nanos() / u128::from(self.samples);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        });
        #[allow(clippy::cast_precision_loss)]
        let throughput_per_sec = self.frames as f64 / window.as_secs_f64();
        let report = LatencyReport {
            frames: self.frames,
            samples: self.samples,
            average_latency,
            throughput_per_sec,
            window,
        };
        self.frames = 0;
        self.samples = 0;
        self.total_latency = Duration::ZERO;
        report
    }

    /// Event time carried by a frame, if any.
    #[must_use]
    pub fn event_timestamp(&self, frame: &Frame) -> Option<DateTime<Utc>> {
        let field = self.config.timestamp_field.as_str();
        let value = frame.value();
        if frame.kind() == EventKind::Book {
            let newest = ["bid", "offer"]
                .iter()
                .filter_map(|side| value.get(*side).and_then(Value::as_array))
                .flatten()
                .filter_map(|level| level.get(field).and_then(parse_timestamp))
                .max();
            if newest.is_some() {
                return newest;
            }
        }
        value.get(field).and_then(parse_timestamp)
    }

    /// Most recent report.
    #[must_use]
    pub const fn last_report(&self) -> Option<&LatencyReport> {
        self.last.as_ref()
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(int) => from_epoch_int(int),
            None => from_epoch_float(n.as_f64()?),
        },
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_epoch_str(s)),
        _ => None,
    }
}

fn parse_epoch_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    match text.parse::<i64>() {
        Ok(int) => from_epoch_int(int),
        Err(_) => from_epoch_float(text.parse().ok()?),
    }
}

fn from_epoch_int(value: i64) -> Option<DateTime<Utc>> {
    let nanos = match value {
        ..=0 => return None,
        1..100_000_000_000 => value.checked_mul(1_000_000_000)?,
        100_000_000_000..100_000_000_000_000 => value.checked_mul(1_000_000)?,
        100_000_000_000_000..100_000_000_000_000_000 => value.checked_mul(1_000)?,
        _ => value,
    };
    Some(DateTime::from_timestamp_nanos(nanos))
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch_float(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let nanos = if value < 1e11 {
        value * 1e9
    } else if value < 1e14 {
        value * 1e6
    } else if value < 1e17 {
        value * 1e3
    } else {
        value
    };
    if nanos >= 9.2e18 {
        return None;
    }
    Some(DateTime::from_timestamp_nanos(nanos.round() as i64))
}
