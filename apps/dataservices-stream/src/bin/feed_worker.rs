//! Data Services Feed Worker
//!
//! Child process spawned by `MarketDataFeed`. Holds the WebSocket
//! connection, writes envelopes to stdout and reads commands from stdin.
//! Logs go to stderr. Configured through the environment by the parent.

use dataservices_stream::infrastructure::isolation::{WorkerSettings, run_worker};
use dataservices_stream::infrastructure::telemetry::{self, LogTarget, TelemetryConfig};

/// Service name for worker traces.
const WORKER_SERVICE_NAME: &str = "dataservices-feed-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let mut telemetry_config = TelemetryConfig::from_env(LogTarget::Stderr);
    if std::env::var("OTEL_SERVICE_NAME").is_err() {
        telemetry_config.service_name = WORKER_SERVICE_NAME.to_string();
    }
    let _telemetry_guard = telemetry::init_with_config(telemetry_config);

    let settings = WorkerSettings::from_env()?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_worker(settings, stdin, std::io::stdout()).await?;
    Ok(())
}
