//! Data Services Stream Binary
//!
//! Demo client: connects to the configured market data endpoint,
//! subscribes to the configured tickers on every open and logs each frame.
//!
//! # Usage
//!
//! ```bash
//! DATASERVICES_API_KEY=... DATASERVICES_TICKERS=PETR4,VALE3 cargo run --bin dataservices-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATASERVICES_API_KEY` or `DATASERVICES_TOKEN`
//!
//! ## Optional
//! - `DATASERVICES_EXCHANGE`: b3 | bmv | nasdaq (default: b3)
//! - `DATASERVICES_DATA_TYPE`: Feed data type (default: trades)
//! - `DATASERVICES_DATA_SUBTYPE`: stocks | options | derivatives | all
//! - `DATASERVICES_STREAM_TYPE`: realtime | delayed | throttle (default: realtime)
//! - `DATASERVICES_TICKERS`: Comma-separated instruments
//! - `DATASERVICES_BOOK_DEPTH`: Book depth 1-10 for book feeds
//! - `DATASERVICES_DELIVERY_MODE`: inline | queued | concurrent (default: inline)
//! - `DATASERVICES_PROCESS_ISOLATION`: Run the connection in a worker process
//! - `DATASERVICES_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use dataservices_stream::infrastructure::config::load_dotenv;
use dataservices_stream::infrastructure::telemetry::{self, LogTarget};
use dataservices_stream::{
    FeedConfig, Hooks, MarketDataFeed, StreamConfig, StreamHandler, Supervisor, init_metrics,
};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let dotenv = load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init(LogTarget::Stdout);

    tracing::info!(dotenv = ?dotenv, "Starting Data Services stream client");

    let config = StreamConfig::from_env()?;
    log_config(&config);

    if config.metrics_port != 0 {
        init_metrics(config.metrics_port)?;
    }

    let handler: Arc<dyn StreamHandler> = Arc::new(demo_handler(&config));
    if config.process_isolation {
        run_isolated(&config, handler).await
    } else {
        run_in_process(&config, handler).await
    }
}

/// Subscribe to the configured tickers on every open; log everything else.
fn demo_handler(config: &StreamConfig) -> Hooks {
    let subscription = config.initial_subscription();
    Hooks::new().on_open(move |commands| {
        tracing::info!("### Open Connection ###");
        if let Some(command) = &subscription
            && let Err(e) = commands.send(command.clone())
        {
            tracing::warn!(error = %e, "Failed to queue subscription");
        }
    })
}

async fn run_in_process(config: &StreamConfig, handler: Arc<dyn StreamHandler>) -> anyhow::Result<()> {
    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_config(),
        config.token_source()?,
        handler,
    ));

    let runner = Arc::clone(&supervisor);
    let mut task = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut task => {
            result??;
            return Ok(());
        }
        () = await_shutdown() => {}
    }

    supervisor.close().await;
    task.await??;
    tracing::info!("Stream client stopped");
    Ok(())
}

async fn run_isolated(config: &StreamConfig, handler: Arc<dyn StreamHandler>) -> anyhow::Result<()> {
    let feed = MarketDataFeed::new(FeedConfig::from_stream_config(config)?, handler);
    feed.run().await?;

    tokio::select! {
        () = feed.wait() => tracing::info!("Feed finished"),
        () = await_shutdown() => {}
    }

    feed.close().await;
    tracing::info!("Stream client stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        exchange = config.route.exchange.as_str(),
        data_type = config.route.data_type.as_str(),
        subtype = config.route.effective_subtype().as_str(),
        stream_type = config.route.stream_type.as_str(),
        delivery = config.delivery.as_str(),
        process_isolation = config.process_isolation,
        tickers = config.tickers.len(),
        "Configuration loaded"
    );
    tracing::debug!(url = %config.url, ssl = config.ssl, "Stream endpoint");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
