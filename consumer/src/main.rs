//! Shopflow consumer service
//!
//! Reads user interaction events from Redpanda and folds them into the
//! `PostgreSQL` aggregate views.
//!
//! This binary:
//! - Loads configuration from the environment (and `.env`)
//! - Optionally exposes Prometheus metrics
//! - Connects to Redpanda and `PostgreSQL`, applying migrations
//! - Consumes until SIGINT or SIGTERM, then drains in-flight work and exits
//! - Logs an aggregate snapshot periodically
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/shopflow REDPANDA_BROKERS=localhost:9092 \
//!     cargo run -p shopflow-consumer
//! ```

mod config;

use anyhow::Context;
use config::Config;
use shopflow_core::environment::SystemClock;
use shopflow_postgres::PostgresConnection;
use shopflow_projections::PostgresAnalytics;
use shopflow_redpanda::RedpandaQueue;
use shopflow_runtime::metrics::MetricsServer;
use shopflow_runtime::{PipelineClient, PipelineConfig, StatsReporter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopflow=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        consumer_group = %config.redpanda.consumer_group,
        prefetch = config.consumer.prefetch,
        "Configuration loaded"
    );

    let mut metrics_server = None;
    if let Some(port) = config.metrics_port {
        let mut server = MetricsServer::new(SocketAddr::from(([0, 0, 0, 0], port)));
        server.start().context("Failed to start metrics server")?;
        metrics_server = Some(server);
    }

    let queue = RedpandaQueue::builder()
        .brokers(&config.redpanda.brokers)
        .consumer_group(&config.redpanda.consumer_group)
        .auto_offset_reset(&config.redpanda.auto_offset_reset)
        .build()
        .context("Invalid Redpanda configuration")?;
    let analytics = PostgresAnalytics::from_connection(
        PostgresConnection::new(&config.postgres.url).max_connections(config.postgres.max_connections),
    );

    let mut client = PipelineClient::new(
        Arc::new(queue),
        Arc::new(analytics),
        Arc::new(SystemClock),
        PipelineConfig {
            queue_name: config.redpanda.topic.clone(),
            prefetch: config.consumer.prefetch,
        },
    );
    client.connect().await.context("Failed to connect")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reporter = StatsReporter::new(client.stats_source()?, config.consumer.stats_interval());
    let reporter = tokio::spawn(reporter.run(shutdown_rx.clone()));

    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Shopflow consumer is running. Press Ctrl+C to shut down");
    let result = client.run(shutdown_rx).await;
    if result.is_err() {
        if let Err(e) = client.close().await {
            tracing::warn!(error = %e, "Failed to release connections");
        }
    }

    // Dropping the sender stops the reporter when the run ended on its own.
    signals.abort();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "Stats reporter task failed");
    }
    drop(metrics_server);

    let summary = result.context("Consumer stopped with errors")?;
    tracing::info!(
        received = summary.received,
        acknowledged = summary.acknowledged,
        discarded = summary.discarded,
        "Shopflow consumer stopped"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    }
}
