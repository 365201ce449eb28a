//! Prometheus metrics for the ingestion pipeline.
//!
//! This module provides metric collection for:
//! - Message intake and settlement
//! - Event processing latency
//! - Dead letters
//! - Stats snapshots
//!
//! # Example
//!
//! ```rust,no_run
//! use shopflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use shopflow_core::event::EventKind;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this
    /// logs a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if let Err(e) = exporter.await {
                        tracing::error!(error = ?e, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "shopflow_messages_received_total",
        "Total number of messages pulled from the queue"
    );
    describe_counter!(
        "shopflow_messages_acked_total",
        "Total number of messages acknowledged after successful processing"
    );
    describe_counter!(
        "shopflow_messages_discarded_total",
        "Total number of messages rejected without requeue"
    );
    describe_counter!(
        "shopflow_settle_failures_total",
        "Total number of acknowledgments or rejections the broker did not accept"
    );
    describe_counter!(
        "shopflow_events_processed_total",
        "Total number of events processed, by kind"
    );
    describe_counter!(
        "shopflow_dead_letters_total",
        "Total number of messages recorded in the dead-letter queue"
    );
    describe_histogram!(
        "shopflow_event_processing_duration_seconds",
        "Time taken to process one event across every sink"
    );
    describe_gauge!("shopflow_raw_events", "Rows in the raw event log at the last snapshot");
    describe_gauge!("shopflow_sales", "Rows in the sales ledger at the last snapshot");
    describe_gauge!("shopflow_revenue", "Ledger revenue at the last snapshot");
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a message pulled from the queue.
    pub fn record_received() {
        counter!("shopflow_messages_received_total").increment(1);
    }

    /// Record an acknowledged message.
    pub fn record_acked(kind: EventKind, duration: Duration) {
        counter!("shopflow_messages_acked_total").increment(1);
        counter!("shopflow_events_processed_total", "kind" => kind.as_str()).increment(1);
        histogram!("shopflow_event_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a discarded message.
    pub fn record_discarded(reason: &'static str) {
        counter!("shopflow_messages_discarded_total", "reason" => reason).increment(1);
    }

    /// Record a settlement the broker refused.
    pub fn record_settle_failure() {
        counter!("shopflow_settle_failures_total").increment(1);
    }
}

/// Snapshot metrics recorder.
pub struct SnapshotMetrics;

impl SnapshotMetrics {
    /// Publish the latest aggregate counts.
    #[allow(clippy::cast_precision_loss)] // gauge values
    pub fn record(snapshot: &shopflow_core::store::StatsSnapshot) {
        gauge!("shopflow_raw_events").set(snapshot.total_events as f64);
        gauge!("shopflow_sales").set(snapshot.total_sales as f64);
        gauge!("shopflow_revenue").set(snapshot.total_revenue);
    }
}
