//! # Shopflow Runtime
//!
//! Drives events from the message queue into the aggregate views.
//!
//! ## Core Components
//!
//! - **[`EventProcessor`]**: applies one validated event to every sink in fixed order
//! - **[`QueueConsumer`]**: pull loop bounded by the prefetch limit, acks or discards
//! - **[`PipelineClient`]**: connect, run and close the queue and store connections
//! - **[`StatsReporter`]**: periodic aggregate snapshot
//! - **[`metrics`]**: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use shopflow_runtime::{PipelineClient, PipelineConfig};
//! use shopflow_core::environment::SystemClock;
//!
//! let mut client = PipelineClient::new(queue, store, Arc::new(SystemClock), PipelineConfig::default());
//! client.connect().await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let summary = client.run(shutdown_rx).await?;
//! ```

pub mod consumer;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod stats;

pub use consumer::{ConsumerSummary, QueueConsumer, RECEIVE_ERROR_BACKOFF};
pub use lifecycle::{PipelineClient, PipelineConfig, PipelineError, PipelineState};
pub use processor::{EventProcessor, ProcessError, ProcessStep};
pub use stats::StatsReporter;
