//! Connection lifecycle of the pipeline.
//!
//! ```text
//! Disconnected --connect--> ConnectedIdle --run--> Consuming --shutdown--> Closing --> Closed
//!      |                          |                                                    ^
//!      +---------close------------+----------------------close-------------------------+
//! ```
//!
//! Closing releases the subscription, the queue connection and the store
//! connection in that order. Each release is attempted even if an earlier
//! one failed.

use crate::consumer::{ConsumerSummary, QueueConsumer};
use crate::processor::EventProcessor;
use shopflow_core::dead_letter::DeadLetterQueue;
use shopflow_core::environment::Clock;
use shopflow_core::queue::{MessageQueue, QueueError, Subscription};
use shopflow_core::store::{StatsSource, StoreConnection, StoreError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing open.
    Disconnected,
    /// Queue and store connected, not consuming.
    ConnectedIdle,
    /// Subscription open and consumer running.
    Consuming,
    /// Releasing resources.
    Closing,
    /// Everything released. Terminal.
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::ConnectedIdle => "connected_idle",
            Self::Consuming => "consuming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The queue or the store could not be reached, or the subscription
    /// could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State at the time.
        state: PipelineState,
    },

    /// One or more resources failed to release.
    #[error("Close failed: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl From<QueueError> for PipelineError {
    fn from(error: QueueError) -> Self {
        Self::Connection(error.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        Self::Connection(error.to_string())
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Queue (topic) to consume.
    pub queue_name: String,
    /// Outstanding-message limit.
    pub prefetch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_name: "user.events".to_string(),
            prefetch: 10,
        }
    }
}

/// Owns the queue and store connections and runs the consumer.
pub struct PipelineClient {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn StoreConnection>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    subscription: Option<Subscription>,
    state: PipelineState,
}

impl PipelineClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn StoreConnection>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            queue,
            store,
            clock,
            config,
            dead_letters: None,
            subscription: None,
            state: PipelineState::Disconnected,
        }
    }

    /// Use `dead_letters` instead of the store's own dead-letter queue.
    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// Consumer settings.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stats source of the connected store.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Connection`] if the store is not connected.
    pub fn stats_source(&self) -> Result<Arc<dyn StatsSource>, PipelineError> {
        Ok(self.store.sinks()?.stats)
    }

    /// Connect the queue, then the store, then make sure the schema exists.
    ///
    /// If the store cannot be reached or its schema cannot be applied, every
    /// connection opened so far is released again and the client stays
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidState`] unless `Disconnected`
    /// - [`PipelineError::Connection`] if either side cannot be reached
    pub async fn connect(&mut self) -> Result<(), PipelineError> {
        self.expect_state("connect", PipelineState::Disconnected)?;

        self.queue.connect().await?;

        if let Err(e) = self.store.connect().await {
            self.release_after_failed_connect(false).await;
            return Err(e.into());
        }
        if let Err(e) = self.store.ensure_schema().await {
            self.release_after_failed_connect(true).await;
            return Err(e.into());
        }

        self.state = PipelineState::ConnectedIdle;
        tracing::info!(queue = %self.config.queue_name, "Pipeline connected");
        Ok(())
    }

    /// Subscribe and consume until `shutdown` fires, then close.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidState`] unless `ConnectedIdle`
    /// - [`PipelineError::Connection`] if the subscription cannot be opened
    /// - [`PipelineError::Close`] if releasing resources fails afterwards
    pub async fn run(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerSummary, PipelineError> {
        self.expect_state("run", PipelineState::ConnectedIdle)?;

        let sinks = self.store.sinks()?;
        let dead_letters = match &self.dead_letters {
            Some(dead_letters) => Some(dead_letters.clone()),
            None => self.store.dead_letters()?,
        };

        let processor = EventProcessor::new(sinks, self.clock.clone());
        let mut consumer = QueueConsumer::new(processor, self.clock.clone(), self.config.prefetch);
        if let Some(dead_letters) = dead_letters {
            consumer = consumer.with_dead_letters(dead_letters);
        }

        let subscription = self
            .queue
            .subscribe(&self.config.queue_name, consumer.prefetch())
            .await?;
        let subscription = self.subscription.insert(subscription);
        self.state = PipelineState::Consuming;

        let summary = consumer.run(subscription, shutdown).await;

        self.state = PipelineState::Closing;
        self.close().await?;
        Ok(summary)
    }

    /// Release the subscription, the queue and the store, in that order.
    ///
    /// Every release is attempted. Closing a `Closed` client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Close`] listing every failed release. The
    /// client is `Closed` either way.
    pub async fn close(&mut self) -> Result<(), PipelineError> {
        if self.state == PipelineState::Closed {
            return Ok(());
        }
        self.state = PipelineState::Closing;

        let mut failures = Vec::new();

        if let Some(subscription) = self.subscription.take() {
            if let Err(e) = subscription.close().await {
                tracing::error!(error = %e, "Failed to close subscription");
                failures.push(format!("subscription: {e}"));
            }
        }

        if let Err(e) = self.queue.close().await {
            tracing::error!(error = %e, "Failed to close queue connection");
            failures.push(format!("queue: {e}"));
        }

        if let Err(e) = self.store.close().await {
            tracing::error!(error = %e, "Failed to close store connection");
            failures.push(format!("store: {e}"));
        }

        self.state = PipelineState::Closed;

        if failures.is_empty() {
            tracing::info!("Pipeline closed");
            Ok(())
        } else {
            Err(PipelineError::Close(failures))
        }
    }

    async fn release_after_failed_connect(&self, store_connected: bool) {
        if store_connected {
            if let Err(e) = self.store.close().await {
                tracing::warn!(error = %e, "Failed to release store after schema error");
            }
        }
        if let Err(e) = self.queue.close().await {
            tracing::warn!(error = %e, "Failed to release queue after store error");
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: PipelineState,
    ) -> Result<(), PipelineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl fmt::Debug for PipelineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineClient")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_operation_and_state() {
        let error = PipelineError::InvalidState {
            operation: "run",
            state: PipelineState::Disconnected,
        };
        assert_eq!(error.to_string(), "Cannot run while disconnected");
    }

    #[test]
    fn close_error_lists_every_failure() {
        let error = PipelineError::Close(vec!["queue: gone".to_string(), "store: gone".to_string()]);
        assert_eq!(error.to_string(), "Close failed: queue: gone; store: gone");
    }

    #[test]
    fn backend_errors_become_connection_errors() {
        let error: PipelineError = QueueError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(error, PipelineError::Connection(_)));

        let error: PipelineError = StoreError::Connection("refused".to_string()).into();
        assert!(matches!(error, PipelineError::Connection(_)));
    }
}
