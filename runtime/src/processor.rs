//! Per-event orchestration across the aggregate sinks.
//!
//! For one validated event, in fixed order:
//!
//! 1. append to the raw log
//! 2. fold into the minute bucket
//! 3. dispatch by kind: product view → product stats; purchase → revenue once,
//!    ledger insert, then product stats; add to cart → cart stats; page view → nothing
//!
//! The first failing step aborts the rest and is reported with its name.
//! Completed steps are not rolled back: a purchase whose product-stat update
//! fails still has its raw row, minute bucket and ledger row.

use shopflow_core::environment::Clock;
use shopflow_core::event::{self, EventDetails, EventError, EventKind, ReceivedEvent};
use shopflow_core::store::{AnalyticsSinks, StoreError};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// A processing step, named for logs and dead letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStep {
    /// Raw log append.
    RawLog,
    /// Minute-bucket update.
    Metrics,
    /// Product view count.
    ProductView,
    /// Sales ledger insert.
    SalesLedger,
    /// Product purchase totals.
    ProductPurchase,
    /// Cart activity.
    CartActivity,
}

impl ProcessStep {
    /// Stable name of the step.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RawLog => "raw_log",
            Self::Metrics => "metrics",
            Self::ProductView => "product_view",
            Self::SalesLedger => "sales_ledger",
            Self::ProductPurchase => "product_purchase",
            Self::CartActivity => "cart_activity",
        }
    }
}

impl fmt::Display for ProcessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an event could not be processed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// The message did not decode or validate. Nothing was written.
    #[error(transparent)]
    Malformed(#[from] EventError),

    /// A store operation failed. Earlier steps stay applied.
    #[error("{kind} event from {actor_id} failed at {step}: {source}")]
    Persistence {
        /// Failing step.
        step: ProcessStep,
        /// Kind of the event.
        kind: EventKind,
        /// Actor of the event.
        actor_id: String,
        /// Store error.
        source: StoreError,
    },
}

/// Applies events to every sink in fixed order.
#[derive(Clone)]
pub struct EventProcessor {
    sinks: AnalyticsSinks,
    clock: Arc<dyn Clock>,
}

impl EventProcessor {
    /// Create a processor writing to `sinks`, stamping with `clock`.
    #[must_use]
    pub fn new(sinks: AnalyticsSinks, clock: Arc<dyn Clock>) -> Self {
        Self { sinks, clock }
    }

    /// Decode, validate and process a message body.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Malformed`] without touching any sink if the
    /// body is invalid, or [`ProcessError::Persistence`] from [`process`](Self::process).
    pub async fn process_message(
        &self,
        message_id: &str,
        payload: &[u8],
    ) -> Result<ReceivedEvent, ProcessError> {
        let received = ReceivedEvent {
            message_id: message_id.to_string(),
            event: event::decode(payload)?,
        };
        self.process(&received).await?;
        Ok(received)
    }

    /// Process a validated event.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Persistence`] naming the first step that failed.
    pub async fn process(&self, received: &ReceivedEvent) -> Result<(), ProcessError> {
        let event = &received.event;
        let now = self.clock.now();

        self.step(received, ProcessStep::RawLog, self.sinks.raw_events.append(received, now))
            .await?;

        let revenue = event.revenue();
        self.step(
            received,
            ProcessStep::Metrics,
            self.sinks.metrics.record(event, revenue, now),
        )
        .await?;

        match &event.details {
            EventDetails::ProductView(product) => {
                self.step(
                    received,
                    ProcessStep::ProductView,
                    self.sinks.products.record_view(event, product),
                )
                .await?;
            },
            EventDetails::Purchase(line) => {
                self.step(
                    received,
                    ProcessStep::SalesLedger,
                    self.sinks.sales.record_sale(received, line, revenue),
                )
                .await?;
                self.step(
                    received,
                    ProcessStep::ProductPurchase,
                    self.sinks.products.record_purchase(event, line, revenue),
                )
                .await?;
            },
            EventDetails::AddToCart { quantity, .. } => {
                self.step(
                    received,
                    ProcessStep::CartActivity,
                    self.sinks.carts.record_add_to_cart(event, *quantity),
                )
                .await?;
            },
            EventDetails::PageView { .. } => {},
        }

        tracing::debug!(
            message_id = %received.message_id,
            kind = %event.kind(),
            actor_id = %event.actor_id,
            "Event processed"
        );

        Ok(())
    }

    async fn step(
        &self,
        received: &ReceivedEvent,
        step: ProcessStep,
        operation: impl Future<Output = Result<(), StoreError>>,
    ) -> Result<(), ProcessError> {
        operation.await.map_err(|source| ProcessError::Persistence {
            step,
            kind: received.event.kind(),
            actor_id: received.event.actor_id.clone(),
            source,
        })
    }
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor").finish_non_exhaustive()
    }
}
