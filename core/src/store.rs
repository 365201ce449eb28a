//! Storage seams of the pipeline.
//!
//! Each aggregate view is its own trait so the event processor can be wired
//! against any backend (Postgres in production, in-memory in tests) and so
//! that a failure can be attributed to the exact step that raised it.
//!
//! # Concurrency contract
//!
//! Implementations are called concurrently for different deliveries, with no
//! ordering guarantee and no application-level locking. Every aggregate
//! mutation must therefore be a single atomic, commutative operation at the
//! storage layer (increment, set-add, last-write-wins overwrite). Appends to
//! the raw log and the sales ledger need no such care.
//!
//! # Dyn Compatibility
//!
//! Methods return [`StoreFuture`] rather than `async fn` so the traits can be
//! used as `Arc<dyn RawEventStore>` and friends.

use crate::dead_letter::DeadLetterQueue;
use crate::event::{ProductInfo, PurchaseLine, ReceivedEvent, UserEvent};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A read or write against the store failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The store is unreachable or the session is not established.
    #[error("Store connection error: {0}")]
    Connection(String),
}

/// Boxed future returned by storage traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Append-only log of every valid event.
pub trait RawEventStore: Send + Sync {
    /// Append an event with its processing timestamp.
    ///
    /// Duplicate deliveries produce duplicate rows.
    fn append<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;
}

/// Per-minute rolling metrics.
pub trait MetricsAggregator: Send + Sync {
    /// Fold an event into the bucket of its own minute.
    ///
    /// Increments the total and per-kind counters, adds the actor to the
    /// distinct-actor set and adds `revenue` (zero for non-purchases).
    fn record<'a>(
        &'a self,
        event: &'a UserEvent,
        revenue: f64,
        updated_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;
}

/// Per-product, per-day statistics.
pub trait ProductStatsAggregator: Send + Sync {
    /// Count a product view and refresh the denormalized descriptors.
    fn record_view<'a>(
        &'a self,
        event: &'a UserEvent,
        product: &'a ProductInfo,
    ) -> StoreFuture<'a, ()>;

    /// Add a purchase's quantity and revenue.
    fn record_purchase<'a>(
        &'a self,
        event: &'a UserEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()>;
}

/// Per-actor, per-day cart activity.
pub trait CartAggregator: Send + Sync {
    /// Add `quantity` items to the actor's daily total.
    fn record_add_to_cart<'a>(&'a self, event: &'a UserEvent, quantity: i64) -> StoreFuture<'a, ()>;
}

/// Immutable sales ledger.
pub trait SalesLedger: Send + Sync {
    /// Insert one record for a purchase.
    fn record_sale<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()>;
}

/// Aggregate counts for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Rows in the raw event log.
    pub total_events: i64,
    /// Rows in the sales ledger.
    pub total_sales: i64,
    /// Sum of ledger totals.
    pub total_revenue: f64,
}

/// Read-only source of [`StatsSnapshot`]s.
pub trait StatsSource: Send + Sync {
    /// Take a snapshot.
    fn snapshot(&self) -> StoreFuture<'_, StatsSnapshot>;
}

/// Every sink the event processor writes to, plus the stats source.
#[derive(Clone)]
pub struct AnalyticsSinks {
    /// Raw event log.
    pub raw_events: Arc<dyn RawEventStore>,
    /// Per-minute metrics.
    pub metrics: Arc<dyn MetricsAggregator>,
    /// Product daily stats.
    pub products: Arc<dyn ProductStatsAggregator>,
    /// Cart daily stats.
    pub carts: Arc<dyn CartAggregator>,
    /// Sales ledger.
    pub sales: Arc<dyn SalesLedger>,
    /// Snapshot source.
    pub stats: Arc<dyn StatsSource>,
}

impl AnalyticsSinks {
    /// Use one backend for every sink.
    #[must_use]
    pub fn from_backend<B>(backend: &Arc<B>) -> Self
    where
        B: RawEventStore
            + MetricsAggregator
            + ProductStatsAggregator
            + CartAggregator
            + SalesLedger
            + StatsSource
            + 'static,
    {
        Self {
            raw_events: backend.clone(),
            metrics: backend.clone(),
            products: backend.clone(),
            carts: backend.clone(),
            sales: backend.clone(),
            stats: backend.clone(),
        }
    }
}

/// Lifecycle of a store session.
pub trait StoreConnection: Send + Sync {
    /// Establish the session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the store is unreachable.
    fn connect(&self) -> StoreFuture<'_, ()>;

    /// Apply schema migrations and provision indexes.
    ///
    /// Index provisioning failures are logged, not returned.
    fn ensure_schema(&self) -> StoreFuture<'_, ()>;

    /// Sinks bound to the current session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] before `connect` succeeded or after `close`.
    fn sinks(&self) -> Result<AnalyticsSinks, StoreError>;

    /// Dead-letter queue bound to the current session, if the backend keeps one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] when the session is not established.
    fn dead_letters(&self) -> Result<Option<Arc<dyn DeadLetterQueue>>, StoreError> {
        Ok(None)
    }

    /// Release the session.
    fn close(&self) -> StoreFuture<'_, ()>;
}
