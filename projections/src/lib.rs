//! `PostgreSQL` aggregate views for Shopflow.
//!
//! # Overview
//!
//! Each view is its own table and its own type:
//!
//! | Type | Table | Key |
//! |------|-------|-----|
//! | [`PostgresRawEventStore`] | `user_events` | none (append-only) |
//! | [`PostgresRealTimeMetrics`] | `real_time_metrics` | `window_start` |
//! | [`PostgresProductDailyStats`] | `product_stats` | `(product_id, date)` |
//! | [`PostgresCartActivity`] | `cart_stats` | `(actor_id, date)` |
//! | [`PostgresSalesLedger`] | `sales` | none (append-only) |
//!
//! [`PostgresAnalytics`] ties them to one [`PostgresConnection`] and exposes
//! them as [`AnalyticsSinks`] through the [`StoreConnection`] trait.
//!
//! # Example
//!
//! ```ignore
//! use shopflow_projections::PostgresAnalytics;
//! use shopflow_core::store::StoreConnection;
//!
//! let analytics = PostgresAnalytics::new("postgres://localhost/shopflow");
//! analytics.connect().await?;
//! analytics.ensure_schema().await?;
//! let sinks = analytics.sinks()?;
//! ```

pub mod cart_stats;
pub mod product_stats;
pub mod raw_events;
pub mod real_time_metrics;
pub mod sales;

pub use cart_stats::{CartDailyStat, PostgresCartActivity};
pub use product_stats::{PostgresProductDailyStats, ProductDailyStat};
pub use raw_events::{PostgresRawEventStore, RawEventRow};
pub use real_time_metrics::{MetricsBucket, PostgresRealTimeMetrics};
pub use sales::{PostgresSalesLedger, SalesRecord};

use shopflow_core::dead_letter::DeadLetterQueue;
use shopflow_core::store::{AnalyticsSinks, StoreConnection, StoreError, StoreFuture};
use shopflow_postgres::{PostgresConnection, PostgresDeadLetterQueue};
use std::sync::Arc;

/// All aggregate views on one `PostgreSQL` connection.
pub struct PostgresAnalytics {
    connection: PostgresConnection,
}

impl PostgresAnalytics {
    /// Views on a connection that is not yet open.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self::from_connection(PostgresConnection::new(database_url))
    }

    /// Views on a configured connection.
    #[must_use]
    pub const fn from_connection(connection: PostgresConnection) -> Self {
        Self { connection }
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &PostgresConnection {
        &self.connection
    }
}

impl StoreConnection for PostgresAnalytics {
    fn connect(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.connection.connect().await?;
            Ok(())
        })
    }

    fn ensure_schema(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.connection.migrate().await?;
            let failures = self.connection.ensure_indexes().await;
            if failures > 0 {
                tracing::warn!(failures, "Continuing without some secondary indexes");
            }
            Ok(())
        })
    }

    fn sinks(&self) -> Result<AnalyticsSinks, StoreError> {
        let pool = self.connection.pool()?;
        let sales = Arc::new(PostgresSalesLedger::new(pool.clone()));
        Ok(AnalyticsSinks {
            raw_events: Arc::new(PostgresRawEventStore::new(pool.clone())),
            metrics: Arc::new(PostgresRealTimeMetrics::new(pool.clone())),
            products: Arc::new(PostgresProductDailyStats::new(pool.clone())),
            carts: Arc::new(PostgresCartActivity::new(pool)),
            sales: sales.clone(),
            stats: sales,
        })
    }

    fn dead_letters(&self) -> Result<Option<Arc<dyn DeadLetterQueue>>, StoreError> {
        let pool = self.connection.pool()?;
        Ok(Some(Arc::new(PostgresDeadLetterQueue::new(pool))))
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.connection.close().await;
            Ok(())
        })
    }
}
