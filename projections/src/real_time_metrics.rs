//! Per-minute rolling metrics (`real_time_metrics`).
//!
//! One row per minute, keyed by the event's own timestamp truncated to the
//! minute. Every update is a single `INSERT ... ON CONFLICT DO UPDATE` whose
//! assignments are increments or a conditional array append, so concurrent
//! deliveries for the same window compose without read-modify-write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopflow_core::event::{EventKind, UserEvent};
use shopflow_core::store::{MetricsAggregator, StoreError, StoreFuture};
use sqlx::PgPool;

/// A minute bucket.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetricsBucket {
    /// Start of the minute.
    pub window_start: DateTime<Utc>,
    /// Events of any kind.
    pub total_events: i64,
    /// Page views.
    pub page_views: i64,
    /// Product views.
    pub product_views: i64,
    /// Add-to-cart events.
    pub add_to_carts: i64,
    /// Purchase events.
    pub purchases: i64,
    /// Purchase revenue.
    pub revenue: f64,
    /// Distinct actors seen in the minute.
    pub unique_actors: Vec<String>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Postgres minute-bucket aggregator.
#[derive(Clone)]
pub struct PostgresRealTimeMetrics {
    pool: PgPool,
}

/// Per-kind increments in column order: page views, product views, add to carts, purchases.
const fn kind_increments(kind: EventKind) -> [i64; 4] {
    match kind {
        EventKind::PageView => [1, 0, 0, 0],
        EventKind::ProductView => [0, 1, 0, 0],
        EventKind::AddToCart => [0, 0, 1, 0],
        EventKind::Purchase => [0, 0, 0, 1],
    }
}

impl PostgresRealTimeMetrics {
    /// Create an aggregator on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fold one event into its bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the upsert fails.
    pub async fn upsert(
        &self,
        event: &UserEvent,
        revenue: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let [page_views, product_views, add_to_carts, purchases] = kind_increments(event.kind());

        sqlx::query(
            "INSERT INTO real_time_metrics
             (window_start, total_events, page_views, product_views, add_to_carts,
              purchases, revenue, unique_actors, updated_at)
             VALUES ($1, 1, $2, $3, $4, $5, $6, ARRAY[$7::TEXT], $8)
             ON CONFLICT (window_start) DO UPDATE
             SET total_events = real_time_metrics.total_events + 1,
                 page_views = real_time_metrics.page_views + EXCLUDED.page_views,
                 product_views = real_time_metrics.product_views + EXCLUDED.product_views,
                 add_to_carts = real_time_metrics.add_to_carts + EXCLUDED.add_to_carts,
                 purchases = real_time_metrics.purchases + EXCLUDED.purchases,
                 revenue = real_time_metrics.revenue + EXCLUDED.revenue,
                 unique_actors = CASE
                     WHEN $7::TEXT = ANY(real_time_metrics.unique_actors)
                         THEN real_time_metrics.unique_actors
                     ELSE array_append(real_time_metrics.unique_actors, $7::TEXT)
                 END,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(event.window_start())
        .bind(page_views)
        .bind(product_views)
        .bind(add_to_carts)
        .bind(purchases)
        .bind(revenue)
        .bind(&event.actor_id)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to update minute metrics: {e}")))?;

        tracing::trace!(
            window_start = %event.window_start(),
            kind = %event.kind(),
            "Minute metrics updated"
        );

        Ok(())
    }

    /// Bucket for the minute starting at `window_start`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn get_bucket(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<Option<MetricsBucket>, StoreError> {
        sqlx::query_as::<_, MetricsBucket>(
            "SELECT window_start, total_events, page_views, product_views, add_to_carts,
                    purchases, revenue, unique_actors, updated_at
             FROM real_time_metrics
             WHERE window_start = $1",
        )
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query minute metrics: {e}")))
    }

    /// Most recent buckets, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn recent(&self, limit: i64) -> Result<Vec<MetricsBucket>, StoreError> {
        sqlx::query_as::<_, MetricsBucket>(
            "SELECT window_start, total_events, page_views, product_views, add_to_carts,
                    purchases, revenue, unique_actors, updated_at
             FROM real_time_metrics
             ORDER BY window_start DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query minute metrics: {e}")))
    }
}

impl MetricsAggregator for PostgresRealTimeMetrics {
    fn record<'a>(
        &'a self,
        event: &'a UserEvent,
        revenue: f64,
        updated_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert(event, revenue, updated_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_increments_exactly_one_counter() {
        for kind in EventKind::ALL {
            let increments = kind_increments(kind);
            assert_eq!(increments.iter().sum::<i64>(), 1, "{kind}");
        }
        assert_eq!(kind_increments(EventKind::Purchase), [0, 0, 0, 1]);
    }
}
