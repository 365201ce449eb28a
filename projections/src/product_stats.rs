//! Per-product, per-day statistics (`product_stats`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shopflow_core::event::{ProductInfo, PurchaseLine, UserEvent};
use shopflow_core::store::{ProductStatsAggregator, StoreError, StoreFuture};
use sqlx::PgPool;

/// A product's statistics for one UTC day.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductDailyStat {
    /// Product.
    pub product_id: String,
    /// UTC day.
    pub date: NaiveDate,
    /// Views.
    pub views: i64,
    /// Purchased quantity.
    pub purchases: i64,
    /// Purchase revenue.
    pub revenue: f64,
    /// Name from the latest view.
    pub name: Option<String>,
    /// Category from the latest view.
    pub category: Option<String>,
    /// Brand from the latest view.
    pub brand: Option<String>,
    /// Price from the latest view.
    pub price: Option<f64>,
    /// Latest view.
    pub last_viewed: Option<DateTime<Utc>>,
    /// Latest purchase.
    pub last_purchased: Option<DateTime<Utc>>,
}

/// Postgres product daily-stat aggregator.
///
/// Counters are incremented in place; descriptors and timestamps are
/// last-write-wins overwrites.
#[derive(Clone)]
pub struct PostgresProductDailyStats {
    pool: PgPool,
}

impl PostgresProductDailyStats {
    /// Create an aggregator on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count a view and refresh descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the upsert fails.
    pub async fn upsert_view(&self, event: &UserEvent, product: &ProductInfo) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO product_stats
             (product_id, date, views, name, category, brand, price, last_viewed)
             VALUES ($1, $2, 1, $3, $4, $5, $6, $7)
             ON CONFLICT (product_id, date) DO UPDATE
             SET views = product_stats.views + 1,
                 name = EXCLUDED.name,
                 category = EXCLUDED.category,
                 brand = EXCLUDED.brand,
                 price = EXCLUDED.price,
                 last_viewed = EXCLUDED.last_viewed",
        )
        .bind(&product.product_id)
        .bind(event.calendar_date())
        .bind(&product.name)
        .bind(&product.category)
        .bind(&product.brand)
        .bind(product.price)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to record product view: {e}")))?;

        Ok(())
    }

    /// Add a purchase's quantity and revenue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the upsert fails.
    pub async fn upsert_purchase(
        &self,
        event: &UserEvent,
        line: &PurchaseLine,
        revenue: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO product_stats
             (product_id, date, purchases, revenue, last_purchased)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (product_id, date) DO UPDATE
             SET purchases = product_stats.purchases + EXCLUDED.purchases,
                 revenue = product_stats.revenue + EXCLUDED.revenue,
                 last_purchased = EXCLUDED.last_purchased",
        )
        .bind(&line.product.product_id)
        .bind(event.calendar_date())
        .bind(line.quantity)
        .bind(revenue)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to record product purchase: {e}")))?;

        Ok(())
    }

    /// Statistics for a product on a day.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn get(
        &self,
        product_id: &str,
        date: NaiveDate,
    ) -> Result<Option<ProductDailyStat>, StoreError> {
        sqlx::query_as::<_, ProductDailyStat>(
            "SELECT product_id, date, views, purchases, revenue, name, category, brand,
                    price, last_viewed, last_purchased
             FROM product_stats
             WHERE product_id = $1 AND date = $2",
        )
        .bind(product_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query product stats: {e}")))
    }

    /// Best-selling products of a day by revenue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn top_by_revenue(
        &self,
        date: NaiveDate,
        limit: i64,
    ) -> Result<Vec<ProductDailyStat>, StoreError> {
        sqlx::query_as::<_, ProductDailyStat>(
            "SELECT product_id, date, views, purchases, revenue, name, category, brand,
                    price, last_viewed, last_purchased
             FROM product_stats
             WHERE date = $1
             ORDER BY revenue DESC, product_id
             LIMIT $2",
        )
        .bind(date)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query product stats: {e}")))
    }
}

impl ProductStatsAggregator for PostgresProductDailyStats {
    fn record_view<'a>(
        &'a self,
        event: &'a UserEvent,
        product: &'a ProductInfo,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert_view(event, product))
    }

    fn record_purchase<'a>(
        &'a self,
        event: &'a UserEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert_purchase(event, line, revenue))
    }
}
