//! Immutable sales ledger (`sales`) and the stats snapshot query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopflow_core::event::{PurchaseLine, ReceivedEvent};
use shopflow_core::store::{
    SalesLedger, StatsSnapshot, StatsSource, StoreError, StoreFuture,
};
use sqlx::PgPool;

/// One ledger row.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct SalesRecord {
    /// Surrogate key.
    pub id: i64,
    /// Transport message id of the purchase.
    pub message_id: String,
    /// Buyer.
    pub actor_id: String,
    /// Session.
    pub session_id: Option<String>,
    /// Product.
    pub product_id: String,
    /// Product name.
    pub product_name: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// Brand.
    pub brand: Option<String>,
    /// Quantity.
    pub quantity: i64,
    /// Unit price.
    pub unit_price: f64,
    /// Discount fraction.
    pub discount: f64,
    /// `unit_price * quantity * (1 - discount)`.
    pub total_amount: f64,
    /// Purchase timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Metadata as received.
    pub metadata: serde_json::Value,
}

/// Postgres sales ledger. Insert only.
#[derive(Clone)]
pub struct PostgresSalesLedger {
    pool: PgPool,
}

impl PostgresSalesLedger {
    /// Create a ledger on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a sale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the insert fails.
    pub async fn insert(
        &self,
        received: &ReceivedEvent,
        line: &PurchaseLine,
        revenue: f64,
    ) -> Result<(), StoreError> {
        let event = &received.event;
        sqlx::query(
            "INSERT INTO sales
             (message_id, actor_id, session_id, product_id, product_name, category, brand,
              quantity, unit_price, discount, total_amount, occurred_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&received.message_id)
        .bind(&event.actor_id)
        .bind(&event.session_id)
        .bind(&line.product.product_id)
        .bind(&line.product.name)
        .bind(&line.product.category)
        .bind(&line.product.brand)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(line.discount)
        .bind(revenue)
        .bind(event.occurred_at)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to record sale: {e}")))?;

        tracing::debug!(
            message_id = %received.message_id,
            product_id = %line.product.product_id,
            total_amount = revenue,
            "Sale recorded"
        );

        Ok(())
    }

    /// Sales recorded under a message id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn find_by_message(&self, message_id: &str) -> Result<Vec<SalesRecord>, StoreError> {
        sqlx::query_as::<_, SalesRecord>(
            "SELECT id, message_id, actor_id, session_id, product_id, product_name, category,
                    brand, quantity, unit_price, discount, total_amount, occurred_at, metadata
             FROM sales
             WHERE message_id = $1
             ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query sales: {e}")))
    }

    /// Raw event count, sale count and revenue in one round trip.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn totals(&self) -> Result<StatsSnapshot, StoreError> {
        let (total_events, total_sales, total_revenue): (i64, i64, f64) = sqlx::query_as(
            "SELECT
                 (SELECT COUNT(*) FROM user_events),
                 (SELECT COUNT(*) FROM sales),
                 (SELECT COALESCE(SUM(total_amount), 0)::DOUBLE PRECISION FROM sales)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query stats: {e}")))?;

        Ok(StatsSnapshot {
            total_events,
            total_sales,
            total_revenue,
        })
    }
}

impl SalesLedger for PostgresSalesLedger {
    fn record_sale<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.insert(received, line, revenue))
    }
}

impl StatsSource for PostgresSalesLedger {
    fn snapshot(&self) -> StoreFuture<'_, StatsSnapshot> {
        Box::pin(self.totals())
    }
}
