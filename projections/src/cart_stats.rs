//! Per-actor, per-day cart activity (`cart_stats`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shopflow_core::event::UserEvent;
use shopflow_core::store::{CartAggregator, StoreError, StoreFuture};
use sqlx::PgPool;

/// An actor's cart activity for one UTC day.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct CartDailyStat {
    /// Actor.
    pub actor_id: String,
    /// UTC day.
    pub date: NaiveDate,
    /// Items added across all add-to-cart events.
    pub items_added: i64,
    /// Latest add-to-cart.
    pub last_activity: DateTime<Utc>,
}

/// Postgres cart aggregator.
#[derive(Clone)]
pub struct PostgresCartActivity {
    pool: PgPool,
}

impl PostgresCartActivity {
    /// Create an aggregator on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add items to the actor's daily total.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the upsert fails.
    pub async fn upsert(&self, event: &UserEvent, quantity: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cart_stats (actor_id, date, items_added, last_activity)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (actor_id, date) DO UPDATE
             SET items_added = cart_stats.items_added + EXCLUDED.items_added,
                 last_activity = EXCLUDED.last_activity",
        )
        .bind(&event.actor_id)
        .bind(event.calendar_date())
        .bind(quantity)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to record cart activity: {e}")))?;

        Ok(())
    }

    /// Cart activity for an actor on a day.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn get(&self, actor_id: &str, date: NaiveDate) -> Result<Option<CartDailyStat>, StoreError> {
        sqlx::query_as::<_, CartDailyStat>(
            "SELECT actor_id, date, items_added, last_activity
             FROM cart_stats
             WHERE actor_id = $1 AND date = $2",
        )
        .bind(actor_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query cart stats: {e}")))
    }
}

impl CartAggregator for PostgresCartActivity {
    fn record_add_to_cart<'a>(&'a self, event: &'a UserEvent, quantity: i64) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert(event, quantity))
    }
}
