//! Append-only raw event log (`user_events`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopflow_core::event::ReceivedEvent;
use shopflow_core::store::{RawEventStore, StoreError, StoreFuture};
use sqlx::PgPool;

/// A row of the raw log.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawEventRow {
    /// Surrogate key.
    pub id: i64,
    /// Transport message id.
    pub message_id: String,
    /// Actor.
    pub actor_id: String,
    /// Session.
    pub session_id: Option<String>,
    /// Kind name.
    pub event_type: String,
    /// Event timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Payload as received.
    pub data: serde_json::Value,
    /// Metadata as received.
    pub metadata: serde_json::Value,
    /// When the consumer stored the event.
    pub processed_at: DateTime<Utc>,
}

/// Postgres raw log. No uniqueness: redeliveries are stored again.
#[derive(Clone)]
pub struct PostgresRawEventStore {
    pool: PgPool,
}

impl PostgresRawEventStore {
    /// Create a store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the insert fails.
    pub async fn insert(
        &self,
        received: &ReceivedEvent,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event = &received.event;

        sqlx::query(
            "INSERT INTO user_events
             (message_id, actor_id, session_id, event_type, occurred_at, data, metadata, processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&received.message_id)
        .bind(&event.actor_id)
        .bind(&event.session_id)
        .bind(event.kind().as_str())
        .bind(event.occurred_at)
        .bind(&event.data)
        .bind(&event.metadata)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to append raw event: {e}")))?;

        Ok(())
    }

    /// Rows stored under a message id, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn find_by_message(&self, message_id: &str) -> Result<Vec<RawEventRow>, StoreError> {
        sqlx::query_as::<_, RawEventRow>(
            "SELECT id, message_id, actor_id, session_id, event_type, occurred_at,
                    data, metadata, processed_at
             FROM user_events
             WHERE message_id = $1
             ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to query raw events: {e}")))
    }

    /// Total number of rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("Failed to count raw events: {e}")))?;
        Ok(count)
    }
}

impl RawEventStore for PostgresRawEventStore {
    fn append<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.insert(received, processed_at))
    }
}
