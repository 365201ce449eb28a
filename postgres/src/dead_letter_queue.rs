//! Dead Letter Queue (DLQ) for discarded messages.
//!
//! Every message the consumer rejects is recorded here first, with its raw
//! body and the failure that caused the rejection. Enables observability,
//! incident response, and manual reprocessing workflows.

use chrono::{DateTime, Utc};
use shopflow_core::dead_letter::{DeadLetter, DeadLetterQueue, FailureKind};
use shopflow_core::store::{StoreError, StoreFuture};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// Status of an entry in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Entry is pending investigation/reprocessing
    Pending,
    /// Entry is currently being processed
    Processing,
    /// Message was successfully reprocessed
    Resolved,
    /// Message was permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Persistence(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A stored dead letter plus its triage state.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// The dead letter as recorded
    pub letter: DeadLetter,
    /// Current triage status
    pub status: DLQStatus,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who/what resolved the entry
    pub resolved_by: Option<String>,
    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue on the `failed_events` table.
///
/// # Example
///
/// ```no_run
/// use shopflow_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// // List pending failures
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// // Mark one as processing
/// if let Some(entry) = pending.first() {
///     dlq.update_status(entry.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r"
    SELECT
        id, message_id, routing_key, payload, headers, error_kind, error_message,
        actor_id, event_type, failed_step, failed_at, status, updated_at,
        resolved_at, resolved_by, resolution_notes
    FROM failed_events
";

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead letter.
    ///
    /// # Returns
    ///
    /// The unique ID of the created DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, StoreError> {
        let headers = serde_json::to_value(&letter.headers)
            .map_err(|e| StoreError::Persistence(format!("Failed to encode headers: {e}")))?;

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                message_id, routing_key, payload, headers, error_kind, error_message,
                actor_id, event_type, failed_step, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            ",
        )
        .bind(&letter.message_id)
        .bind(&letter.routing_key)
        .bind(&letter.payload)
        .bind(headers)
        .bind(letter.kind.as_str())
        .bind(&letter.error_message)
        .bind(&letter.actor_id)
        .bind(&letter.event_type)
        .bind(&letter.failed_step)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to add dead letter: {e}")))?;

        tracing::warn!(
            dlq_id = id,
            message_id = %letter.message_id,
            error_kind = letter.kind.as_str(),
            error = %letter.error_message,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("shopflow_dead_letters_total", "kind" => letter.kind.as_str())
            .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, StoreError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to list dead letters: {e}")))?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails or entry not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("Failed to load dead letter {id}: {e}")))?;

        Self::row_to_failed_message(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to update dead letter {id}: {e}")))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                updated_at = NOW(),
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to resolve dead letter {id}: {e}")))?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("shopflow_dead_letters_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded for good.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                updated_at = NOW(),
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Persistence(format!("Failed to discard dead letter {id}: {e}")))?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        Ok(())
    }

    /// Get count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Persistence(format!("Failed to count dead letters: {e}")))?;

        Ok(count)
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, StoreError> {
        let headers_json: serde_json::Value = row.get("headers");
        let headers: BTreeMap<String, String> = serde_json::from_value(headers_json)
            .map_err(|e| StoreError::Persistence(format!("Invalid dead letter headers: {e}")))?;

        let kind_str: String = row.get("error_kind");
        let status_str: String = row.get("status");

        Ok(FailedMessage {
            id: row.get("id"),
            letter: DeadLetter {
                message_id: row.get("message_id"),
                routing_key: row.get("routing_key"),
                payload: row.get("payload"),
                headers,
                kind: FailureKind::parse(&kind_str)?,
                error_message: row.get("error_message"),
                actor_id: row.get("actor_id"),
                event_type: row.get("event_type"),
                failed_step: row.get("failed_step"),
                failed_at: row.get("failed_at"),
            },
            status: DLQStatus::parse(&status_str)?,
            updated_at: row.get("updated_at"),
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterQueue for PostgresDeadLetterQueue {
    fn push<'a>(&'a self, letter: &'a DeadLetter) -> StoreFuture<'a, i64> {
        Box::pin(self.add_entry(letter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_database_strings() {
        for status in [
            DLQStatus::Pending,
            DLQStatus::Processing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            assert_eq!(DLQStatus::parse(status.as_str()), Ok(status));
        }
        assert!(DLQStatus::parse("archived").is_err());
    }
}
