//! Connection pool lifecycle and schema provisioning.

use shopflow_core::store::StoreError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Secondary indexes. Created best-effort after migrations.
const INDEXES: &[(&str, &str)] = &[
    (
        "idx_user_events_actor",
        "CREATE INDEX IF NOT EXISTS idx_user_events_actor ON user_events (actor_id, occurred_at)",
    ),
    (
        "idx_user_events_type",
        "CREATE INDEX IF NOT EXISTS idx_user_events_type ON user_events (event_type, occurred_at)",
    ),
    (
        "idx_real_time_metrics_updated",
        "CREATE INDEX IF NOT EXISTS idx_real_time_metrics_updated ON real_time_metrics (updated_at)",
    ),
    (
        "idx_sales_product",
        "CREATE INDEX IF NOT EXISTS idx_sales_product ON sales (product_id, occurred_at)",
    ),
    (
        "idx_sales_occurred",
        "CREATE INDEX IF NOT EXISTS idx_sales_occurred ON sales (occurred_at)",
    ),
];

/// A `PostgreSQL` session: the pool plus the URL it is (re)created from.
///
/// # Example
///
/// ```no_run
/// use shopflow_postgres::PostgresConnection;
///
/// # async fn example() -> Result<(), shopflow_core::store::StoreError> {
/// let connection = PostgresConnection::new("postgres://localhost/shopflow").max_connections(20);
/// let pool = connection.connect().await?;
/// connection.migrate().await?;
/// connection.ensure_indexes().await;
/// # drop(pool);
/// connection.close().await;
/// # Ok(())
/// # }
/// ```
pub struct PostgresConnection {
    database_url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    pool: Mutex<Option<PgPool>>,
}

impl PostgresConnection {
    /// Describe a connection to `database_url`. Nothing is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            pool: Mutex::new(None),
        }
    }

    /// Wrap an already-open pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            database_url: String::new(),
            max_connections: pool.options().get_max_connections(),
            acquire_timeout: pool.options().get_acquire_timeout(),
            pool: Mutex::new(Some(pool)),
        }
    }

    /// Set the pool size. Default: 10.
    #[must_use]
    pub const fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set how long to wait for a pooled connection. Default: 5 seconds.
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Open the pool, or return the open one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the database is unreachable.
    pub async fn connect(&self) -> Result<PgPool, StoreError> {
        if let Ok(pool) = self.pool() {
            return Ok(pool);
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to database: {e}")))?;

        tracing::info!(max_connections = self.max_connections, "Connected to PostgreSQL");

        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool.clone());
        Ok(pool)
    }

    /// The open pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if not connected.
    pub fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| StoreError::Connection("Not connected to PostgreSQL".to_string()))
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if not connected, or
    /// [`StoreError::Persistence`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let pool = self.pool()?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Persistence(format!("Failed to run migrations: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Create secondary indexes.
    ///
    /// Failures are logged as warnings and counted; they never abort startup.
    /// Returns the number of indexes that could not be created.
    pub async fn ensure_indexes(&self) -> usize {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping index provisioning");
                return INDEXES.len();
            },
        };

        let mut failures = 0;
        for &(name, ddl) in INDEXES {
            if let Err(e) = sqlx::query(ddl).execute(&pool).await {
                failures += 1;
                tracing::warn!(index = name, error = %e, "Failed to create index");
            }
        }

        if failures == 0 {
            tracing::info!(count = INDEXES.len(), "Indexes ensured");
        }
        failures
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!("PostgreSQL connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_unavailable_before_connect() {
        let connection = PostgresConnection::new("postgres://localhost/unused");
        assert!(matches!(connection.pool(), Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn close_without_connect_is_a_no_op() {
        let connection = PostgresConnection::new("postgres://localhost/unused");
        connection.close().await;
        assert!(connection.pool().is_err());
    }

    #[tokio::test]
    async fn index_provisioning_without_pool_reports_every_index() {
        let connection = PostgresConnection::new("postgres://localhost/unused");
        assert_eq!(connection.ensure_indexes().await, INDEXES.len());
    }
}
