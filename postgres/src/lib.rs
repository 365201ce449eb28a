//! `PostgreSQL` plumbing for Shopflow.
//!
//! This crate owns the database session and schema:
//!
//! - [`PostgresConnection`]: pool lifecycle, embedded migrations, best-effort index provisioning
//! - [`PostgresDeadLetterQueue`]: inspectable record of discarded messages
//!
//! The aggregate tables themselves are written by `shopflow-projections`.
//!
//! # Example
//!
//! ```ignore
//! use shopflow_postgres::{PostgresConnection, PostgresDeadLetterQueue};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = PostgresConnection::new("postgres://localhost/shopflow");
//!     let pool = connection.connect().await?;
//!     connection.migrate().await?;
//!     let dlq = PostgresDeadLetterQueue::new(pool);
//!     println!("pending: {}", dlq.count_pending().await?);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod dead_letter_queue;

pub use connection::PostgresConnection;
pub use dead_letter_queue::{DLQStatus, FailedMessage, PostgresDeadLetterQueue};
