//! # Shopflow Core
//!
//! Event model and component seams for the Shopflow ingestion pipeline.
//!
//! The pipeline reads e-commerce interaction events from a message queue and
//! folds them into independent aggregate views: per-minute metrics, per-product
//! daily stats, per-actor cart activity and an immutable sales ledger.
//!
//! ## Modules
//!
//! - [`event`]: wire envelope, validation into typed per-kind events, revenue and windows
//! - [`store`]: traits for the raw log, aggregators, ledger and stats source
//! - [`queue`]: message queue with manual acknowledgment
//! - [`dead_letter`]: record of discarded messages
//! - [`environment`]: injected clock
//!
//! ## Architecture Principles
//!
//! - Validate once at decode time, typed data afterwards
//! - Aggregate mutations are atomic and commutative at the storage layer
//! - At-least-once delivery, settle every message explicitly

pub mod dead_letter;
pub mod event;
pub mod queue;
pub mod store;

pub use chrono::{DateTime, Utc};

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
