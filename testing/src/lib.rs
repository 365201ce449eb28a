//! # Shopflow Testing
//!
//! Testing utilities for the Shopflow pipeline.
//!
//! This crate provides:
//! - [`InMemoryQueue`]: a message queue that records every settlement
//! - [`InMemoryAnalytics`]: every aggregate sink in memory, with failure injection
//! - [`InMemoryDeadLetterQueue`]: captured dead letters
//! - [`FixedClock`]: deterministic time
//! - [`fixtures`]: wire envelopes for each event kind
//!
//! ## Example
//!
//! ```ignore
//! use shopflow_testing::{fixtures, test_clock, InMemoryAnalytics, InMemoryQueue};
//!
//! #[tokio::test]
//! async fn purchase_is_acknowledged() {
//!     let queue = InMemoryQueue::new().ending_when_drained();
//!     let analytics = InMemoryAnalytics::new();
//!     queue.publish_json(&fixtures::purchase("u1", "p1", 100.0, 2, 0.1, "2025-01-01T12:00:00Z"));
//!
//!     // wire a PipelineClient and run it ...
//!
//!     assert_eq!(queue.acked().len(), 1);
//!     assert_eq!(analytics.sales()[0].total_amount, 180.0);
//! }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Locks only panic if a test already panicked

pub mod analytics;
pub mod fixtures;
pub mod queue;

use chrono::{DateTime, Utc};
use shopflow_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use shopflow_testing::mocks::FixedClock;
    /// use shopflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// Fixed clock at an RFC 3339 timestamp.
        ///
        /// # Panics
        ///
        /// Panics if `timestamp` does not parse.
        #[must_use]
        #[allow(clippy::expect_used)]
        pub fn at(timestamp: &str) -> Self {
            Self::new(
                DateTime::parse_from_rfc3339(timestamp)
                    .expect("test timestamp should parse")
                    .with_timezone(&Utc),
            )
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::at("2025-01-01T00:00:00Z")
    }

    /// Shared, ordered record of lifecycle calls across test doubles.
    ///
    /// Hand the same log to the queue and the store to assert on the order
    /// in which a client connects and releases them.
    #[derive(Debug, Clone, Default)]
    pub struct LifecycleLog {
        entries: Arc<Mutex<Vec<String>>>,
    }

    impl LifecycleLog {
        /// Create an empty log.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Append an entry.
        pub fn record(&self, entry: impl Into<String>) {
            self.entries.lock().unwrap().push(entry.into());
        }

        /// Entries in call order.
        #[must_use]
        pub fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }
}

/// Install a test-writer tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shopflow=debug")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use analytics::{
    InMemoryAnalytics, InMemoryDeadLetterQueue, ProductStat, Sink, StoredBucket, StoredCart,
    StoredEvent, StoredSale,
};
pub use mocks::{FixedClock, LifecycleLog, test_clock};
pub use queue::InMemoryQueue;
