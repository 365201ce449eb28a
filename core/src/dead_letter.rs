//! Dead letters: messages discarded after a failure.
//!
//! A rejected message is never redelivered, so before rejecting, the consumer
//! records it here with the failure reason. Operators can inspect, resolve
//! or discard entries later.

use crate::store::{StoreError, StoreFuture};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The message did not decode or failed validation.
    Malformed,
    /// A store operation failed part way through processing.
    Persistence,
}

impl FailureKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Persistence => "persistence",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] for an unknown value.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "malformed" => Ok(Self::Malformed),
            "persistence" => Ok(Self::Persistence),
            _ => Err(StoreError::Persistence(format!("Invalid failure kind: {s}"))),
        }
    }
}

/// A discarded message and its failure context.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Transport message identifier.
    pub message_id: String,
    /// Routing key, when the transport carried one.
    pub routing_key: Option<String>,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Transport headers.
    pub headers: BTreeMap<String, String>,
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable error.
    pub error_message: String,
    /// Actor, when the message decoded far enough to know it.
    pub actor_id: Option<String>,
    /// Event type, when known.
    pub event_type: Option<String>,
    /// Processing step that failed, for persistence failures.
    pub failed_step: Option<String>,
    /// When the failure happened.
    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterQueue: Send + Sync {
    /// Record a dead letter and return its identifier.
    fn push<'a>(&'a self, letter: &'a DeadLetter) -> StoreFuture<'a, i64>;
}
