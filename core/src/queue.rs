//! Message queue abstraction with manual acknowledgment.
//!
//! A [`MessageQueue`] hands out a [`Subscription`], a stream of
//! [`Delivery`] values. Every delivery must be settled exactly once, either
//! with [`Delivery::ack`] after successful processing or with
//! [`Delivery::reject`] to discard it without redelivery. A delivery dropped
//! without settlement stays unacknowledged and is redelivered after a restart.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **No ordering across partitions**: consumers must not rely on delivery order
//! - **Discard on reject**: rejected messages are never redelivered
//!
//! # Implementations
//!
//! - `RedpandaQueue` (in `shopflow-redpanda`) - Kafka-compatible brokers
//! - `InMemoryQueue` (in `shopflow-testing`) - For testing

use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to a queue
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle a delivery
    #[error("Acknowledgment failed for {tag}: {reason}")]
    Acknowledge {
        /// Delivery that could not be settled
        tag: DeliveryTag,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The queue or subscription is closed
    #[error("Queue closed: {0}")]
    Closed(String),
}

/// Boxed future returned by queue traits.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Position of a delivery within the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag {
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Outcome reported back to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed successfully.
    Ack,
    /// Discarded permanently, no requeue.
    Reject,
}

/// Receives settlements for deliveries.
pub trait Acknowledger: Send + Sync {
    /// Settle the delivery identified by `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Acknowledge`] or [`QueueError::Closed`] when the
    /// settlement cannot be recorded.
    fn settle(&self, tag: DeliveryTag, settlement: Settlement) -> Result<(), QueueError>;
}

/// A message handed to the consumer, awaiting settlement.
pub struct Delivery {
    /// Queue position.
    pub tag: DeliveryTag,
    /// Unique message identifier.
    pub message_id: String,
    /// Routing key attached by the producer.
    pub routing_key: Option<String>,
    /// Transport headers.
    pub headers: BTreeMap<String, String>,
    /// Message body.
    pub payload: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        tag: DeliveryTag,
        message_id: impl Into<String>,
        payload: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            message_id: message_id.into(),
            routing_key: None,
            headers: BTreeMap::new(),
            payload,
            acker,
        }
    }

    /// Attach a routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Attach transport headers.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns the acknowledger's error if the settlement cannot be recorded.
    pub fn ack(self) -> Result<(), QueueError> {
        self.acker.settle(self.tag, Settlement::Ack)
    }

    /// Discard the message without requeue.
    ///
    /// # Errors
    ///
    /// Returns the acknowledger's error if the settlement cannot be recorded.
    pub fn reject(self) -> Result<(), QueueError> {
        self.acker.settle(self.tag, Settlement::Reject)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("message_id", &self.message_id)
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// An open subscription.
///
/// Dropping it without calling [`Subscription::close`] stops delivery but
/// does not wait for the background task to flush settlements.
pub struct Subscription {
    queue: String,
    stream: DeliveryStream,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a stream of deliveries.
    #[must_use]
    pub fn new(queue: impl Into<String>, stream: DeliveryStream) -> Self {
        Self {
            queue: queue.into(),
            stream,
            stop: None,
            task: None,
        }
    }

    /// Attach the background task feeding the stream.
    ///
    /// `close` signals `stop` and then waits for `task` to exit.
    #[must_use]
    pub fn with_task(mut self, stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        self.stop = Some(stop);
        self.task = Some(task);
        self
    }

    /// Name of the subscribed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next delivery, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        use futures::StreamExt;
        self.stream.next().await
    }

    /// Stop delivery and wait for the feeding task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transport`] if the background task panicked.
    pub async fn close(mut self) -> Result<(), QueueError> {
        if let Some(stop) = self.stop.take() {
            // The task may already have exited on its own.
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| QueueError::Transport(format!("Subscription task failed: {e}")))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("has_task", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

/// A broker connection.
///
/// # Dyn Compatibility
///
/// Methods return [`QueueFuture`] so the queue can be held as `Arc<dyn MessageQueue>`.
pub trait MessageQueue: Send + Sync {
    /// Connect to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the broker is unreachable.
    fn connect(&self) -> QueueFuture<'_, ()>;

    /// Subscribe to `queue` with at most `prefetch` unsettled deliveries buffered.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the subscription cannot be opened.
    fn subscribe<'a>(&'a self, queue: &'a str, prefetch: usize) -> QueueFuture<'a, Subscription>;

    /// Release the broker connection.
    fn close(&self) -> QueueFuture<'_, ()>;
}
