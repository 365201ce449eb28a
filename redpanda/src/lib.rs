//! Redpanda message queue for Shopflow.
//!
//! This crate implements the [`MessageQueue`] trait from `shopflow-core` on a
//! Kafka-compatible broker using rdkafka. Redpanda, Apache Kafka and managed
//! Kafka services all work.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `enable.auto.commit` is off; offsets are committed only after settlement
//! - Settlement happens out of order, so each partition commits only up to
//!   its highest *contiguous* settled offset (see [`OffsetTracker`])
//! - An unsettled message is redelivered after a crash or restart
//! - A reject settles the message like an ack: the offset moves past it and
//!   it is never redelivered
//!
//! At most `prefetch` messages are delivered and unsettled at any time: no
//! further message is read from the broker until one of them is settled.
//! Settlements are committed as they arrive, also while the topic is idle.
//!
//! # Message mapping
//!
//! | Kafka | [`Delivery`] |
//! |-------|--------------|
//! | key | `routing_key` (`user.<event_type>`) |
//! | header `message_id` | `message_id`, else `<topic>:<partition>:<offset>` |
//! | other headers | `headers` (lossy UTF-8) |
//! | payload | `payload` |
//!
//! # Example
//!
//! ```no_run
//! use shopflow_redpanda::RedpandaQueue;
//! use shopflow_core::queue::MessageQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaQueue::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("shopflow-consumer")
//!     .auto_offset_reset("earliest")
//!     .build()?;
//!
//! queue.connect().await?;
//! let mut subscription = queue.subscribe("user.events", 10).await?;
//! while let Some(delivery) = subscription.next().await {
//!     delivery?.ack()?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod offsets;

pub use offsets::OffsetTracker;

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use shopflow_core::queue::{
    Acknowledger, Delivery, DeliveryTag, MessageQueue, QueueError, QueueFuture, Settlement,
    Subscription,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Header carrying the producer's message id.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Redpanda-backed message queue.
///
/// Each [`subscribe`](MessageQueue::subscribe) creates its own consumer in
/// the configured group, owned by a background task.
pub struct RedpandaQueue {
    brokers: String,
    consumer_group: String,
    auto_offset_reset: String,
    session_timeout: Duration,
    metadata_timeout: Duration,
    connected: AtomicBool,
}

impl RedpandaQueue {
    /// Create a queue with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if `brokers` is empty.
    pub fn new(brokers: &str, consumer_group: &str) -> Result<Self, QueueError> {
        Self::builder()
            .brokers(brokers)
            .consumer_group(consumer_group)
            .build()
    }

    /// Create a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RedpandaQueueBuilder {
        RedpandaQueueBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group id.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

/// Builder for configuring a [`RedpandaQueue`].
///
/// # Example
///
/// ```no_run
/// use shopflow_redpanda::RedpandaQueue;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("shopflow-consumer")
///     .session_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaQueueBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
}

impl RedpandaQueueBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group (default: `shopflow-consumer`).
    ///
    /// Instances in the same group share the topic's partitions.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a group without committed offsets starts reading (default: `earliest`).
    ///
    /// - `"earliest"`: everything still retained on the topic
    /// - `"latest"`: only messages produced after subscribing
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout (default: 6 s).
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how long `connect` waits for cluster metadata (default: 5 s).
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Build the queue. No network traffic happens until `connect`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if brokers are not set.
    pub fn build(self) -> Result<RedpandaQueue, QueueError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;

        Ok(RedpandaQueue {
            brokers,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "shopflow-consumer".to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            metadata_timeout: self.metadata_timeout.unwrap_or(Duration::from_secs(5)),
            connected: AtomicBool::new(false),
        })
    }
}

/// Forwards settlements to the task that owns the consumer.
struct ChannelAcknowledger {
    settlements: mpsc::UnboundedSender<(DeliveryTag, Settlement)>,
}

impl Acknowledger for ChannelAcknowledger {
    fn settle(&self, tag: DeliveryTag, settlement: Settlement) -> Result<(), QueueError> {
        self.settlements
            .send((tag, settlement))
            .map_err(|_| QueueError::Closed(format!("subscription closed before settling {tag}")))
    }
}

impl MessageQueue for RedpandaQueue {
    fn connect(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let config = self.consumer_config();
            let timeout = self.metadata_timeout;

            // Metadata fetches block; keep them off the runtime threads.
            let broker_count = tokio::task::spawn_blocking(move || {
                let client: BaseConsumer = config
                    .create()
                    .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create client: {e}")))?;
                client
                    .fetch_metadata(None, timeout)
                    .map(|metadata| metadata.brokers().len())
                    .map_err(|e| QueueError::ConnectionFailed(format!("Failed to fetch metadata: {e}")))
            })
            .await
            .map_err(|e| QueueError::ConnectionFailed(format!("Metadata request failed: {e}")))??;

            self.connected.store(true, Ordering::SeqCst);
            tracing::info!(
                brokers = %self.brokers,
                broker_count,
                consumer_group = %self.consumer_group,
                "Connected to Redpanda"
            );
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, queue: &'a str, prefetch: usize) -> QueueFuture<'a, Subscription> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(QueueError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: "not connected".to_string(),
                });
            }

            let consumer: StreamConsumer = self.consumer_config().create().map_err(|e| {
                QueueError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: format!("Failed to create consumer: {e}"),
                }
            })?;
            consumer
                .subscribe(&[queue])
                .map_err(|e| QueueError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            let prefetch = prefetch.max(1);
            tracing::info!(
                topic = %queue,
                consumer_group = %self.consumer_group,
                prefetch,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let (deliveries_tx, mut deliveries_rx) = mpsc::channel(prefetch);
            let (settlements_tx, settlements_rx) = mpsc::unbounded_channel();
            let (stop_tx, stop_rx) = oneshot::channel();
            let acknowledger: Arc<dyn Acknowledger> = Arc::new(ChannelAcknowledger {
                settlements: settlements_tx,
            });

            let task = tokio::spawn(
                ConsumerTask {
                    consumer,
                    topic: queue.to_string(),
                    acknowledger,
                    tracker: OffsetTracker::new(),
                    prefetch,
                }
                .run(deliveries_tx, settlements_rx, stop_rx),
            );

            let stream = async_stream::stream! {
                while let Some(result) = deliveries_rx.recv().await {
                    yield result;
                }
            };

            Ok(Subscription::new(queue, stream.boxed()).with_task(stop_tx, task))
        })
    }

    fn close(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            tracing::info!(brokers = %self.brokers, "Redpanda connection released");
            Ok(())
        })
    }
}

/// Owns the consumer: forwards messages, applies settlements, commits.
struct ConsumerTask {
    consumer: StreamConsumer,
    topic: String,
    acknowledger: Arc<dyn Acknowledger>,
    tracker: OffsetTracker,
    prefetch: usize,
}

impl ConsumerTask {
    async fn run(
        mut self,
        deliveries: mpsc::Sender<Result<Delivery, QueueError>>,
        mut settlements: mpsc::UnboundedReceiver<(DeliveryTag, Settlement)>,
        mut stop: oneshot::Receiver<()>,
    ) {
        'consume: loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                Some((tag, settlement)) = settlements.recv() => {
                    self.apply(tag, settlement, CommitMode::Async);
                },
                // Nothing is read while `prefetch` deliveries are unsettled.
                permit = deliveries.reserve(), if self.tracker.unsettled() < self.prefetch => {
                    let Ok(permit) = permit else {
                        tracing::debug!("Subscription dropped, stopping consumer task");
                        break;
                    };
                    let next = loop {
                        tokio::select! {
                            biased;
                            _ = &mut stop => break 'consume,
                            Some((tag, settlement)) = settlements.recv() => {
                                self.apply(tag, settlement, CommitMode::Async);
                            },
                            next = self.next_delivery() => break next,
                        }
                    };
                    match next {
                        Ok(delivery) => {
                            self.tracker.delivered(delivery.tag.partition, delivery.tag.offset);
                            permit.send(Ok(delivery));
                        },
                        Err(e) => {
                            permit.send(Err(QueueError::Transport(format!(
                                "Failed to receive message: {e}"
                            ))));
                        },
                    }
                },
            }
        }

        // Settlements made before close still count.
        while let Ok((tag, settlement)) = settlements.try_recv() {
            self.apply(tag, settlement, CommitMode::Async);
        }
        self.commit_positions();

        tracing::debug!(
            topic = %self.topic,
            unsettled = self.tracker.unsettled(),
            "Consumer task exiting"
        );
    }

    async fn next_delivery(&self) -> Result<Delivery, KafkaError> {
        let message = self.consumer.recv().await?;
        Ok(self.to_delivery(&message))
    }

    fn to_delivery(&self, message: &BorrowedMessage<'_>) -> Delivery {
        let tag = DeliveryTag {
            partition: message.partition(),
            offset: message.offset(),
        };

        let mut headers = BTreeMap::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                let value = header
                    .value
                    .map(|value| String::from_utf8_lossy(value).into_owned())
                    .unwrap_or_default();
                headers.insert(header.key.to_string(), value);
            }
        }

        let message_id = headers
            .get(MESSAGE_ID_HEADER)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("{}:{}:{}", message.topic(), tag.partition, tag.offset));

        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

        tracing::trace!(
            topic = message.topic(),
            partition = tag.partition,
            offset = tag.offset,
            message_id = %message_id,
            "Received message"
        );

        let mut delivery = Delivery::new(tag, message_id, payload, self.acknowledger.clone())
            .with_headers(headers);
        if let Some(key) = message.key() {
            delivery = delivery.with_routing_key(String::from_utf8_lossy(key).into_owned());
        }
        delivery
    }

    fn apply(&mut self, tag: DeliveryTag, settlement: Settlement, mode: CommitMode) {
        tracing::trace!(tag = %tag, ?settlement, "Settled");
        if let Some(position) = self.tracker.settled(tag.partition, tag.offset) {
            self.commit(&[(tag.partition, position)], mode);
        }
    }

    fn commit_positions(&self) {
        let positions = self.tracker.positions();
        if !positions.is_empty() {
            self.commit(&positions, CommitMode::Sync);
        }
    }

    fn commit(&self, positions: &[(i32, i64)], mode: CommitMode) {
        let mut list = TopicPartitionList::new();
        for (partition, position) in positions {
            if let Err(e) = list.add_partition_offset(&self.topic, *partition, Offset::Offset(*position)) {
                tracing::warn!(partition, position, error = %e, "Invalid commit position");
                return;
            }
        }
        if let Err(e) = self.consumer.commit(&list, mode) {
            tracing::warn!(
                topic = %self.topic,
                ?positions,
                error = %e,
                "Failed to commit offsets (messages may be redelivered)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_queue_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaQueue>();
        assert_sync::<RedpandaQueue>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(matches!(
            RedpandaQueue::builder().build(),
            Err(QueueError::ConnectionFailed(_))
        ));
        assert!(RedpandaQueue::builder().brokers("  ").build().is_err());
    }

    #[test]
    fn builder_defaults() {
        let queue = RedpandaQueue::builder().brokers("localhost:9092").build();
        let Ok(queue) = queue else {
            unreachable!("brokers are set");
        };
        assert_eq!(queue.brokers(), "localhost:9092");
        assert_eq!(queue.consumer_group(), "shopflow-consumer");
        assert_eq!(queue.auto_offset_reset, "earliest");
        assert_eq!(queue.session_timeout, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn subscribe_before_connect_fails() {
        let Ok(queue) = RedpandaQueue::new("localhost:9092", "test-group") else {
            unreachable!("brokers are set");
        };
        assert!(matches!(
            queue.subscribe("user.events", 1).await,
            Err(QueueError::SubscriptionFailed { .. })
        ));
    }

    #[test]
    fn settling_after_task_exit_is_closed_error() {
        let (settlements, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let acknowledger = ChannelAcknowledger { settlements };

        let result = acknowledger.settle(DeliveryTag { partition: 0, offset: 1 }, Settlement::Ack);

        assert!(matches!(result, Err(QueueError::Closed(_))));
    }
}
