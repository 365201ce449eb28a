//! Pull loop over a [`Subscription`] with a bound on outstanding messages.
//!
//! A permit from a semaphore of size `prefetch` is taken before each pull and
//! held by the delivery's task until the delivery is settled, so at most
//! `prefetch` messages are ever in flight. Deliveries are processed
//! concurrently and complete in any order.
//!
//! Settlement:
//!
//! - processed → [`Delivery::ack`]
//! - malformed or failed → dead letter, then [`Delivery::reject`] (no requeue)
//!
//! A receive error from the subscription is logged and the next pull waits
//! for [`RECEIVE_ERROR_BACKOFF`] (or the configured backoff) first.
//!
//! When the shutdown signal fires the loop stops pulling, waits for every
//! in-flight delivery to settle and returns a [`ConsumerSummary`].

use crate::metrics::ConsumerMetrics;
use crate::processor::{EventProcessor, ProcessError};
use shopflow_core::dead_letter::{DeadLetter, DeadLetterQueue, FailureKind};
use shopflow_core::environment::Clock;
use shopflow_core::queue::{Delivery, Subscription};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;

/// Pause before pulling again after the subscription yields an error.
pub const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Counts reported when a consumer run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Deliveries pulled from the subscription.
    pub received: u64,
    /// Deliveries acknowledged.
    pub acknowledged: u64,
    /// Deliveries rejected without requeue.
    pub discarded: u64,
    /// Settlements the queue refused.
    pub settle_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    discarded: AtomicU64,
    settle_failures: AtomicU64,
}

impl Counters {
    fn summary(&self) -> ConsumerSummary {
        ConsumerSummary {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

struct DeliveryHandler {
    processor: EventProcessor,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

/// Consumes a subscription through an [`EventProcessor`].
pub struct QueueConsumer {
    processor: EventProcessor,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    clock: Arc<dyn Clock>,
    prefetch: usize,
    error_backoff: Duration,
}

impl QueueConsumer {
    /// Create a consumer with at most `prefetch` outstanding deliveries.
    ///
    /// A `prefetch` of zero is treated as one.
    #[must_use]
    pub fn new(processor: EventProcessor, clock: Arc<dyn Clock>, prefetch: usize) -> Self {
        Self {
            processor,
            dead_letters: None,
            clock,
            prefetch: prefetch.max(1),
            error_backoff: RECEIVE_ERROR_BACKOFF,
        }
    }

    /// Wait `backoff` before pulling again after a receive error.
    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Record failed deliveries in `dead_letters` before rejecting them.
    #[must_use]
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Outstanding-message limit.
    #[must_use]
    pub const fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Consume until the subscription ends or `shutdown` becomes `true`.
    ///
    /// Dropping the shutdown sender also stops the loop. In-flight
    /// deliveries are always settled before this returns.
    pub async fn run(
        &self,
        subscription: &mut Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerSummary {
        let handler = Arc::new(DeliveryHandler {
            processor: self.processor.clone(),
            dead_letters: self.dead_letters.clone(),
            clock: self.clock.clone(),
            counters: Counters::default(),
        });
        let permits = Arc::new(Semaphore::new(self.prefetch));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            queue = %subscription.queue(),
            prefetch = self.prefetch,
            "Consumer started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join_failure(joined);
            }

            if *shutdown.borrow_and_update() {
                break;
            }

            let permit = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                },
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                },
                next = subscription.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(error)) => {
                        tracing::warn!(
                            error = %error,
                            backoff_ms = u64::try_from(self.error_backoff.as_millis()).unwrap_or(u64::MAX),
                            "Subscription error"
                        );
                        drop(permit);
                        tokio::select! {
                            biased;
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            },
                            () = tokio::time::sleep(self.error_backoff) => {},
                        }
                        continue;
                    },
                    None => {
                        tracing::info!(queue = %subscription.queue(), "Subscription ended");
                        break;
                    },
                },
            };

            handler.counters.received.fetch_add(1, Ordering::Relaxed);
            ConsumerMetrics::record_received();

            let handler = handler.clone();
            in_flight.spawn(async move { handler.handle(delivery, permit).await });
        }

        let pending = in_flight.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join_failure(joined);
        }

        let summary = handler.counters.summary();
        tracing::info!(
            received = summary.received,
            acknowledged = summary.acknowledged,
            discarded = summary.discarded,
            settle_failures = summary.settle_failures,
            "Consumer stopped"
        );
        summary
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Delivery task failed");
    }
}

impl DeliveryHandler {
    async fn handle(&self, delivery: Delivery, _permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        let outcome = self
            .processor
            .process_message(&delivery.message_id, &delivery.payload)
            .await;

        match outcome {
            Ok(received) => {
                let tag = delivery.tag;
                match delivery.ack() {
                    Ok(()) => {
                        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                        ConsumerMetrics::record_acked(received.event.kind(), started.elapsed());
                    },
                    Err(e) => {
                        self.counters.settle_failures.fetch_add(1, Ordering::Relaxed);
                        ConsumerMetrics::record_settle_failure();
                        tracing::warn!(
                            tag = %tag,
                            message_id = %received.message_id,
                            error = %e,
                            "Failed to acknowledge message"
                        );
                    },
                }
            },
            Err(error) => self.discard(delivery, &error).await,
        }
    }

    async fn discard(&self, delivery: Delivery, error: &ProcessError) {
        let letter = self.dead_letter(&delivery, error);
        let (kind, reason) = match error {
            ProcessError::Malformed(_) => (FailureKind::Malformed, "malformed"),
            ProcessError::Persistence { .. } => (FailureKind::Persistence, "persistence"),
        };

        tracing::error!(
            message_id = %delivery.message_id,
            tag = %delivery.tag,
            kind = letter.event_type.as_deref().unwrap_or("unknown"),
            actor_id = letter.actor_id.as_deref().unwrap_or("unknown"),
            failure = kind.as_str(),
            error = %error,
            "Discarding message"
        );

        if let Some(dead_letters) = &self.dead_letters {
            if let Err(e) = dead_letters.push(&letter).await {
                tracing::error!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Failed to record dead letter"
                );
            }
        }

        let tag = delivery.tag;
        match delivery.reject() {
            Ok(()) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_discarded(reason);
            },
            Err(e) => {
                self.counters.settle_failures.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_settle_failure();
                tracing::warn!(tag = %tag, error = %e, "Failed to reject message");
            },
        }
    }

    fn dead_letter(&self, delivery: &Delivery, error: &ProcessError) -> DeadLetter {
        let (kind, actor_id, event_type, failed_step) = match error {
            ProcessError::Malformed(_) => (
                FailureKind::Malformed,
                delivery
                    .header("actor_id")
                    .or_else(|| delivery.header("user_id"))
                    .map(str::to_string),
                delivery.header("event_type").map(str::to_string),
                None,
            ),
            ProcessError::Persistence {
                step,
                kind,
                actor_id,
                ..
            } => (
                FailureKind::Persistence,
                Some(actor_id.clone()),
                Some(kind.as_str().to_string()),
                Some(step.as_str().to_string()),
            ),
        };

        DeadLetter {
            message_id: delivery.message_id.clone(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload.clone(),
            headers: delivery.headers.clone(),
            kind,
            error_message: error.to_string(),
            actor_id,
            event_type,
            failed_step,
            failed_at: self.clock.now(),
        }
    }
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("prefetch", &self.prefetch)
            .field("error_backoff", &self.error_backoff)
            .field("dead_letters", &self.dead_letters.is_some())
            .finish_non_exhaustive()
    }
}
