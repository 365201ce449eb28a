//! Integration tests for the queue consumer: settlement, dead letters,
//! the outstanding-message limit, receive-error backoff and graceful
//! shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use shopflow_core::dead_letter::{DeadLetterQueue, FailureKind};
use shopflow_core::environment::Clock;
use shopflow_core::queue::{MessageQueue, QueueError};
use shopflow_runtime::{ConsumerSummary, EventProcessor, QueueConsumer};
use shopflow_testing::{InMemoryAnalytics, InMemoryDeadLetterQueue, InMemoryQueue, Sink, fixtures, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Fixtures
// ============================================================================

fn consumer(analytics: &InMemoryAnalytics, dead_letters: &InMemoryDeadLetterQueue, prefetch: usize) -> QueueConsumer {
    let clock: Arc<dyn Clock> = Arc::new(test_clock());
    let processor = EventProcessor::new(analytics.as_sinks(), clock.clone());
    QueueConsumer::new(processor, clock, prefetch)
        .with_dead_letters(Arc::new(dead_letters.clone()) as Arc<dyn DeadLetterQueue>)
}

async fn drain(queue: &InMemoryQueue, consumer: &QueueConsumer) -> ConsumerSummary {
    queue.connect().await.unwrap();
    let mut subscription = queue.subscribe("user.events", consumer.prefetch()).await.unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = consumer.run(&mut subscription, shutdown_rx).await;
    subscription.close().await.unwrap();
    summary
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn valid_messages_are_acknowledged() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    let ts = fixtures::at(12, 0, 0);
    let ids = vec![
        queue.publish_json(&fixtures::page_view("u1", &ts)),
        queue.publish_json(&fixtures::product_view("u1", "p1", &ts)),
        queue.publish_json(&fixtures::add_to_cart("u1", "p1", 1, &ts)),
        queue.publish_json(&fixtures::purchase("u1", "p1", 100.0, 2, 0.1, &ts)),
    ];

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 10)).await;

    assert_eq!(
        summary,
        ConsumerSummary {
            received: 4,
            acknowledged: 4,
            discarded: 0,
            settle_failures: 0,
        }
    );
    let mut acked = queue.acked();
    acked.sort();
    assert_eq!(acked, ids);
    assert!(queue.rejected().is_empty());
    assert!(dead_letters.letters().is_empty());
    assert_eq!(analytics.raw_events().len(), 4);
}

#[tokio::test]
async fn malformed_message_is_rejected_and_dead_lettered() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    let bad = queue.publish_json(&fixtures::missing_actor(&fixtures::at(12, 0, 0)));
    let garbage = queue.publish_bytes(b"not json".to_vec());

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 10)).await;

    assert_eq!(summary.discarded, 2);
    assert_eq!(summary.acknowledged, 0);
    let mut rejected = queue.rejected();
    rejected.sort();
    assert_eq!(rejected, vec![bad.clone(), garbage]);
    assert!(analytics.is_untouched());

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 2);
    assert!(letters.iter().all(|letter| letter.kind == FailureKind::Malformed));
    let letter = letters.iter().find(|letter| letter.message_id == bad).unwrap();
    assert_eq!(letter.event_type.as_deref(), Some("page_view"));
    assert_eq!(letter.routing_key.as_deref(), Some("user.page_view"));
    assert!(letter.error_message.contains("actor_id"));
    assert_eq!(letter.failed_step, None);
}

#[tokio::test]
async fn persistence_failure_is_rejected_with_failing_step() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    analytics.fail_on(Sink::SalesLedger);
    let dead_letters = InMemoryDeadLetterQueue::new();
    let id = queue.publish_json(&fixtures::purchase("u7", "p1", 100.0, 2, 0.1, &fixtures::at(12, 0, 0)));

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 10)).await;

    assert_eq!(summary.discarded, 1);
    assert_eq!(queue.rejected(), vec![id.clone()]);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, id);
    assert_eq!(letters[0].kind, FailureKind::Persistence);
    assert_eq!(letters[0].failed_step.as_deref(), Some("sales_ledger"));
    assert_eq!(letters[0].actor_id.as_deref(), Some("u7"));
    assert_eq!(letters[0].event_type.as_deref(), Some("purchase"));
    assert_eq!(letters[0].failed_at, test_clock().now());
}

#[tokio::test]
async fn dead_letter_failure_still_rejects() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    dead_letters.fail_pushes();
    let id = queue.publish_bytes(b"{}".to_vec());

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 10)).await;

    assert_eq!(summary.discarded, 1);
    assert_eq!(queue.rejected(), vec![id]);
}

#[tokio::test]
async fn mixed_batch_settles_every_message_once() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    for i in 0..20 {
        if i % 4 == 0 {
            queue.publish_bytes(b"{\"event_type\":\"page_view\"}".to_vec());
        } else {
            queue.publish_json(&fixtures::page_view(&format!("u{i}"), &fixtures::at(12, 0, 0)));
        }
    }

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 3)).await;

    assert_eq!(summary.received, 20);
    assert_eq!(summary.acknowledged, 15);
    assert_eq!(summary.discarded, 5);
    assert_eq!(queue.settlements().len(), 20);
    assert_eq!(queue.outstanding(), 0);
}

#[tokio::test]
async fn outstanding_messages_never_exceed_prefetch() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    analytics.set_latency(Duration::from_millis(5));
    let dead_letters = InMemoryDeadLetterQueue::new();
    for i in 0..30 {
        queue.publish_json(&fixtures::page_view(&format!("u{i}"), &fixtures::at(12, 0, 0)));
    }

    let summary = drain(&queue, &consumer(&analytics, &dead_letters, 4)).await;

    assert_eq!(summary.acknowledged, 30);
    assert!(queue.max_outstanding() <= 4, "max outstanding {}", queue.max_outstanding());
    assert!(queue.max_outstanding() > 1, "deliveries should overlap");
    assert_eq!(queue.subscribed_prefetch(), Some(4));
}

#[tokio::test]
async fn zero_prefetch_is_treated_as_one() {
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    assert_eq!(consumer(&analytics, &dead_letters, 0).prefetch(), 1);
}

#[tokio::test]
async fn shutdown_stops_pulling_and_drains_in_flight() {
    let queue = InMemoryQueue::new();
    let analytics = InMemoryAnalytics::new();
    analytics.set_latency(Duration::from_millis(50));
    let dead_letters = InMemoryDeadLetterQueue::new();
    for i in 0..2 {
        queue.publish_json(&fixtures::page_view(&format!("u{i}"), &fixtures::at(12, 0, 0)));
    }

    queue.connect().await.unwrap();
    let consumer = consumer(&analytics, &dead_letters, 2);
    let mut subscription = queue.subscribe("user.events", 2).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = async { consumer.run(&mut subscription, shutdown_rx).await };
    let trigger = async {
        // Both deliveries are in flight once the first sink call has begun.
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        // Published after shutdown: must not be pulled.
        queue.publish_json(&fixtures::page_view("late", &fixtures::at(12, 0, 0)));
    };
    let (summary, ()) = tokio::join!(run, trigger);

    assert_eq!(summary.received, 2);
    assert_eq!(summary.acknowledged, 2);
    assert_eq!(queue.outstanding(), 0);
    assert_eq!(analytics.raw_events().len(), 2);
    subscription.close().await.unwrap();
}

#[tokio::test]
async fn shutdown_before_start_pulls_nothing() {
    let queue = InMemoryQueue::new();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    queue.publish_json(&fixtures::page_view("u1", &fixtures::at(12, 0, 0)));

    queue.connect().await.unwrap();
    let mut subscription = queue.subscribe("user.events", 1).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();

    let summary = consumer(&analytics, &dead_letters, 1)
        .run(&mut subscription, shutdown_rx)
        .await;

    assert_eq!(summary, ConsumerSummary::default());
    assert!(queue.settlements().is_empty());
}

#[tokio::test]
async fn receive_errors_back_off_before_the_next_pull() {
    let queue = InMemoryQueue::new().ending_when_drained();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    for _ in 0..3 {
        queue.publish_error(QueueError::Transport("broker unavailable".to_string()));
    }
    let id = queue.publish_json(&fixtures::page_view("u1", &fixtures::at(12, 0, 0)));
    let consumer = consumer(&analytics, &dead_letters, 2).with_error_backoff(Duration::from_millis(40));

    let started = std::time::Instant::now();
    let summary = drain(&queue, &consumer).await;

    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(summary.received, 1);
    assert_eq!(summary.acknowledged, 1);
    assert_eq!(queue.acked(), vec![id]);
}

#[tokio::test]
async fn shutdown_interrupts_receive_error_backoff() {
    let queue = InMemoryQueue::new();
    let analytics = InMemoryAnalytics::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    queue.publish_error(QueueError::Transport("broker unavailable".to_string()));

    queue.connect().await.unwrap();
    let consumer = consumer(&analytics, &dead_letters, 1).with_error_backoff(Duration::from_secs(60));
    let mut subscription = queue.subscribe("user.events", 1).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = async { consumer.run(&mut subscription, shutdown_rx).await };
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
    };
    let (summary, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, trigger) })
        .await
        .expect("shutdown must end the backoff");

    assert_eq!(summary, ConsumerSummary::default());
    subscription.close().await.unwrap();
}
