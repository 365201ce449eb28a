//! In-memory message queue.
//!
//! Messages published before `subscribe` are buffered and delivered first.
//! Every settlement is recorded, and the number of delivered but unsettled
//! messages is tracked so tests can assert on the outstanding limit.
//! Receive errors can be queued between messages with
//! [`InMemoryQueue::publish_error`].

use crate::mocks::LifecycleLog;
use futures::StreamExt;
use shopflow_core::queue::{
    Acknowledger, Delivery, DeliveryTag, MessageQueue, QueueError, QueueFuture, Settlement,
    Subscription,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
struct Message {
    message_id: String,
    routing_key: Option<String>,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
}

type Entry = Result<Message, QueueError>;

#[derive(Debug, Default)]
struct Shared {
    backlog: Mutex<Vec<Entry>>,
    live: Mutex<Option<mpsc::UnboundedSender<Entry>>>,
    in_flight: Mutex<HashMap<DeliveryTag, String>>,
    settlements: Mutex<Vec<(String, Settlement)>>,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    next_offset: AtomicI64,
    next_id: AtomicUsize,
    connected: AtomicBool,
    end_when_drained: AtomicBool,
    connect_failure: Mutex<Option<QueueError>>,
    close_failure: Mutex<Option<QueueError>>,
    subscribe_prefetch: Mutex<Option<usize>>,
}

impl Acknowledger for Shared {
    fn settle(&self, tag: DeliveryTag, settlement: Settlement) -> Result<(), QueueError> {
        let message_id = self.in_flight.lock().unwrap().remove(&tag).ok_or_else(|| {
            QueueError::Acknowledge {
                tag,
                reason: "unknown or already settled delivery".to_string(),
            }
        })?;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.settlements.lock().unwrap().push((message_id, settlement));
        Ok(())
    }
}

/// Message queue backed by an in-process channel.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
    log: Option<LifecycleLog>,
}

impl InMemoryQueue {
    /// Create an empty queue whose subscriptions stay open until closed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// End subscriptions once every message published so far is delivered.
    #[must_use]
    pub fn ending_when_drained(self) -> Self {
        self.shared.end_when_drained.store(true, Ordering::SeqCst);
        self
    }

    /// Record `queue.*` lifecycle calls in `log`.
    #[must_use]
    pub fn with_lifecycle_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, error: QueueError) {
        *self.shared.connect_failure.lock().unwrap() = Some(error);
    }

    /// Make `close` fail.
    pub fn fail_close(&self, error: QueueError) {
        *self.shared.close_failure.lock().unwrap() = Some(error);
    }

    /// Publish a message with an explicit id and headers.
    pub fn publish_with(
        &self,
        message_id: impl Into<String>,
        routing_key: Option<String>,
        headers: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) {
        self.push(Ok(Message {
            message_id: message_id.into(),
            routing_key,
            headers,
            payload,
        }));
    }

    /// Make the subscription yield `error` at this point in the stream.
    pub fn publish_error(&self, error: QueueError) {
        self.push(Err(error));
    }

    fn push(&self, entry: Entry) {
        let live = self.shared.live.lock().unwrap();
        match live.as_ref() {
            Some(sender) if sender.send(entry.clone()).is_ok() => {},
            _ => self.shared.backlog.lock().unwrap().push(entry),
        }
    }

    /// Publish a raw body under a generated id (`msg-0`, `msg-1`, ...).
    pub fn publish_bytes(&self, payload: impl Into<Vec<u8>>) -> String {
        let message_id = format!("msg-{}", self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.publish_with(message_id.clone(), None, BTreeMap::new(), payload.into());
        message_id
    }

    /// Publish a JSON envelope under a generated id, with the producer's
    /// routing key and `event_type` / `actor_id` headers when present.
    pub fn publish_json(&self, envelope: &serde_json::Value) -> String {
        let message_id = format!("msg-{}", self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let mut headers = BTreeMap::new();
        let event_type = envelope.get("event_type").and_then(serde_json::Value::as_str);
        if let Some(event_type) = event_type {
            headers.insert("event_type".to_string(), event_type.to_string());
        }
        if let Some(actor_id) = envelope.get("actor_id").and_then(serde_json::Value::as_str) {
            headers.insert("actor_id".to_string(), actor_id.to_string());
        }
        headers.insert("version".to_string(), "1.0".to_string());
        self.publish_with(
            message_id.clone(),
            event_type.map(|kind| format!("user.{kind}")),
            headers,
            envelope.to_string().into_bytes(),
        );
        message_id
    }

    /// Whether `connect` succeeded and `close` has not run.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Prefetch passed to the last `subscribe`.
    #[must_use]
    pub fn subscribed_prefetch(&self) -> Option<usize> {
        *self.shared.subscribe_prefetch.lock().unwrap()
    }

    /// Every settlement in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<(String, Settlement)> {
        self.shared.settlements.lock().unwrap().clone()
    }

    /// Ids of acknowledged messages.
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.settled_with(Settlement::Ack)
    }

    /// Ids of rejected messages.
    #[must_use]
    pub fn rejected(&self) -> Vec<String> {
        self.settled_with(Settlement::Reject)
    }

    /// Delivered messages not yet settled.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of delivered but unsettled messages seen so far.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.shared.max_outstanding.load(Ordering::SeqCst)
    }

    fn settled_with(&self, wanted: Settlement) -> Vec<String> {
        self.shared
            .settlements
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, settlement)| *settlement == wanted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn record(&self, entry: &str) {
        if let Some(log) = &self.log {
            log.record(entry);
        }
    }
}

impl MessageQueue for InMemoryQueue {
    fn connect(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.record("queue.connect");
            if let Some(error) = self.shared.connect_failure.lock().unwrap().clone() {
                return Err(error);
            }
            self.shared.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, queue: &'a str, prefetch: usize) -> QueueFuture<'a, Subscription> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(QueueError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: "not connected".to_string(),
                });
            }
            *self.shared.subscribe_prefetch.lock().unwrap() = Some(prefetch);

            let (sender, mut receiver) = mpsc::unbounded_channel();
            {
                let mut live = self.shared.live.lock().unwrap();
                for entry in self.shared.backlog.lock().unwrap().drain(..) {
                    // The receiver is held right here.
                    let _ = sender.send(entry);
                }
                if !self.shared.end_when_drained.load(Ordering::SeqCst) {
                    *live = Some(sender);
                }
            }

            let shared = self.shared.clone();
            let stream = async_stream::stream! {
                while let Some(entry) = receiver.recv().await {
                    let message = match entry {
                        Ok(message) => message,
                        Err(error) => {
                            yield Err(error);
                            continue;
                        },
                    };
                    let tag = DeliveryTag {
                        partition: 0,
                        offset: shared.next_offset.fetch_add(1, Ordering::SeqCst),
                    };
                    shared.in_flight.lock().unwrap().insert(tag, message.message_id.clone());
                    let outstanding = shared.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    shared.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);

                    let mut delivery = Delivery::new(
                        tag,
                        message.message_id,
                        message.payload,
                        shared.clone() as Arc<dyn Acknowledger>,
                    )
                    .with_headers(message.headers);
                    if let Some(routing_key) = message.routing_key {
                        delivery = delivery.with_routing_key(routing_key);
                    }
                    yield Ok(delivery);
                }
            };

            let (stop, stopped) = oneshot::channel::<()>();
            let log = self.log.clone();
            let task = tokio::spawn(async move {
                let _ = stopped.await;
                if let Some(log) = log {
                    log.record("subscription.close");
                }
            });

            Ok(Subscription::new(queue, stream.boxed()).with_task(stop, task))
        })
    }

    fn close(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.record("queue.close");
            self.shared.live.lock().unwrap().take();
            self.shared.connected.store(false, Ordering::SeqCst);
            match self.shared.close_failure.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }
}
