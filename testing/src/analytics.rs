//! In-memory aggregate sinks.
//!
//! [`InMemoryAnalytics`] implements every sink trait, the stats source and
//! the store lifecycle on plain collections behind one lock, so each
//! mutation is atomic the way the SQL upserts are.
//!
//! Failures can be injected per [`Sink`], and an artificial latency makes
//! concurrent processing overlap in tests.

use crate::mocks::LifecycleLog;
use chrono::{DateTime, NaiveDate, Utc};
use shopflow_core::dead_letter::{DeadLetter, DeadLetterQueue};
use shopflow_core::event::{EventKind, ProductInfo, PurchaseLine, ReceivedEvent, UserEvent};
use shopflow_core::store::{
    AnalyticsSinks, CartAggregator, MetricsAggregator, ProductStatsAggregator, RawEventStore,
    SalesLedger, StatsSnapshot, StatsSource, StoreConnection, StoreError, StoreFuture,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// A sink operation, named like the processing step that calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sink {
    /// `RawEventStore::append`
    RawLog,
    /// `MetricsAggregator::record`
    Metrics,
    /// `ProductStatsAggregator::record_view`
    ProductView,
    /// `SalesLedger::record_sale`
    SalesLedger,
    /// `ProductStatsAggregator::record_purchase`
    ProductPurchase,
    /// `CartAggregator::record_add_to_cart`
    CartActivity,
}

impl Sink {
    /// Name of the sink, matching the processor's step names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RawLog => "raw_log",
            Self::Metrics => "metrics",
            Self::ProductView => "product_view",
            Self::SalesLedger => "sales_ledger",
            Self::ProductPurchase => "product_purchase",
            Self::CartActivity => "cart_activity",
        }
    }
}

/// A raw log row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Message id.
    pub message_id: String,
    /// Validated event.
    pub event: UserEvent,
    /// When it was processed.
    pub processed_at: DateTime<Utc>,
}

/// A minute bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredBucket {
    /// Events in the minute.
    pub total_events: i64,
    /// Page views.
    pub page_views: i64,
    /// Product views.
    pub product_views: i64,
    /// Add-to-carts.
    pub add_to_carts: i64,
    /// Purchases.
    pub purchases: i64,
    /// Revenue.
    pub revenue: f64,
    /// Distinct actors.
    pub unique_actors: BTreeSet<String>,
    /// Last update.
    pub updated_at: Option<DateTime<Utc>>,
}

/// A product's stats for one day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductStat {
    /// Views.
    pub views: i64,
    /// Units purchased.
    pub purchases: i64,
    /// Revenue.
    pub revenue: f64,
    /// Name, last write wins.
    pub name: Option<String>,
    /// Category, last write wins.
    pub category: Option<String>,
    /// Brand, last write wins.
    pub brand: Option<String>,
    /// Price, last write wins.
    pub price: Option<f64>,
    /// Latest view.
    pub last_viewed: Option<DateTime<Utc>>,
    /// Latest purchase.
    pub last_purchased: Option<DateTime<Utc>>,
}

/// An actor's cart activity for one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCart {
    /// Items added.
    pub items_added: i64,
    /// Latest add-to-cart.
    pub last_activity: Option<DateTime<Utc>>,
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSale {
    /// Message id.
    pub message_id: String,
    /// Buyer.
    pub actor_id: String,
    /// Product.
    pub product_id: String,
    /// Quantity.
    pub quantity: i64,
    /// Unit price.
    pub unit_price: f64,
    /// Discount.
    pub discount: f64,
    /// Revenue.
    pub total_amount: f64,
    /// Purchase time.
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    raw_events: Vec<StoredEvent>,
    buckets: BTreeMap<DateTime<Utc>, StoredBucket>,
    products: BTreeMap<(String, NaiveDate), ProductStat>,
    carts: BTreeMap<(String, NaiveDate), StoredCart>,
    sales: Vec<StoredSale>,
    calls: Vec<Sink>,
}

#[derive(Debug, Default)]
struct Faults {
    failing: HashSet<Sink>,
    latency: Option<Duration>,
    connect: Option<StoreError>,
    schema: Option<StoreError>,
    close: Option<StoreError>,
    snapshot: Option<StoreError>,
}

/// Every aggregate sink in memory.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAnalytics {
    state: Arc<RwLock<State>>,
    faults: Arc<RwLock<Faults>>,
    connected: Arc<AtomicBool>,
    dead_letters: InMemoryDeadLetterQueue,
    log: Option<LifecycleLog>,
}

impl InMemoryAnalytics {
    /// Create an empty, disconnected store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `store.connect` and `store.close` in `log`.
    #[must_use]
    pub fn with_lifecycle_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Make every call to `sink` fail with a persistence error.
    pub fn fail_on(&self, sink: Sink) {
        self.faults.write().unwrap().failing.insert(sink);
    }

    /// Stop failing calls to `sink`.
    pub fn recover(&self, sink: Sink) {
        self.faults.write().unwrap().failing.remove(&sink);
    }

    /// Sleep for `latency` at the start of every sink call.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.write().unwrap().latency = Some(latency);
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, error: StoreError) {
        self.faults.write().unwrap().connect = Some(error);
    }

    /// Make `ensure_schema` fail.
    pub fn fail_schema(&self, error: StoreError) {
        self.faults.write().unwrap().schema = Some(error);
    }

    /// Make `close` fail.
    pub fn fail_close(&self, error: StoreError) {
        self.faults.write().unwrap().close = Some(error);
    }

    /// Make `snapshot` fail.
    pub fn fail_snapshot(&self, error: StoreError) {
        self.faults.write().unwrap().snapshot = Some(error);
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sinks backed by this store, regardless of connection state.
    #[must_use]
    pub fn as_sinks(&self) -> AnalyticsSinks {
        AnalyticsSinks::from_backend(&Arc::new(self.clone()))
    }

    /// Dead letters captured by this store.
    #[must_use]
    pub fn dead_letter_queue(&self) -> &InMemoryDeadLetterQueue {
        &self.dead_letters
    }

    /// Raw log rows in append order.
    #[must_use]
    pub fn raw_events(&self) -> Vec<StoredEvent> {
        self.state.read().unwrap().raw_events.clone()
    }

    /// Bucket for the minute starting at `window_start`.
    #[must_use]
    pub fn bucket(&self, window_start: DateTime<Utc>) -> Option<StoredBucket> {
        self.state.read().unwrap().buckets.get(&window_start).cloned()
    }

    /// All buckets by window start.
    #[must_use]
    pub fn buckets(&self) -> BTreeMap<DateTime<Utc>, StoredBucket> {
        self.state.read().unwrap().buckets.clone()
    }

    /// Stats for a product on a day.
    #[must_use]
    pub fn product_stat(&self, product_id: &str, date: NaiveDate) -> Option<ProductStat> {
        self.state
            .read()
            .unwrap()
            .products
            .get(&(product_id.to_string(), date))
            .cloned()
    }

    /// Cart activity for an actor on a day.
    #[must_use]
    pub fn cart(&self, actor_id: &str, date: NaiveDate) -> Option<StoredCart> {
        self.state
            .read()
            .unwrap()
            .carts
            .get(&(actor_id.to_string(), date))
            .cloned()
    }

    /// Ledger rows in insert order.
    #[must_use]
    pub fn sales(&self) -> Vec<StoredSale> {
        self.state.read().unwrap().sales.clone()
    }

    /// Every sink call so far, in call order, including failed ones.
    #[must_use]
    pub fn calls(&self) -> Vec<Sink> {
        self.state.read().unwrap().calls.clone()
    }

    /// Whether no sink has been called at all.
    #[must_use]
    pub fn is_untouched(&self) -> bool {
        self.state.read().unwrap().calls.is_empty()
    }

    async fn enter(&self, sink: Sink) -> Result<(), StoreError> {
        let latency = self.faults.read().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.write().unwrap().calls.push(sink);
        if self.faults.read().unwrap().failing.contains(&sink) {
            return Err(StoreError::Persistence(format!("{} unavailable", sink.as_str())));
        }
        Ok(())
    }
}

impl RawEventStore for InMemoryAnalytics {
    fn append<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        processed_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::RawLog).await?;
            self.state.write().unwrap().raw_events.push(StoredEvent {
                message_id: received.message_id.clone(),
                event: received.event.clone(),
                processed_at,
            });
            Ok(())
        })
    }
}

impl MetricsAggregator for InMemoryAnalytics {
    fn record<'a>(
        &'a self,
        event: &'a UserEvent,
        revenue: f64,
        updated_at: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::Metrics).await?;
            let mut state = self.state.write().unwrap();
            let bucket = state.buckets.entry(event.window_start()).or_default();
            bucket.total_events += 1;
            match event.kind() {
                EventKind::PageView => bucket.page_views += 1,
                EventKind::ProductView => bucket.product_views += 1,
                EventKind::AddToCart => bucket.add_to_carts += 1,
                EventKind::Purchase => bucket.purchases += 1,
            }
            bucket.revenue += revenue;
            bucket.unique_actors.insert(event.actor_id.clone());
            bucket.updated_at = Some(updated_at);
            Ok(())
        })
    }
}

impl ProductStatsAggregator for InMemoryAnalytics {
    fn record_view<'a>(
        &'a self,
        event: &'a UserEvent,
        product: &'a ProductInfo,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::ProductView).await?;
            let mut state = self.state.write().unwrap();
            let stat = state
                .products
                .entry((product.product_id.clone(), event.calendar_date()))
                .or_default();
            stat.views += 1;
            stat.name.clone_from(&product.name);
            stat.category.clone_from(&product.category);
            stat.brand.clone_from(&product.brand);
            stat.price = product.price;
            stat.last_viewed = Some(event.occurred_at);
            Ok(())
        })
    }

    fn record_purchase<'a>(
        &'a self,
        event: &'a UserEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::ProductPurchase).await?;
            let mut state = self.state.write().unwrap();
            let stat = state
                .products
                .entry((line.product.product_id.clone(), event.calendar_date()))
                .or_default();
            stat.purchases += line.quantity;
            stat.revenue += revenue;
            stat.last_purchased = Some(event.occurred_at);
            Ok(())
        })
    }
}

impl CartAggregator for InMemoryAnalytics {
    fn record_add_to_cart<'a>(&'a self, event: &'a UserEvent, quantity: i64) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::CartActivity).await?;
            let mut state = self.state.write().unwrap();
            let cart = state
                .carts
                .entry((event.actor_id.clone(), event.calendar_date()))
                .or_default();
            cart.items_added += quantity;
            cart.last_activity = Some(event.occurred_at);
            Ok(())
        })
    }
}

impl SalesLedger for InMemoryAnalytics {
    fn record_sale<'a>(
        &'a self,
        received: &'a ReceivedEvent,
        line: &'a PurchaseLine,
        revenue: f64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Sink::SalesLedger).await?;
            self.state.write().unwrap().sales.push(StoredSale {
                message_id: received.message_id.clone(),
                actor_id: received.event.actor_id.clone(),
                product_id: line.product.product_id.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                discount: line.discount,
                total_amount: revenue,
                occurred_at: received.event.occurred_at,
            });
            Ok(())
        })
    }
}

impl StatsSource for InMemoryAnalytics {
    fn snapshot(&self) -> StoreFuture<'_, StatsSnapshot> {
        Box::pin(async move {
            if let Some(error) = self.faults.read().unwrap().snapshot.clone() {
                return Err(error);
            }
            let state = self.state.read().unwrap();
            Ok(StatsSnapshot {
                total_events: i64::try_from(state.raw_events.len()).unwrap_or(i64::MAX),
                total_sales: i64::try_from(state.sales.len()).unwrap_or(i64::MAX),
                total_revenue: state.sales.iter().map(|sale| sale.total_amount).sum(),
            })
        })
    }
}

impl StoreConnection for InMemoryAnalytics {
    fn connect(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if let Some(log) = &self.log {
                log.record("store.connect");
            }
            if let Some(error) = self.faults.read().unwrap().connect.clone() {
                return Err(error);
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn ensure_schema(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if let Some(log) = &self.log {
                log.record("store.ensure_schema");
            }
            match self.faults.read().unwrap().schema.clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    fn sinks(&self) -> Result<AnalyticsSinks, StoreError> {
        if self.is_connected() {
            Ok(self.as_sinks())
        } else {
            Err(StoreError::Connection("store is not connected".to_string()))
        }
    }

    fn dead_letters(&self) -> Result<Option<Arc<dyn DeadLetterQueue>>, StoreError> {
        if self.is_connected() {
            Ok(Some(Arc::new(self.dead_letters.clone())))
        } else {
            Err(StoreError::Connection("store is not connected".to_string()))
        }
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if let Some(log) = &self.log {
                log.record("store.close");
            }
            self.connected.store(false, Ordering::SeqCst);
            match self.faults.read().unwrap().close.clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }
}

/// Dead letters captured in memory.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push fail.
    pub fn fail_pushes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Letters in push order.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

impl DeadLetterQueue for InMemoryDeadLetterQueue {
    fn push<'a>(&'a self, letter: &'a DeadLetter) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Persistence("dead-letter table unavailable".to_string()));
            }
            let mut letters = self.letters.lock().unwrap();
            letters.push(letter.clone());
            Ok(i64::try_from(letters.len()).unwrap_or(i64::MAX))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use shopflow_core::event::decode;

    fn received(message_id: &str, envelope: &serde_json::Value) -> ReceivedEvent {
        ReceivedEvent {
            message_id: message_id.to_string(),
            event: decode(envelope.to_string().as_bytes()).unwrap(),
        }
    }

    #[tokio::test]
    async fn sinks_require_connection() {
        let analytics = InMemoryAnalytics::new();
        assert!(analytics.sinks().is_err());

        analytics.connect().await.unwrap();
        assert!(analytics.sinks().is_ok());

        analytics.close().await.unwrap();
        assert!(analytics.sinks().is_err());
    }

    #[tokio::test]
    async fn injected_failure_is_reported_and_logged() {
        let analytics = InMemoryAnalytics::new();
        analytics.fail_on(Sink::RawLog);
        let event = received("m1", &fixtures::page_view("u1", &fixtures::at(12, 0, 0)));

        let result = analytics.append(&event, Utc::now()).await;

        assert!(matches!(result, Err(StoreError::Persistence(_))));
        assert!(analytics.raw_events().is_empty());
        assert_eq!(analytics.calls(), vec![Sink::RawLog]);
    }

    #[tokio::test]
    async fn snapshot_sums_the_ledger() {
        let analytics = InMemoryAnalytics::new();
        let event = received(
            "m1",
            &fixtures::purchase("u1", "p1", 100.0, 2, 0.1, &fixtures::at(12, 0, 0)),
        );
        let shopflow_core::event::EventDetails::Purchase(line) = &event.event.details else {
            unreachable!("fixture is a purchase");
        };

        analytics.append(&event, Utc::now()).await.unwrap();
        analytics.record_sale(&event, line, 180.0).await.unwrap();

        let snapshot = analytics.snapshot().await.unwrap();
        assert_eq!(snapshot.total_events, 1);
        assert_eq!(snapshot.total_sales, 1);
        assert!((snapshot.total_revenue - 180.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dead_letter_push_can_fail() {
        let queue = InMemoryDeadLetterQueue::new();
        queue.fail_pushes();
        let letter = DeadLetter {
            message_id: "m1".to_string(),
            routing_key: None,
            payload: b"{}".to_vec(),
            headers: std::collections::BTreeMap::new(),
            kind: shopflow_core::dead_letter::FailureKind::Malformed,
            error_message: "bad".to_string(),
            actor_id: None,
            event_type: None,
            failed_step: None,
            failed_at: Utc::now(),
        };
        assert!(queue.push(&letter).await.is_err());
        assert!(queue.letters().is_empty());
    }
}
