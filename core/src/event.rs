//! E-commerce interaction events and their validation.
//!
//! Messages arrive as loosely-shaped JSON envelopes. [`decode`] parses the
//! envelope and validates it exactly once, producing a [`UserEvent`] whose
//! [`EventDetails`] variant carries only the fields its kind requires. Every
//! downstream component works on the typed event and never re-checks shape.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "actor_id": "user_1234",
//!   "session_id": "sess_ab12cd34",
//!   "event_type": "purchase",
//!   "timestamp": "2024-03-01T12:00:59Z",
//!   "data": { "product_id": "p1", "price": 100.0, "quantity": 2, "discount": 0.1 },
//!   "metadata": { "device_type": "mobile" }
//! }
//! ```
//!
//! The legacy field name `user_id` is accepted in place of `actor_id`.
//!
//! # Example
//!
//! ```
//! use shopflow_core::event::{decode, EventKind};
//!
//! let bytes = br#"{
//!     "actor_id": "user_1",
//!     "event_type": "purchase",
//!     "timestamp": "2024-03-01T12:00:59Z",
//!     "data": { "product_id": "p1", "price": 100.0, "quantity": 2, "discount": 0.1 }
//! }"#;
//!
//! let event = decode(bytes).unwrap();
//! assert_eq!(event.kind(), EventKind::Purchase);
//! assert!((event.revenue() - 180.0).abs() < 1e-9);
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while turning a message body into a [`UserEvent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The body is not a JSON envelope.
    #[error("Failed to decode event: {0}")]
    Decode(String),

    /// The envelope decoded but lacks a required field or carries an invalid value.
    #[error("Malformed event: {0}")]
    Malformed(String),
}

/// The closed set of interaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A page was rendered.
    PageView,
    /// A product detail page was viewed.
    ProductView,
    /// Items were added to a cart.
    AddToCart,
    /// A purchase was completed.
    Purchase,
}

impl EventKind {
    /// Every kind, in wire order.
    pub const ALL: [Self; 4] = [
        Self::PageView,
        Self::ProductView,
        Self::AddToCart,
        Self::Purchase,
    ];

    /// Wire name of the kind (`page_view`, `product_view`, ...).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::ProductView => "product_view",
            Self::AddToCart => "add_to_cart",
            Self::Purchase => "purchase",
        }
    }

    /// Routing key producers attach to events of this kind.
    #[must_use]
    pub fn routing_key(&self) -> String {
        format!("user.{}", self.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::Malformed(format!("unknown event_type '{s}'")))
    }
}

/// Typed view of the payload fields the pipeline understands.
///
/// Unknown keys are ignored here; the untouched object is kept in
/// [`UserEvent::data`]. Aggregation reads the validated [`EventDetails`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Product identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    /// Product display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Product category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Product brand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Unit price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Item quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    /// Discount fraction in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
    /// Page path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
}

/// Denormalized product descriptors carried by views and purchases.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductInfo {
    /// Product identifier.
    pub product_id: String,
    /// Display name.
    pub name: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// Brand.
    pub brand: Option<String>,
    /// Listed unit price.
    pub price: Option<f64>,
}

/// A validated purchase line.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseLine {
    /// The purchased product.
    pub product: ProductInfo,
    /// Unit price, non-negative.
    pub unit_price: f64,
    /// Quantity, non-negative.
    pub quantity: i64,
    /// Discount fraction in `[0, 1]`; `0` when absent on the wire.
    pub discount: f64,
}

impl PurchaseLine {
    /// Revenue of the line: `unit_price * quantity * (1 - discount)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // quantities are small
    pub fn revenue(&self) -> f64 {
        self.unit_price * self.quantity as f64 * (1.0 - self.discount)
    }
}

/// Per-kind view of an event, holding exactly what that kind needs.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetails {
    /// Page view.
    PageView {
        /// Page path, if sent.
        page_url: Option<String>,
    },
    /// Product view.
    ProductView(ProductInfo),
    /// Add to cart.
    AddToCart {
        /// Product added, if identified.
        product: Option<ProductInfo>,
        /// Number of items added.
        quantity: i64,
    },
    /// Purchase.
    Purchase(PurchaseLine),
}

/// A validated interaction event.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    /// Subject of the event.
    pub actor_id: String,
    /// Browsing session, if sent.
    pub session_id: Option<String>,
    /// When the interaction happened, as reported by the producer.
    pub occurred_at: DateTime<Utc>,
    /// The `data` object exactly as received, including keys not modelled
    /// by [`EventPayload`]. Persisted to the raw log.
    pub data: serde_json::Value,
    /// Typed payload fields.
    pub payload: EventPayload,
    /// Client, network and geo information. Opaque to aggregation.
    pub metadata: serde_json::Value,
    /// Validated per-kind details.
    pub details: EventDetails,
}

impl UserEvent {
    /// Kind of the event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self.details {
            EventDetails::PageView { .. } => EventKind::PageView,
            EventDetails::ProductView(_) => EventKind::ProductView,
            EventDetails::AddToCart { .. } => EventKind::AddToCart,
            EventDetails::Purchase(_) => EventKind::Purchase,
        }
    }

    /// Start of the one-minute window this event belongs to.
    #[must_use]
    pub fn window_start(&self) -> DateTime<Utc> {
        window_start(self.occurred_at)
    }

    /// UTC calendar date of the event.
    #[must_use]
    pub fn calendar_date(&self) -> NaiveDate {
        calendar_date(self.occurred_at)
    }

    /// Revenue the event contributes: the purchase revenue, or `0.0`.
    #[must_use]
    pub fn revenue(&self) -> f64 {
        match &self.details {
            EventDetails::Purchase(line) => line.revenue(),
            _ => 0.0,
        }
    }
}

/// A validated event together with the transport identifier it arrived under.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// Message identifier assigned by the producer or derived from the queue position.
    pub message_id: String,
    /// The event.
    pub event: UserEvent,
}

/// Truncate an instant to the start of its minute.
#[must_use]
pub fn window_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(at)
}

/// UTC calendar date of an instant.
#[must_use]
pub fn calendar_date(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// Envelope as it appears on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEnvelope {
    /// Actor identifier.
    #[serde(default, alias = "user_id")]
    pub actor_id: Option<String>,
    /// Session identifier.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Event kind name.
    #[serde(default)]
    pub event_type: Option<String>,
    /// ISO-8601 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Kind-dependent payload.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RawEnvelope {
    /// Validate the envelope into a [`UserEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] when `actor_id`, `event_type` or
    /// `data` is absent or empty, the kind is unknown, the timestamp is
    /// missing or unparsable, or the payload misses a field its kind needs.
    pub fn validate(self) -> Result<UserEvent, EventError> {
        let actor_id = non_empty(self.actor_id).ok_or_else(|| missing("actor_id"))?;
        let kind: EventKind = non_empty(self.event_type)
            .ok_or_else(|| missing("event_type"))?
            .parse()?;

        let data = match self.data {
            Some(serde_json::Value::Object(map)) if !map.is_empty() => map,
            Some(serde_json::Value::Object(_) | serde_json::Value::Null) | None => {
                return Err(missing("data"));
            }
            Some(_) => return Err(EventError::Malformed("data must be an object".to_string())),
        };
        let data = serde_json::Value::Object(data);
        let payload = EventPayload::deserialize(&data)
            .map_err(|e| EventError::Malformed(format!("invalid data: {e}")))?;

        let raw_timestamp = non_empty(self.timestamp).ok_or_else(|| missing("timestamp"))?;
        let occurred_at = DateTime::parse_from_rfc3339(&raw_timestamp)
            .map_err(|e| EventError::Malformed(format!("invalid timestamp '{raw_timestamp}': {e}")))?
            .with_timezone(&Utc);

        let details = details_for(kind, &payload)?;

        Ok(UserEvent {
            actor_id,
            session_id: non_empty(self.session_id),
            occurred_at,
            data,
            payload,
            metadata: self.metadata,
            details,
        })
    }
}

/// Decode and validate a message body.
///
/// # Errors
///
/// Returns [`EventError::Decode`] if the body is not a JSON object, or
/// [`EventError::Malformed`] if validation fails.
pub fn decode(bytes: &[u8]) -> Result<UserEvent, EventError> {
    let envelope: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|e| EventError::Decode(e.to_string()))?;
    envelope.validate()
}

fn details_for(kind: EventKind, payload: &EventPayload) -> Result<EventDetails, EventError> {
    if let Some(price) = payload.price {
        if !price.is_finite() || price < 0.0 {
            return Err(EventError::Malformed(format!("price must be non-negative, got {price}")));
        }
    }
    if let Some(quantity) = payload.quantity {
        if quantity < 0 {
            return Err(EventError::Malformed(format!(
                "quantity must be non-negative, got {quantity}"
            )));
        }
    }
    if let Some(discount) = payload.discount {
        if !(0.0..=1.0).contains(&discount) {
            return Err(EventError::Malformed(format!(
                "discount must be within [0, 1], got {discount}"
            )));
        }
    }

    let details = match kind {
        EventKind::PageView => EventDetails::PageView {
            page_url: payload.page_url.clone(),
        },
        EventKind::ProductView => EventDetails::ProductView(
            product_info(payload).ok_or_else(|| missing("data.product_id"))?,
        ),
        EventKind::AddToCart => EventDetails::AddToCart {
            product: product_info(payload),
            quantity: payload.quantity.ok_or_else(|| missing("data.quantity"))?,
        },
        EventKind::Purchase => EventDetails::Purchase(PurchaseLine {
            product: product_info(payload).ok_or_else(|| missing("data.product_id"))?,
            unit_price: payload.price.ok_or_else(|| missing("data.price"))?,
            quantity: payload.quantity.ok_or_else(|| missing("data.quantity"))?,
            discount: payload.discount.unwrap_or(0.0),
        }),
    };
    Ok(details)
}

fn product_info(payload: &EventPayload) -> Option<ProductInfo> {
    let product_id = non_empty(payload.product_id.clone())?;
    Some(ProductInfo {
        product_id,
        name: payload.product_name.clone(),
        category: payload.category.clone(),
        brand: payload.brand.clone(),
        price: payload.price,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn missing(field: &str) -> EventError {
    EventError::Malformed(format!("missing or empty {field}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn purchase_json() -> serde_json::Value {
        json!({
            "actor_id": "user_1",
            "session_id": "sess_1",
            "event_type": "purchase",
            "timestamp": "2024-03-01T12:00:59Z",
            "data": {
                "product_id": "p1",
                "product_name": "Headphones",
                "category": "electronics",
                "brand": "Sony",
                "price": 100.0,
                "quantity": 2,
                "discount": 0.1
            },
            "metadata": { "device_type": "mobile" }
        })
    }

    #[test]
    fn decodes_purchase_into_typed_line() {
        let event = decode(&envelope(purchase_json())).unwrap();

        assert_eq!(event.kind(), EventKind::Purchase);
        assert_eq!(event.actor_id, "user_1");
        assert_eq!(event.session_id.as_deref(), Some("sess_1"));
        let EventDetails::Purchase(line) = &event.details else {
            panic!("expected purchase details");
        };
        assert_eq!(line.product.product_id, "p1");
        assert_eq!(line.quantity, 2);
        assert!((line.revenue() - 180.0).abs() < 1e-9);
        assert_eq!(event.metadata["device_type"], "mobile");
    }

    #[test]
    fn keeps_unmodelled_data_keys_verbatim() {
        let mut value = purchase_json();
        value["data"]["color"] = json!("red");
        value["data"]["variant"] = json!({ "size": "L" });

        let event = decode(&envelope(value.clone())).unwrap();

        assert_eq!(event.data, value["data"]);
        assert_eq!(event.payload.product_id.as_deref(), Some("p1"));
    }

    #[test]
    fn accepts_user_id_alias() {
        let mut value = purchase_json();
        let obj = value.as_object_mut().unwrap();
        obj.remove("actor_id");
        obj.insert("user_id".to_string(), json!("user_legacy"));

        let event = decode(&envelope(value)).unwrap();
        assert_eq!(event.actor_id, "user_legacy");
    }

    #[test]
    fn missing_actor_is_malformed() {
        let mut value = purchase_json();
        value.as_object_mut().unwrap().remove("actor_id");

        let err = decode(&envelope(value)).unwrap_err();
        assert!(matches!(err, EventError::Malformed(msg) if msg.contains("actor_id")));
    }

    #[test]
    fn empty_fields_are_malformed() {
        for (field, replacement) in [
            ("actor_id", json!("  ")),
            ("event_type", json!("")),
            ("data", json!({})),
            ("data", json!(null)),
        ] {
            let mut value = purchase_json();
            value[field] = replacement;
            let err = decode(&envelope(value)).unwrap_err();
            assert!(matches!(err, EventError::Malformed(_)), "{field} should be rejected");
        }
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut value = purchase_json();
        value["event_type"] = json!("refund");

        let err = decode(&envelope(value)).unwrap_err();
        assert_eq!(err, EventError::Malformed("unknown event_type 'refund'".to_string()));
    }

    #[test]
    fn invalid_timestamp_is_malformed() {
        let mut value = purchase_json();
        value["timestamp"] = json!("yesterday");
        assert!(matches!(decode(&envelope(value)), Err(EventError::Malformed(_))));

        let mut value = purchase_json();
        value.as_object_mut().unwrap().remove("timestamp");
        assert!(matches!(decode(&envelope(value)), Err(EventError::Malformed(_))));
    }

    #[test]
    fn non_json_is_decode_error() {
        assert!(matches!(decode(b"not json"), Err(EventError::Decode(_))));
    }

    #[test]
    fn purchase_without_price_is_malformed() {
        let mut value = purchase_json();
        value["data"].as_object_mut().unwrap().remove("price");

        let err = decode(&envelope(value)).unwrap_err();
        assert!(matches!(err, EventError::Malformed(msg) if msg.contains("price")));
    }

    #[test]
    fn negative_values_are_malformed() {
        let mut value = purchase_json();
        value["data"]["quantity"] = json!(-1);
        assert!(matches!(decode(&envelope(value)), Err(EventError::Malformed(_))));

        let mut value = purchase_json();
        value["data"]["price"] = json!(-0.5);
        assert!(matches!(decode(&envelope(value)), Err(EventError::Malformed(_))));

        let mut value = purchase_json();
        value["data"]["discount"] = json!(1.5);
        assert!(matches!(decode(&envelope(value)), Err(EventError::Malformed(_))));
    }

    #[test]
    fn discount_defaults_to_zero() {
        let mut value = purchase_json();
        value["data"].as_object_mut().unwrap().remove("discount");

        let event = decode(&envelope(value)).unwrap();
        assert!((event.revenue() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn page_view_needs_no_product() {
        let event = decode(&envelope(json!({
            "actor_id": "user_2",
            "event_type": "page_view",
            "timestamp": "2024-03-01T08:15:00Z",
            "data": { "page_url": "/books/abc123" }
        })))
        .unwrap();

        assert_eq!(
            event.details,
            EventDetails::PageView { page_url: Some("/books/abc123".to_string()) }
        );
        assert!(event.revenue().abs() < f64::EPSILON);
    }

    #[test]
    fn product_view_without_product_is_malformed() {
        let err = decode(&envelope(json!({
            "actor_id": "user_2",
            "event_type": "product_view",
            "timestamp": "2024-03-01T08:15:00Z",
            "data": { "page_url": "/books/abc123" }
        })))
        .unwrap_err();

        assert!(matches!(err, EventError::Malformed(msg) if msg.contains("product_id")));
    }

    #[test]
    fn window_uses_event_timestamp() {
        let event = decode(&envelope(purchase_json())).unwrap();
        assert_eq!(event.window_start().to_rfc3339(), "2024-03-01T12:00:00+00:00");
        assert_eq!(event.calendar_date().to_string(), "2024-03-01");
    }

    #[test]
    fn window_respects_utc_offsets() {
        let mut value = purchase_json();
        value["timestamp"] = json!("2024-03-01T23:59:30-02:00");

        let event = decode(&envelope(value)).unwrap();
        assert_eq!(event.window_start().to_rfc3339(), "2024-03-02T01:59:00+00:00");
        assert_eq!(event.calendar_date().to_string(), "2024-03-02");
    }

    #[test]
    fn routing_keys() {
        assert_eq!(EventKind::AddToCart.routing_key(), "user.add_to_cart");
        assert_eq!("product_view".parse::<EventKind>().unwrap(), EventKind::ProductView);
    }

    proptest! {
        #[test]
        fn revenue_is_non_negative_and_bounded(
            price in 0.0f64..10_000.0,
            quantity in 0i64..1_000,
            discount in 0.0f64..=1.0,
        ) {
            let line = PurchaseLine {
                product: ProductInfo {
                    product_id: "p".to_string(),
                    name: None,
                    category: None,
                    brand: None,
                    price: Some(price),
                },
                unit_price: price,
                quantity,
                discount,
            };
            let revenue = line.revenue();
            #[allow(clippy::cast_precision_loss)]
            let gross = price * quantity as f64;
            prop_assert!(revenue >= 0.0);
            prop_assert!(revenue <= gross + 1e-6);
        }

        #[test]
        fn window_start_is_minute_aligned(secs in 0i64..4_000_000_000, nanos in 0u32..1_000_000_000) {
            let at = DateTime::from_timestamp(secs, nanos).unwrap();
            let start = window_start(at);
            prop_assert_eq!(start.timestamp() % 60, 0);
            prop_assert!(start <= at);
            prop_assert!(at - start < chrono::TimeDelta::minutes(1));
        }
    }
}
