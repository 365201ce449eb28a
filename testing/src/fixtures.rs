//! Wire envelopes for each event kind.
//!
//! Timestamps are RFC 3339 strings; see [`at`] for a quick way to build one.

use serde_json::{Value, json};

/// `2025-01-01T{hour}:{minute}:{second}Z`.
#[must_use]
pub fn at(hour: u32, minute: u32, second: u32) -> String {
    format!("2025-01-01T{hour:02}:{minute:02}:{second:02}Z")
}

/// A page view.
#[must_use]
pub fn page_view(actor_id: &str, timestamp: &str) -> Value {
    json!({
        "actor_id": actor_id,
        "session_id": format!("s-{actor_id}"),
        "event_type": "page_view",
        "timestamp": timestamp,
        "data": { "page_url": "/home" },
        "metadata": { "source": "web" }
    })
}

/// A product view with full descriptors.
#[must_use]
pub fn product_view(actor_id: &str, product_id: &str, timestamp: &str) -> Value {
    json!({
        "actor_id": actor_id,
        "session_id": format!("s-{actor_id}"),
        "event_type": "product_view",
        "timestamp": timestamp,
        "data": {
            "product_id": product_id,
            "product_name": format!("Product {product_id}"),
            "category": "electronics",
            "brand": "Acme",
            "price": 100.0
        },
        "metadata": { "source": "web" }
    })
}

/// An add-to-cart of `quantity` items.
#[must_use]
pub fn add_to_cart(actor_id: &str, product_id: &str, quantity: i64, timestamp: &str) -> Value {
    json!({
        "actor_id": actor_id,
        "session_id": format!("s-{actor_id}"),
        "event_type": "add_to_cart",
        "timestamp": timestamp,
        "data": {
            "product_id": product_id,
            "product_name": format!("Product {product_id}"),
            "price": 100.0,
            "quantity": quantity
        },
        "metadata": {}
    })
}

/// A purchase of `quantity` units at `price` with `discount`.
#[must_use]
pub fn purchase(
    actor_id: &str,
    product_id: &str,
    price: f64,
    quantity: i64,
    discount: f64,
    timestamp: &str,
) -> Value {
    json!({
        "actor_id": actor_id,
        "session_id": format!("s-{actor_id}"),
        "event_type": "purchase",
        "timestamp": timestamp,
        "data": {
            "product_id": product_id,
            "product_name": format!("Product {product_id}"),
            "category": "electronics",
            "brand": "Acme",
            "price": price,
            "quantity": quantity,
            "discount": discount
        },
        "metadata": { "source": "checkout" }
    })
}

/// An envelope with no `actor_id`.
#[must_use]
pub fn missing_actor(timestamp: &str) -> Value {
    json!({
        "event_type": "page_view",
        "timestamp": timestamp,
        "data": { "page_url": "/home" }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopflow_core::event::{EventKind, decode};

    #[test]
    fn fixtures_decode_to_their_kind() {
        let ts = at(12, 0, 0);
        let cases = [
            (page_view("u1", &ts), EventKind::PageView),
            (product_view("u1", "p1", &ts), EventKind::ProductView),
            (add_to_cart("u1", "p1", 2, &ts), EventKind::AddToCart),
            (purchase("u1", "p1", 100.0, 2, 0.1, &ts), EventKind::Purchase),
        ];
        for (envelope, kind) in cases {
            let event = decode(envelope.to_string().as_bytes()).unwrap();
            assert_eq!(event.kind(), kind);
        }
    }

    #[test]
    fn missing_actor_is_rejected() {
        assert!(decode(missing_actor(&at(12, 0, 0)).to_string().as_bytes()).is_err());
    }
}
