//! Upstream domain events consumed by the reconciliation engine.
//!
//! All inbound traffic is decoded into one tagged union, [`InboundEvent`],
//! keyed by transport topic. There is exactly one place that knows the topic
//! → payload mapping: [`InboundEvent::decode`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockflow_core::{DomainError, DomainResult, OrderId, ProductId};
use stockflow_events::{Event, EventEnvelope, topics};

/// One line of an order, as published by the order service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Carried through untouched; pricing is not this subsystem's concern.
    #[serde(default)]
    pub unit_price: f64,
}

impl OrderLineItem {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price: 0.0,
        }
    }

    /// Quantity as a positive amount of units.
    pub fn units(&self) -> DomainResult<i64> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "line quantity must be positive, got {}",
                self.quantity
            )));
        }
        Ok(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCreated {
    pub product_id: ProductId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub items: Vec<OrderLineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub items: Vec<OrderLineItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ProductCreated(ProductCreated),
    OrderCreated(OrderCreated),
    OrderCancelled(OrderCancelled),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("malformed {topic} payload: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundEvent {
    /// Decode a transport envelope by its topic.
    pub fn decode(envelope: &EventEnvelope<JsonValue>) -> Result<Self, DecodeError> {
        let topic = envelope.topic();
        let payload = envelope.payload().clone();
        let malformed = |source: serde_json::Error| DecodeError::Payload {
            topic: topic.to_string(),
            source,
        };

        match topic {
            topics::PRODUCT_CREATED => serde_json::from_value(payload)
                .map(InboundEvent::ProductCreated)
                .map_err(malformed),
            topics::ORDER_CREATED => serde_json::from_value(payload)
                .map(InboundEvent::OrderCreated)
                .map_err(malformed),
            topics::ORDER_CANCELLED => serde_json::from_value(payload)
                .map(InboundEvent::OrderCancelled)
                .map_err(malformed),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }

    /// Partition key upstream producers publish with.
    ///
    /// Product events key by product; order events key by order, since one
    /// order spans several products.
    pub fn partition_key(&self) -> String {
        match self {
            InboundEvent::ProductCreated(e) => e.product_id.to_string(),
            InboundEvent::OrderCreated(e) => e.order_id.to_string(),
            InboundEvent::OrderCancelled(e) => e.order_id.to_string(),
        }
    }

    fn payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            InboundEvent::ProductCreated(e) => serde_json::to_value(e),
            InboundEvent::OrderCreated(e) => serde_json::to_value(e),
            InboundEvent::OrderCancelled(e) => serde_json::to_value(e),
        }
    }

    /// Wrap as an upstream producer would (tests, replay tooling).
    pub fn to_envelope(&self, event_id: Uuid) -> Result<EventEnvelope<JsonValue>, serde_json::Error> {
        Ok(EventEnvelope::new(
            event_id,
            self.topic(),
            self.partition_key(),
            Utc::now(),
            self.payload()?,
        ))
    }
}

impl Event for InboundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::ProductCreated(_) => "catalog.product.created",
            InboundEvent::OrderCreated(_) => "sales.order.created",
            InboundEvent::OrderCancelled(_) => "sales.order.cancelled",
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            InboundEvent::ProductCreated(_) => topics::PRODUCT_CREATED,
            InboundEvent::OrderCreated(_) => topics::ORDER_CREATED,
            InboundEvent::OrderCancelled(_) => topics::ORDER_CANCELLED,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(topic: &str, payload: JsonValue) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(Uuid::now_v7(), topic, "k", Utc::now(), payload)
    }

    #[test]
    fn decodes_order_created_from_camel_case_json() {
        let order = OrderId::new();
        let product = ProductId::new();
        let env = envelope(
            "order-created",
            json!({
                "orderId": order.to_string(),
                "items": [{"productId": product.to_string(), "quantity": 2, "unitPrice": 9.99}]
            }),
        );

        match InboundEvent::decode(&env).unwrap() {
            InboundEvent::OrderCreated(e) => {
                assert_eq!(e.order_id, order);
                assert_eq!(e.items.len(), 1);
                assert_eq!(e.items[0].product_id, product);
                assert_eq!(e.items[0].units().unwrap(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unit_price_is_optional() {
        let env = envelope(
            "order-cancelled",
            json!({
                "orderId": OrderId::new().to_string(),
                "items": [{"productId": ProductId::new().to_string(), "quantity": 1}]
            }),
        );
        assert!(matches!(
            InboundEvent::decode(&env),
            Ok(InboundEvent::OrderCancelled(_))
        ));
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let env = envelope("user-registered", json!({}));
        assert!(matches!(
            InboundEvent::decode(&env),
            Err(DecodeError::UnknownTopic(t)) if t == "user-registered"
        ));
    }

    #[test]
    fn malformed_payload_names_topic() {
        let env = envelope("product-created", json!({"productId": "nope"}));
        let err = InboundEvent::decode(&env).unwrap_err();
        assert!(err.to_string().starts_with("malformed product-created payload"));
    }

    #[test]
    fn non_positive_quantity_fails_validation() {
        let item = OrderLineItem::new(ProductId::new(), 0);
        assert!(matches!(item.units(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn envelope_round_trip_keeps_event_id() {
        let id = Uuid::now_v7();
        let event = InboundEvent::ProductCreated(ProductCreated {
            product_id: ProductId::new(),
        });
        let env = event.to_envelope(id).unwrap();

        assert_eq!(env.event_id(), id);
        assert_eq!(env.topic(), "product-created");
        assert_eq!(InboundEvent::decode(&env).unwrap(), event);
    }
}
