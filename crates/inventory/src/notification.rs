//! Notifications published after ledger changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stockflow_core::ProductId;
use stockflow_events::{Event, EventEnvelope, topics};

/// Payload of `stock-adjusted`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjusted {
    pub product_id: ProductId,
    pub new_quantity: i64,
}

/// Payload of `stock-depleted`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDepleted {
    pub product_id: ProductId,
}

/// Payload of `stock-restored`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRestored {
    pub product_id: ProductId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StockNotification {
    Adjusted(StockAdjusted),
    Depleted(StockDepleted),
    Restored(StockRestored),
}

impl StockNotification {
    pub fn product_id(&self) -> ProductId {
        match self {
            StockNotification::Adjusted(e) => e.product_id,
            StockNotification::Depleted(e) => e.product_id,
            StockNotification::Restored(e) => e.product_id,
        }
    }

    fn payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            StockNotification::Adjusted(e) => serde_json::to_value(e),
            StockNotification::Depleted(e) => serde_json::to_value(e),
            StockNotification::Restored(e) => serde_json::to_value(e),
        }
    }

    /// Wrap for publication, keyed by product id.
    pub fn to_envelope(&self, causation_id: Uuid) -> Result<EventEnvelope<JsonValue>, serde_json::Error> {
        Ok(EventEnvelope::new(
            Uuid::now_v7(),
            self.topic(),
            self.product_id().to_string(),
            Utc::now(),
            self.payload()?,
        )
        .with_causation(causation_id))
    }

    /// Read a published notification back (downstream consumers, tests).
    ///
    /// Returns `Ok(None)` for envelopes on other topics.
    pub fn from_envelope(envelope: &EventEnvelope<JsonValue>) -> Result<Option<Self>, serde_json::Error> {
        let payload = envelope.payload().clone();
        let decoded = match envelope.topic() {
            topics::STOCK_ADJUSTED => StockNotification::Adjusted(serde_json::from_value(payload)?),
            topics::STOCK_DEPLETED => StockNotification::Depleted(serde_json::from_value(payload)?),
            topics::STOCK_RESTORED => StockNotification::Restored(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

impl Event for StockNotification {
    fn event_type(&self) -> &'static str {
        match self {
            StockNotification::Adjusted(_) => "inventory.stock.adjusted",
            StockNotification::Depleted(_) => "inventory.stock.depleted",
            StockNotification::Restored(_) => "inventory.stock.restored",
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            StockNotification::Adjusted(_) => topics::STOCK_ADJUSTED,
            StockNotification::Depleted(_) => topics::STOCK_DEPLETED,
            StockNotification::Restored(_) => topics::STOCK_RESTORED,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}
