use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for an event, containing routing and delivery metadata.
///
/// This is the unit that travels over a transport.
///
/// Notes:
/// - `event_id` is stable across redeliveries of the same upstream event, so
///   consumers can use it as an idempotency key.
/// - `partition_key` decides which partition/shard the event lands on; events
///   sharing a key are delivered in publish order.
/// - `causation_id` links a derived event to the event that caused it.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    topic: String,
    partition_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<Uuid>,

    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        topic: impl Into<String>,
        partition_key: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            topic: topic.into(),
            partition_key: partition_key.into(),
            causation_id: None,
            occurred_at,
            payload,
        }
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
