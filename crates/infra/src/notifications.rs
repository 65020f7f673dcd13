//! Outbound stock notifications with bounded in-process retry.

use std::thread;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use stockflow_events::{Event, EventBus, EventEnvelope};
use stockflow_inventory::StockNotification;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode {topic} notification: {source}")]
    Encode {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("publishing to {topic} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        topic: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl PublishError {
    /// Encoding failures are deterministic; exhausted retries may succeed on
    /// a later redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Exhausted { .. })
    }
}

/// Publishes [`StockNotification`]s onto an [`EventBus`].
///
/// A failed publish is retried according to the [`RetryPolicy`]; when the
/// policy is exhausted the error goes back to the caller, which leaves the
/// inbound delivery unacknowledged so the whole item is replayed later.
#[derive(Debug)]
pub struct NotificationPublisher<B> {
    bus: B,
    retry: RetryPolicy,
}

impl<B> NotificationPublisher<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(bus: B, retry: RetryPolicy) -> Self {
        Self { bus, retry }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Publish one notification, caused by inbound event `causation_id`.
    pub fn publish(&self, notification: &StockNotification, causation_id: Uuid) -> Result<(), PublishError> {
        let topic = notification.topic();
        let envelope = notification
            .to_envelope(causation_id)
            .map_err(|source| PublishError::Encode { topic, source })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bus.publish(envelope.clone()) {
                Ok(()) => {
                    debug!(
                        topic,
                        product_id = %notification.product_id(),
                        %causation_id,
                        attempt,
                        "notification published"
                    );
                    return Ok(());
                }
                Err(err) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = ?err,
                        "publish failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    return Err(PublishError::Exhausted {
                        topic,
                        attempts: attempt,
                        last_error: format!("{err:?}"),
                    });
                }
            }
        }
    }
}
