//! Competing-consumer delivery with explicit acknowledgement.
//!
//! Where [`crate::bus`] broadcasts, a `ConsumerQueue` hands each message to one
//! consumer and keeps it pending until the consumer settles it:
//!
//! - `ack`: processed; never delivered again.
//! - `nack`: not processed; the transport redelivers with `attempt + 1`.
//! - `dead_letter`: give up; park the message with a reason and stop
//!   redelivering.
//!
//! A consumer that crashes without settling leaves the message pending, and
//! the transport redelivers it later. That is the at-least-once contract the
//! reconciliation engine is written against.

use std::sync::Arc;

use crate::bus::Subscription;

/// Transport-assigned identity of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    source: String,
    id: String,
    attempt: u32,
}

impl DeliveryTag {
    pub fn new(source: impl Into<String>, id: impl Into<String>, attempt: u32) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
            attempt,
        }
    }

    /// Stream/queue the message was read from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Transport message id (stable across redeliveries).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 1-based delivery attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            source: self.source.clone(),
            id: self.id.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// A message plus the tag needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<M> {
    tag: DeliveryTag,
    message: M,
}

impl<M> Delivery<M> {
    pub fn new(tag: DeliveryTag, message: M) -> Self {
        Self { tag, message }
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_parts(self) -> (DeliveryTag, M) {
        (self.tag, self.message)
    }
}

/// Consuming side of an at-least-once transport.
pub trait ConsumerQueue<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Start receiving deliveries for this consumer.
    fn consume(&self) -> Subscription<Delivery<M>>;

    fn ack(&self, tag: &DeliveryTag) -> Result<(), Self::Error>;

    fn nack(&self, tag: &DeliveryTag) -> Result<(), Self::Error>;

    /// Park a delivery that will never succeed. Implies `ack`.
    fn dead_letter(&self, delivery: Delivery<M>, reason: &str) -> Result<(), Self::Error>;
}

impl<M, Q> ConsumerQueue<M> for Arc<Q>
where
    Q: ConsumerQueue<M> + ?Sized,
{
    type Error = Q::Error;

    fn consume(&self) -> Subscription<Delivery<M>> {
        (**self).consume()
    }

    fn ack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        (**self).ack(tag)
    }

    fn nack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        (**self).nack(tag)
    }

    fn dead_letter(&self, delivery: Delivery<M>, reason: &str) -> Result<(), Self::Error> {
        (**self).dead_letter(delivery, reason)
    }
}
