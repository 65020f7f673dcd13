//! In-memory competing-consumer queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};

use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::queue::{ConsumerQueue, Delivery, DeliveryTag};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryQueueError {
    #[error("queue lock poisoned")]
    Poisoned,

    /// Settling a delivery that is not pending (double ack, stale tag).
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// A delivery that was given up on.
#[derive(Debug, Clone)]
pub struct DeadLetter<M> {
    pub delivery: Delivery<M>,
    pub reason: String,
}

#[derive(Debug)]
struct QueueState<M> {
    next_id: u64,
    consumers: Vec<mpsc::Sender<Delivery<M>>>,
    next_consumer: usize,
    /// Deliveries waiting for a consumer to attach.
    backlog: VecDeque<Delivery<M>>,
    /// Delivered but not yet settled, keyed by message id.
    pending: HashMap<String, Delivery<M>>,
    dead_letters: Vec<DeadLetter<M>>,
    acked: u64,
    redelivered: u64,
}

/// In-memory at-least-once queue.
///
/// - Round-robin across attached consumers
/// - Messages stay pending until `ack`/`nack`/`dead_letter`
/// - `nack` redelivers immediately with the attempt counter bumped
/// - No IO / no async
#[derive(Debug)]
pub struct InMemoryQueue<M> {
    source: String,
    state: Mutex<QueueState<M>>,
}

impl<M> InMemoryQueue<M> {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: Mutex::new(QueueState {
                next_id: 1,
                consumers: Vec::new(),
                next_consumer: 0,
                backlog: VecDeque::new(),
                pending: HashMap::new(),
                dead_letters: Vec::new(),
                acked: 0,
                redelivered: 0,
            }),
        }
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().map(|s| s.acked).unwrap_or(0)
    }

    pub fn redelivered_count(&self) -> u64 {
        self.state.lock().map(|s| s.redelivered).unwrap_or(0)
    }

    /// Delivered but unsettled, plus waiting for a consumer.
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.pending.len() + s.backlog.len())
            .unwrap_or(0)
    }
}

impl<M: Clone> InMemoryQueue<M> {
    /// Append a message; returns the tag of its first delivery.
    pub fn enqueue(&self, message: M) -> Result<DeliveryTag, InMemoryQueueError> {
        let mut state = self.state.lock().map_err(|_| InMemoryQueueError::Poisoned)?;

        let id = state.next_id.to_string();
        state.next_id += 1;

        let tag = DeliveryTag::new(self.source.clone(), id, 1);
        dispatch(&mut state, Delivery::new(tag.clone(), message));
        Ok(tag)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<M>> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl<M> Default for InMemoryQueue<M> {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

/// Hand a delivery to the next live consumer, or park it in the backlog.
fn dispatch<M: Clone>(state: &mut QueueState<M>, delivery: Delivery<M>) {
    state
        .pending
        .insert(delivery.tag().id().to_string(), delivery.clone());

    while !state.consumers.is_empty() {
        let idx = state.next_consumer % state.consumers.len();
        match state.consumers[idx].send(delivery.clone()) {
            Ok(()) => {
                state.next_consumer = idx + 1;
                return;
            }
            Err(_) => {
                // Receiver gone; forget the consumer and try the next one.
                state.consumers.remove(idx);
            }
        }
    }

    state.pending.remove(delivery.tag().id());
    state.backlog.push_back(delivery);
}

impl<M> ConsumerQueue<M> for InMemoryQueue<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryQueueError;

    fn consume(&self) -> Subscription<Delivery<M>> {
        let (tx, rx) = mpsc::channel();

        if let Ok(mut state) = self.state.lock() {
            state.consumers.push(tx);
            let backlog: Vec<_> = state.backlog.drain(..).collect();
            for delivery in backlog {
                dispatch(&mut state, delivery);
            }
        }

        Subscription::new(rx)
    }

    fn ack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryQueueError::Poisoned)?;
        state
            .pending
            .remove(tag.id())
            .ok_or_else(|| InMemoryQueueError::UnknownDelivery(tag.id().to_string()))?;
        state.acked += 1;
        Ok(())
    }

    fn nack(&self, tag: &DeliveryTag) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryQueueError::Poisoned)?;
        let delivery = state
            .pending
            .remove(tag.id())
            .ok_or_else(|| InMemoryQueueError::UnknownDelivery(tag.id().to_string()))?;

        let (prev, message) = delivery.into_parts();
        let next = prev.next_attempt();
        debug!(message_id = %next.id(), attempt = next.attempt(), "redelivering message");

        state.redelivered += 1;
        dispatch(&mut state, Delivery::new(next, message));
        Ok(())
    }

    fn dead_letter(&self, delivery: Delivery<M>, reason: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryQueueError::Poisoned)?;
        state
            .pending
            .remove(delivery.tag().id())
            .ok_or_else(|| InMemoryQueueError::UnknownDelivery(delivery.tag().id().to_string()))?;

        warn!(
            message_id = %delivery.tag().id(),
            attempt = delivery.tag().attempt(),
            reason,
            "message dead-lettered"
        );

        state.dead_letters.push(DeadLetter {
            delivery,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
