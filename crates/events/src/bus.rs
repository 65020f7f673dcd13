//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the fan-out side of the system: the reconciliation engine
//! publishes stock notifications here and every downstream subscriber
//! (replenishment, storefront cache, alerting) receives its own copy.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a notification may be published more than once (the
//!   engine republishes after a redelivered inbound event). Subscribers
//!   de-duplicate by `(productId, newQuantity)`.
//! - **Per-key ordering only**: implementations keep publish order for one
//!   partition key; nothing is promised across keys.
//! - **No persistence contract**: the stock ledger is the source of truth, not
//!   the bus.
//!
//! The inbound (consuming) side with explicit acknowledgement lives in
//! [`crate::queue`].

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(event) => process(event)?,
///         Err(RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // bus closed
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Reconciliation engine → NotificationPublisher → EventBus (publish) → Subscribers
/// ```
///
/// `publish()` can fail (broken connection, timeout, poisoned lock). The
/// failure is surfaced to the caller, which owns the retry policy. Publishing
/// the same notification twice is always safe.
///
/// Implementations must be `Send + Sync`; several worker threads publish
/// concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
