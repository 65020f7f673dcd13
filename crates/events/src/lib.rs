//! Event mechanics: envelopes, pub/sub, competing-consumer queues.
//!
//! Domain-agnostic. The inventory crate defines what flows through these
//! types; the infra crate provides durable transports.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod in_memory_queue;
pub mod keyed;
pub mod queue;
pub mod topics;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use in_memory_queue::{DeadLetter, InMemoryQueue, InMemoryQueueError};
pub use keyed::PartitionKeyed;
pub use queue::{ConsumerQueue, Delivery, DeliveryTag};
