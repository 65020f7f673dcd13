use crate::EventEnvelope;
use crate::queue::Delivery;

/// Messages that carry a partition key.
///
/// Workers use the key to pin all messages for one product to the same shard,
/// which gives natural per-key serialization on top of the store's atomic
/// primitives.
pub trait PartitionKeyed {
    fn partition_key(&self) -> &str;
}

impl<E> PartitionKeyed for EventEnvelope<E> {
    fn partition_key(&self) -> &str {
        EventEnvelope::partition_key(self)
    }
}

impl<M: PartitionKeyed> PartitionKeyed for Delivery<M> {
    fn partition_key(&self) -> &str {
        self.message().partition_key()
    }
}
