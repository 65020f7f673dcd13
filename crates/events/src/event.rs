use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - routed by their **topic**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "inventory.stock.adjusted").
    fn event_type(&self) -> &'static str;

    /// Transport topic the event is published on (e.g. "stock-adjusted").
    fn topic(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time), if the payload carries it.
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}
