//! Background workers.

pub mod reconciliation_worker;

pub use reconciliation_worker::{ReconciliationWorker, WorkerConfig, WorkerHandle, WorkerStats};

/// Failure classification used to settle a delivery.
///
/// Retryable failures are `nack`ed for redelivery; everything else is
/// dead-lettered.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}
