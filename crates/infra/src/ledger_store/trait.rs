use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use stockflow_core::ProductId;
use stockflow_inventory::{LedgerChange, StockRecord};

/// Identity of one line-item adjustment: the inbound event plus the line's
/// position within it.
///
/// Redelivering the same event yields the same keys, which is what makes
/// [`StockLedgerStore::adjust_once`] idempotent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentKey {
    pub event_id: Uuid,
    pub line: u32,
}

impl AdjustmentKey {
    pub fn new(event_id: Uuid, line: u32) -> Self {
        Self { event_id, line }
    }
}

impl std::fmt::Display for AdjustmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.event_id, self.line)
    }
}

/// Result of [`StockLedgerStore::adjust_once`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AppliedAdjustment {
    pub change: LedgerChange,
    /// `true` when the key had already been applied and `change` is the
    /// recorded result of that first application.
    pub replayed: bool,
}

/// Ledger store operation error.
///
/// - **NotFound**: the product has no ledger row (never created)
/// - **Unavailable**: backend unreachable, pool exhausted, transaction aborted
/// - **Timeout**: the operation exceeded its deadline; its effect is unknown
/// - **KeyReused**: an adjustment key was already applied to a different product
/// - **Overflow**: the adjustment does not fit in a signed 64-bit quantity
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no ledger record for product {0}")]
    NotFound(ProductId),

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),

    #[error("ledger operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("adjustment key {key} already applied to product {recorded_for}")]
    KeyReused {
        key: AdjustmentKey,
        recorded_for: ProductId,
    },

    #[error("quantity overflow for product {0}")]
    Overflow(ProductId),
}

impl LedgerError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Timeout(_))
    }
}

/// The persistent stock ledger.
///
/// One record per product, each holding a signed quantity. Every mutation is a
/// single atomic read-modify-write on one key, and returns the value it
/// produced. Callers never compute a new quantity from a separate read.
///
/// ## Concurrency
///
/// Concurrent adjustments to the same product serialize inside the store:
/// N concurrent `atomic_adjust(p, -1)` against quantity Q always end at Q - N,
/// and each caller observes a distinct result.
///
/// ## Idempotency
///
/// `adjust_once` records a marker for its [`AdjustmentKey`] in the same atomic
/// step as the quantity change. A second call with the same key does not
/// touch the quantity; it returns the recorded `(previous, current)` with
/// `replayed = true`.
///
/// ## Retention
///
/// Markers accumulate with every applied line. `prune_markers` drops the ones
/// recorded before a cutoff. A redelivery of an event whose markers were
/// pruned is applied again, so the cutoff must lie further back than any
/// delivery can still be pending.
pub trait StockLedgerStore: Send + Sync {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerError>;

    /// Create the record at `initial_quantity` unless it already exists.
    ///
    /// Returns `true` if this call created it. An existing record is left
    /// untouched.
    fn create_if_absent(&self, product_id: ProductId, initial_quantity: i64) -> Result<bool, LedgerError>;

    /// Add `delta` (may be negative) and return the resulting quantity.
    ///
    /// Fails with `NotFound` if the record does not exist; never creates one.
    fn atomic_adjust(&self, product_id: ProductId, delta: i64) -> Result<i64, LedgerError>;

    /// `atomic_adjust`, applied at most once per `key`.
    fn adjust_once(
        &self,
        key: AdjustmentKey,
        product_id: ProductId,
        delta: i64,
    ) -> Result<AppliedAdjustment, LedgerError>;

    /// Delete idempotency markers recorded strictly before `older_than`.
    ///
    /// Returns the number of markers removed. Quantities are not touched.
    fn prune_markers(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError>;
}

impl<S> StockLedgerStore for Arc<S>
where
    S: StockLedgerStore + ?Sized,
{
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerError> {
        (**self).get(product_id)
    }

    fn create_if_absent(&self, product_id: ProductId, initial_quantity: i64) -> Result<bool, LedgerError> {
        (**self).create_if_absent(product_id, initial_quantity)
    }

    fn atomic_adjust(&self, product_id: ProductId, delta: i64) -> Result<i64, LedgerError> {
        (**self).atomic_adjust(product_id, delta)
    }

    fn adjust_once(
        &self,
        key: AdjustmentKey,
        product_id: ProductId,
        delta: i64,
    ) -> Result<AppliedAdjustment, LedgerError> {
        (**self).adjust_once(key, product_id, delta)
    }

    fn prune_markers(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        (**self).prune_markers(older_than)
    }
}
