//! Inventory reconciliation engine.
//!
//! Keeps the stock ledger consistent with upstream sales activity:
//!
//! ```text
//! product-created  → create_if_absent(product, 0)
//! order-created    → adjust_once((event, line), product, -qty)  per line item
//! order-cancelled  → adjust_once((event, line), product, +qty)  per line item
//!                  → StockAdjusted, plus StockDepleted / StockRestored on a
//!                    sign crossing
//! ```
//!
//! ## Failure semantics
//!
//! - Unknown product: the item is skipped (never fabricated), logged, counted.
//! - Non-positive line quantity: the item is rejected, never retried.
//! - Store or publish failure: the item fails, the other items still run, and
//!   the event as a whole returns `Incomplete` so the transport redelivers it.
//!   Items that already went through are replayed from their idempotency
//!   markers on redelivery and republish the same notifications.
//!
//! The ledger write is never rolled back because a publish failed.
//!
//! ## Ordering
//!
//! Order events are sharded by order id, so two events touching the same
//! product can run at once. Each line holds its product's lock from the
//! ledger write until its notifications are published, which keeps the
//! published sequence for a product in ledger order within this process.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use stockflow_core::ProductId;
use stockflow_events::{Event, EventBus, EventEnvelope};
use stockflow_inventory::{
    DecodeError, InboundEvent, LedgerChange, OrderCancelled, OrderCreated, OrderLineItem, ProductCreated,
};

use crate::ledger_store::{AdjustmentKey, LedgerError, StockLedgerStore};
use crate::notifications::{NotificationPublisher, PublishError};
use crate::workers::Retryable;

/// What happened to one unit of work (a created product or one line item).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created,
    AlreadyExists,
    Adjusted {
        previous: i64,
        current: i64,
        /// Recorded by an earlier delivery of the same event.
        replayed: bool,
    },
    SkippedUnknownProduct,
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    /// Position in the order's item list (0 for product events).
    pub line: u32,
    pub product_id: ProductId,
    pub outcome: ItemOutcome,
}

/// Per-event processing report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub event_id: Uuid,
    pub outcomes: Vec<ItemReport>,
}

impl ReconcileReport {
    fn new(event_id: Uuid) -> Self {
        Self {
            event_id,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, line: u32, product_id: ProductId, outcome: ItemOutcome) {
        self.outcomes.push(ItemReport {
            line,
            product_id,
            outcome,
        });
    }

    /// Ledger changes made (or replayed) by this event, in line order.
    pub fn changes(&self) -> Vec<LedgerChange> {
        self.outcomes
            .iter()
            .filter_map(|r| match r.outcome {
                ItemOutcome::Adjusted { previous, current, .. } => {
                    Some(LedgerChange::new(r.product_id, previous, current))
                }
                _ => None,
            })
            .collect()
    }
}

/// One failed line item inside an `Incomplete` event.
#[derive(Debug)]
pub struct ItemFailure {
    pub line: u32,
    pub product_id: ProductId,
    pub error: ReconcileError,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] LedgerError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("{failed} of {total} line items failed; first: {}", first_failure(.failures))]
    Incomplete {
        failed: usize,
        total: usize,
        failures: Vec<ItemFailure>,
    },
}

fn first_failure(failures: &[ItemFailure]) -> String {
    failures
        .first()
        .map(|f| format!("line {}: {}", f.line, f.error))
        .unwrap_or_default()
}

impl Retryable for ReconcileError {
    fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Decode(_) => false,
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Publish(e) => e.is_retryable(),
            ReconcileError::Incomplete { failures, .. } => failures.iter().any(|f| f.error.is_retryable()),
        }
    }
}

/// Cumulative engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub events_handled: u64,
    pub records_created: u64,
    pub adjustments_applied: u64,
    pub adjustments_replayed: u64,
    pub unknown_product_skips: u64,
    pub rejected_items: u64,
    pub notifications_published: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy)]
enum Movement {
    /// Units leave stock (order placed).
    Out,
    /// Units return to stock (order cancelled).
    In,
}

impl Movement {
    fn delta(self, units: i64) -> i64 {
        match self {
            Movement::Out => -units,
            Movement::In => units,
        }
    }
}

const PRODUCT_LOCK_STRIPES: usize = 64;

/// Striped per-product locks; two products may share a stripe.
#[derive(Debug)]
struct ProductLocks {
    stripes: Vec<Mutex<()>>,
}

impl ProductLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, product_id: ProductId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        product_id.hash(&mut hasher);
        let stripe = &self.stripes[(hasher.finish() % self.stripes.len() as u64) as usize];
        // The guarded value is `()`, so a poisoned stripe is still usable.
        stripe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies inbound domain events to the ledger and publishes the resulting
/// stock notifications.
///
/// Stateless apart from counters: every piece of durable state lives in the
/// [`StockLedgerStore`]. Safe to share across worker threads.
#[derive(Debug)]
pub struct ReconciliationEngine<S, B> {
    store: S,
    publisher: NotificationPublisher<B>,
    product_locks: ProductLocks,
    stats: Mutex<ReconcileStats>,
}

impl<S, B> ReconciliationEngine<S, B>
where
    S: StockLedgerStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, publisher: NotificationPublisher<B>) -> Self {
        Self {
            store,
            publisher,
            product_locks: ProductLocks::new(PRODUCT_LOCK_STRIPES),
            stats: Mutex::new(ReconcileStats::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &NotificationPublisher<B> {
        &self.publisher
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut ReconcileStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Decode a transport envelope and route it.
    pub fn handle_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<ReconcileReport, ReconcileError> {
        let event = InboundEvent::decode(envelope).inspect_err(|err| {
            warn!(
                event_id = %envelope.event_id(),
                topic = envelope.topic(),
                error = %err,
                "undecodable inbound event"
            );
            self.record(|s| s.failures += 1);
        })?;

        self.route(envelope.event_id(), &event)
    }

    /// Dispatch an already-decoded event to its handler.
    pub fn route(&self, event_id: Uuid, event: &InboundEvent) -> Result<ReconcileReport, ReconcileError> {
        let span = info_span!("reconcile", %event_id, event_type = event.event_type());
        let _guard = span.enter();

        let result = match event {
            InboundEvent::ProductCreated(e) => self.on_product_created(event_id, e),
            InboundEvent::OrderCreated(e) => self.on_order_created(event_id, e),
            InboundEvent::OrderCancelled(e) => self.on_order_cancelled(event_id, e),
        };

        self.record(|s| {
            s.events_handled += 1;
            if result.is_err() {
                s.failures += 1;
            }
        });
        result
    }

    /// Create the product's ledger record at zero, unless it already exists.
    pub fn on_product_created(&self, event_id: Uuid, event: &ProductCreated) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::new(event_id);

        if self.store.create_if_absent(event.product_id, 0)? {
            info!(product_id = %event.product_id, "ledger record created");
            self.record(|s| s.records_created += 1);
            report.push(0, event.product_id, ItemOutcome::Created);
        } else {
            debug!(product_id = %event.product_id, "ledger record already exists");
            report.push(0, event.product_id, ItemOutcome::AlreadyExists);
        }

        Ok(report)
    }

    /// Take each line item's quantity out of stock.
    pub fn on_order_created(&self, event_id: Uuid, event: &OrderCreated) -> Result<ReconcileReport, ReconcileError> {
        self.apply_items(event_id, &event.items, Movement::Out)
    }

    /// Put each line item's quantity back into stock.
    pub fn on_order_cancelled(&self, event_id: Uuid, event: &OrderCancelled) -> Result<ReconcileReport, ReconcileError> {
        self.apply_items(event_id, &event.items, Movement::In)
    }

    fn apply_items(
        &self,
        event_id: Uuid,
        items: &[OrderLineItem],
        movement: Movement,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::new(event_id);
        let mut failures = Vec::new();

        for (line, item) in (0u32..).zip(items) {
            let product_id = item.product_id;

            let units = match item.units() {
                Ok(units) => units,
                Err(err) => {
                    warn!(line, %product_id, quantity = item.quantity, "line item rejected: {err}");
                    self.record(|s| s.rejected_items += 1);
                    report.push(line, product_id, ItemOutcome::Rejected { reason: err.to_string() });
                    continue;
                }
            };

            // Held until this line's notifications are out.
            let _product_guard = self.product_locks.lock(product_id);

            let key = AdjustmentKey::new(event_id, line);
            let applied = match self.store.adjust_once(key, product_id, movement.delta(units)) {
                Ok(applied) => applied,
                Err(LedgerError::NotFound(_)) => {
                    warn!(line, %product_id, "line item references a product with no ledger record; skipping");
                    self.record(|s| s.unknown_product_skips += 1);
                    report.push(line, product_id, ItemOutcome::SkippedUnknownProduct);
                    continue;
                }
                Err(err) => {
                    warn!(line, %product_id, error = %err, "ledger adjustment failed");
                    failures.push(ItemFailure {
                        line,
                        product_id,
                        error: err.into(),
                    });
                    continue;
                }
            };

            let change = applied.change;
            self.record(|s| {
                if applied.replayed {
                    s.adjustments_replayed += 1;
                } else {
                    s.adjustments_applied += 1;
                }
            });
            debug!(
                line,
                %product_id,
                previous = change.previous,
                current = change.current,
                replayed = applied.replayed,
                "stock adjusted"
            );
            report.push(
                line,
                product_id,
                ItemOutcome::Adjusted {
                    previous: change.previous,
                    current: change.current,
                    replayed: applied.replayed,
                },
            );

            if let Err(err) = self.notify(event_id, &change) {
                warn!(line, %product_id, error = %err, "notification failed; ledger change stands");
                failures.push(ItemFailure {
                    line,
                    product_id,
                    error: err.into(),
                });
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ReconcileError::Incomplete {
                failed: failures.len(),
                total: items.len(),
                failures,
            })
        }
    }

    fn notify(&self, event_id: Uuid, change: &LedgerChange) -> Result<(), PublishError> {
        for notification in change.notifications() {
            self.publisher.publish(&notification, event_id)?;
            self.record(|s| s.notifications_published += 1);
        }
        Ok(())
    }
}
