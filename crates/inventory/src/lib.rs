//! Inventory reconciliation domain.
//!
//! Pure, deterministic rules (no IO, no storage): what a ledger row is, when a
//! quantity change crosses the depletion boundary, what upstream events look
//! like on the wire and which notifications a change produces.

pub mod inbound;
pub mod ledger;
pub mod notification;

pub use inbound::{
    DecodeError, InboundEvent, OrderCancelled, OrderCreated, OrderLineItem, ProductCreated,
};
pub use ledger::{LedgerChange, StockLevel, StockRecord, StockTransition};
pub use notification::{StockAdjusted, StockDepleted, StockNotification, StockRestored};
