//! Infrastructure layer: ledger stores, transports, the reconciliation
//! engine and the worker that drives it.

pub mod config;
pub mod event_bus;
pub mod ledger_store;
pub mod notifications;
pub mod reconciler;
pub mod retry;
pub mod workers;
