//! Reconciler service: wires the ledger, transports and worker together.

pub mod services;
