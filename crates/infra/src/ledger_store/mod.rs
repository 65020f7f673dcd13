//! Stock ledger storage boundary.
//!
//! The ledger is the source of truth for per-product quantities. Everything
//! else in the pipeline (notifications, worker acknowledgements) is derived
//! from the values these stores return.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{AdjustmentKey, AppliedAdjustment, LedgerError, StockLedgerStore};
