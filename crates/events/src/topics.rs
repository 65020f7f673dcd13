//! Transport topic names.

/// A product entered the catalog.
pub const PRODUCT_CREATED: &str = "product-created";
/// An order was placed.
pub const ORDER_CREATED: &str = "order-created";
/// An order was cancelled.
pub const ORDER_CANCELLED: &str = "order-cancelled";

/// Every adjustment of a ledger row.
pub const STOCK_ADJUSTED: &str = "stock-adjusted";
/// A product crossed from positive to non-positive stock.
pub const STOCK_DEPLETED: &str = "stock-depleted";
/// A product crossed from non-positive back to positive stock.
pub const STOCK_RESTORED: &str = "stock-restored";

/// Topics the reconciliation engine consumes.
pub const INBOUND: [&str; 3] = [PRODUCT_CREATED, ORDER_CREATED, ORDER_CANCELLED];

/// Topics the reconciliation engine publishes.
pub const OUTBOUND: [&str; 3] = [STOCK_ADJUSTED, STOCK_DEPLETED, STOCK_RESTORED];
