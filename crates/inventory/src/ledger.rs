use serde::{Deserialize, Serialize};

use stockflow_core::ProductId;

use crate::notification::{StockAdjusted, StockDepleted, StockNotification, StockRestored};

/// One ledger row: the current stock of a product.
///
/// `quantity` is signed. A negative value is an oversold product and records
/// the true deficit for replenishment; it is never clamped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl StockRecord {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }

    pub fn level(&self) -> StockLevel {
        StockLevel::of(self.quantity)
    }
}

/// Per-product stock zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StockLevel {
    /// `quantity > 0`
    InStock,
    /// `quantity <= 0`
    Depleted,
}

impl StockLevel {
    pub fn of(quantity: i64) -> Self {
        if quantity > 0 {
            StockLevel::InStock
        } else {
            StockLevel::Depleted
        }
    }
}

/// A crossing of the zero boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StockTransition {
    /// InStock → Depleted
    Depleted,
    /// Depleted → InStock
    Restored,
}

impl StockTransition {
    /// Edge detection between two consecutive quantities of the same row.
    ///
    /// Returns `None` while the quantity stays in the same zone.
    pub fn between(previous: i64, current: i64) -> Option<Self> {
        match (StockLevel::of(previous), StockLevel::of(current)) {
            (StockLevel::InStock, StockLevel::Depleted) => Some(StockTransition::Depleted),
            (StockLevel::Depleted, StockLevel::InStock) => Some(StockTransition::Restored),
            _ => None,
        }
    }
}

/// The before/after of one atomic adjustment.
///
/// `previous` must come from the same atomic operation that produced
/// `current`; a separate read could observe someone else's write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerChange {
    pub product_id: ProductId,
    pub previous: i64,
    pub current: i64,
}

impl LedgerChange {
    pub fn new(product_id: ProductId, previous: i64, current: i64) -> Self {
        Self {
            product_id,
            previous,
            current,
        }
    }

    pub fn transition(&self) -> Option<StockTransition> {
        StockTransition::between(self.previous, self.current)
    }

    /// Notifications for this change, in publish order.
    ///
    /// `StockAdjusted` always comes first; a boundary crossing adds exactly one
    /// `StockDepleted` or `StockRestored` after it.
    pub fn notifications(&self) -> Vec<StockNotification> {
        let mut out = vec![StockNotification::Adjusted(StockAdjusted {
            product_id: self.product_id,
            new_quantity: self.current,
        })];

        match self.transition() {
            Some(StockTransition::Depleted) => {
                out.push(StockNotification::Depleted(StockDepleted {
                    product_id: self.product_id,
                }));
            }
            Some(StockTransition::Restored) => {
                out.push(StockNotification::Restored(StockRestored {
                    product_id: self.product_id,
                }));
            }
            None => {}
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ProductId {
        ProductId::new()
    }

    #[test]
    fn zero_counts_as_depleted() {
        assert_eq!(StockLevel::of(0), StockLevel::Depleted);
        assert_eq!(StockLevel::of(-3), StockLevel::Depleted);
        assert_eq!(StockLevel::of(1), StockLevel::InStock);
    }

    #[test]
    fn transitions_fire_only_on_crossing() {
        assert_eq!(StockTransition::between(10, 8), None);
        assert_eq!(StockTransition::between(8, 0), Some(StockTransition::Depleted));
        assert_eq!(StockTransition::between(0, -4), None);
        assert_eq!(StockTransition::between(-4, 3), Some(StockTransition::Restored));
        assert_eq!(StockTransition::between(0, 0), None);
    }

    #[test]
    fn depletion_follows_adjusted() {
        let p = pid();
        let n = LedgerChange::new(p, 8, 0).notifications();
        assert_eq!(
            n,
            vec![
                StockNotification::Adjusted(StockAdjusted {
                    product_id: p,
                    new_quantity: 0
                }),
                StockNotification::Depleted(StockDepleted { product_id: p }),
            ]
        );
    }

    #[test]
    fn oversell_keeps_the_deficit() {
        let p = pid();
        let change = LedgerChange::new(p, -2, -7);
        assert_eq!(change.transition(), None);
        assert_eq!(change.notifications().len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Depleted/Restored strictly alternate, and each fires only when
            /// the sign zone actually changes.
            #[test]
            fn edge_notifications_alternate(
                start in -20i64..20,
                deltas in proptest::collection::vec(-15i64..15, 0..60)
            ) {
                let p = ProductId::new();
                let mut qty = start;
                let mut last_edge: Option<StockTransition> = None;
                let mut adjusted = 0usize;

                for d in &deltas {
                    let change = LedgerChange::new(p, qty, qty + d);
                    qty += d;

                    for n in change.notifications() {
                        match n {
                            StockNotification::Adjusted(a) => {
                                prop_assert_eq!(a.new_quantity, qty);
                                adjusted += 1;
                            }
                            StockNotification::Depleted(_) => {
                                prop_assert_ne!(last_edge, Some(StockTransition::Depleted));
                                prop_assert!(change.previous > 0 && change.current <= 0);
                                last_edge = Some(StockTransition::Depleted);
                            }
                            StockNotification::Restored(_) => {
                                prop_assert_ne!(last_edge, Some(StockTransition::Restored));
                                prop_assert!(change.previous <= 0 && change.current > 0);
                                last_edge = Some(StockTransition::Restored);
                            }
                        }
                    }
                }

                prop_assert_eq!(adjusted, deltas.len());
                prop_assert_eq!(qty, start + deltas.iter().sum::<i64>());

                // The last edge seen agrees with the final zone whenever the
                // zone differs from where we started.
                if StockLevel::of(qty) != StockLevel::of(start) {
                    let expected = match StockLevel::of(qty) {
                        StockLevel::Depleted => StockTransition::Depleted,
                        StockLevel::InStock => StockTransition::Restored,
                    };
                    prop_assert_eq!(last_edge, Some(expected));
                }
            }
        }
    }
}
