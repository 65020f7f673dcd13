use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use stockflow_core::ProductId;
use stockflow_inventory::{LedgerChange, StockRecord};

use super::r#trait::{AdjustmentKey, AppliedAdjustment, LedgerError, StockLedgerStore};

#[derive(Debug, Default)]
struct LedgerState {
    quantities: HashMap<ProductId, i64>,
    /// Idempotency markers, written under the same lock as the quantity.
    applied: HashMap<AdjustmentKey, Marker>,
}

#[derive(Debug, Copy, Clone)]
struct Marker {
    change: LedgerChange,
    applied_at: DateTime<Utc>,
}

/// In-memory stock ledger.
///
/// Intended for tests/dev. One lock guards both quantities and markers, so
/// every mutation (including the marker write) is a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

fn poisoned() -> LedgerError {
    LedgerError::Unavailable("lock poisoned".to_string())
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, ordered by product id.
    pub fn records(&self) -> Result<Vec<StockRecord>, LedgerError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut out: Vec<_> = state
            .quantities
            .iter()
            .map(|(id, qty)| StockRecord::new(*id, *qty))
            .collect();
        out.sort_by_key(|r| r.product_id);
        Ok(out)
    }

    /// Number of idempotency markers recorded.
    pub fn applied_count(&self) -> usize {
        self.state.read().map(|s| s.applied.len()).unwrap_or(0)
    }
}

fn apply(state: &mut LedgerState, product_id: ProductId, delta: i64) -> Result<LedgerChange, LedgerError> {
    let quantity = state
        .quantities
        .get_mut(&product_id)
        .ok_or(LedgerError::NotFound(product_id))?;

    let previous = *quantity;
    let current = previous
        .checked_add(delta)
        .ok_or(LedgerError::Overflow(product_id))?;
    *quantity = current;

    Ok(LedgerChange::new(product_id, previous, current))
}

impl StockLedgerStore for InMemoryLedgerStore {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .quantities
            .get(&product_id)
            .map(|qty| StockRecord::new(product_id, *qty)))
    }

    fn create_if_absent(&self, product_id: ProductId, initial_quantity: i64) -> Result<bool, LedgerError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.quantities.contains_key(&product_id) {
            return Ok(false);
        }
        state.quantities.insert(product_id, initial_quantity);
        Ok(true)
    }

    fn atomic_adjust(&self, product_id: ProductId, delta: i64) -> Result<i64, LedgerError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        apply(&mut state, product_id, delta).map(|change| change.current)
    }

    fn adjust_once(
        &self,
        key: AdjustmentKey,
        product_id: ProductId,
        delta: i64,
    ) -> Result<AppliedAdjustment, LedgerError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;

        if let Some(Marker { change: recorded, .. }) = state.applied.get(&key) {
            if recorded.product_id != product_id {
                return Err(LedgerError::KeyReused {
                    key,
                    recorded_for: recorded.product_id,
                });
            }
            return Ok(AppliedAdjustment {
                change: *recorded,
                replayed: true,
            });
        }

        let change = apply(&mut state, product_id, delta)?;
        state.applied.insert(
            key,
            Marker {
                change,
                applied_at: Utc::now(),
            },
        );

        Ok(AppliedAdjustment {
            change,
            replayed: false,
        })
    }

    fn prune_markers(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let before = state.applied.len();
        state.applied.retain(|_, marker| marker.applied_at >= older_than);
        Ok((before - state.applied.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    #[test]
    fn create_if_absent_is_idempotent() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();

        assert!(store.create_if_absent(p, 0).unwrap());
        store.atomic_adjust(p, 5).unwrap();
        assert!(!store.create_if_absent(p, 0).unwrap());

        assert_eq!(store.get(p).unwrap(), Some(StockRecord::new(p, 5)));
    }

    #[test]
    fn adjust_of_missing_record_is_not_found() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();

        assert_eq!(store.atomic_adjust(p, -1), Err(LedgerError::NotFound(p)));
        assert_eq!(store.get(p).unwrap(), None);
    }

    #[test]
    fn quantity_may_go_negative() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();
        store.create_if_absent(p, 2).unwrap();

        assert_eq!(store.atomic_adjust(p, -5).unwrap(), -3);
    }

    #[test]
    fn overflow_is_reported_and_leaves_quantity() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();
        store.create_if_absent(p, i64::MAX - 1).unwrap();

        assert_eq!(store.atomic_adjust(p, 2), Err(LedgerError::Overflow(p)));
        assert_eq!(store.get(p).unwrap().unwrap().quantity, i64::MAX - 1);
    }

    #[test]
    fn adjust_once_replays_recorded_change() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();
        store.create_if_absent(p, 10).unwrap();
        let key = AdjustmentKey::new(Uuid::now_v7(), 0);

        let first = store.adjust_once(key, p, -4).unwrap();
        // Someone else moves the row in between.
        store.atomic_adjust(p, -1).unwrap();
        let second = store.adjust_once(key, p, -4).unwrap();

        assert_eq!(first.change, LedgerChange::new(p, 10, 6));
        assert!(!first.replayed);
        assert_eq!(second.change, first.change);
        assert!(second.replayed);
        assert_eq!(store.get(p).unwrap().unwrap().quantity, 5);
        assert_eq!(store.applied_count(), 1);
    }

    #[test]
    fn adjust_once_rejects_key_reuse_for_other_product() {
        let store = InMemoryLedgerStore::new();
        let (a, b) = (ProductId::new(), ProductId::new());
        store.create_if_absent(a, 1).unwrap();
        store.create_if_absent(b, 1).unwrap();
        let key = AdjustmentKey::new(Uuid::now_v7(), 3);

        store.adjust_once(key, a, -1).unwrap();
        assert_eq!(
            store.adjust_once(key, b, -1),
            Err(LedgerError::KeyReused {
                key,
                recorded_for: a
            })
        );
    }

    #[test]
    fn failed_adjust_once_records_no_marker() {
        let store = InMemoryLedgerStore::new();
        let key = AdjustmentKey::new(Uuid::now_v7(), 0);

        assert!(store.adjust_once(key, ProductId::new(), -1).is_err());
        assert_eq!(store.applied_count(), 0);
    }

    #[test]
    fn prune_drops_only_markers_before_cutoff() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();
        store.create_if_absent(p, 10).unwrap();

        let old = AdjustmentKey::new(Uuid::now_v7(), 0);
        store.adjust_once(old, p, -1).unwrap();
        thread::sleep(std::time::Duration::from_millis(5));
        let cutoff = Utc::now();
        thread::sleep(std::time::Duration::from_millis(5));
        let recent = AdjustmentKey::new(Uuid::now_v7(), 0);
        store.adjust_once(recent, p, -1).unwrap();

        assert_eq!(store.prune_markers(cutoff).unwrap(), 1);
        assert_eq!(store.applied_count(), 1);
        assert_eq!(store.get(p).unwrap().unwrap().quantity, 8);

        // The surviving marker still deduplicates.
        assert!(store.adjust_once(recent, p, -1).unwrap().replayed);
        assert_eq!(store.prune_markers(cutoff).unwrap(), 0);
    }

    #[test]
    fn pruned_key_is_applied_again() {
        let store = InMemoryLedgerStore::new();
        let p = ProductId::new();
        store.create_if_absent(p, 3).unwrap();
        let key = AdjustmentKey::new(Uuid::now_v7(), 0);

        store.adjust_once(key, p, -1).unwrap();
        let removed = store
            .prune_markers(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 1);

        let again = store.adjust_once(key, p, -1).unwrap();
        assert!(!again.replayed);
        assert_eq!(again.change, LedgerChange::new(p, 2, 1));
    }

    #[test]
    fn concurrent_decrements_serialize() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;

        let store = Arc::new(InMemoryLedgerStore::new());
        let p = ProductId::new();
        store.create_if_absent(p, 1_000).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| store.atomic_adjust(p, -1).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let total = (THREADS * PER_THREAD) as i64;
        assert_eq!(store.get(p).unwrap().unwrap().quantity, 1_000 - total);

        // Every caller saw a distinct post-adjust value.
        let distinct: HashSet<_> = results.iter().copied().collect();
        assert_eq!(distinct.len(), results.len());
    }
}
