//! Postgres-backed stock ledger.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (numeric out of range) | `22003` | `Overflow` | `quantity + delta` exceeds BIGINT |
//! | Database (serialization / deadlock) | `40001`, `40P01` | `Unavailable` | Transaction aborted, safe to retry |
//! | Database (foreign key violation) | `23503` | `NotFound` | Marker written for a product without a row |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Unavailable` | Backend unreachable |
//! | (statement deadline) | N/A | `Timeout` | Operation exceeded the configured timeout |
//!
//! ## Runtime
//!
//! `StockLedgerStore` is synchronous and is called from worker threads that
//! are not tokio workers. The store keeps a handle to the runtime it was built
//! on and blocks on it; calling the sync trait from inside an async task would
//! panic, so async callers use the inherent `*_async` methods instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};
use uuid::Uuid;

use stockflow_core::ProductId;
use stockflow_inventory::{LedgerChange, StockRecord};

use super::r#trait::{AdjustmentKey, AppliedAdjustment, LedgerError, StockLedgerStore};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

/// Postgres-backed stock ledger.
///
/// Every adjustment is a single `UPDATE ... RETURNING`, so concurrent writers
/// to the same product serialize on the row lock and each sees the value its
/// own update produced. `adjust_once` wraps the update and the marker insert
/// in one transaction.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    runtime: Handle,
    timeout: Duration,
}

impl PostgresLedgerStore {
    /// `runtime` must outlive the store and must not be the caller's own
    /// current-thread runtime.
    pub fn new(pool: PgPool, runtime: Handle, timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            timeout,
        }
    }

    /// Create the ledger tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", None, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn get_async(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerError> {
        let row = sqlx::query("SELECT quantity FROM stock_ledger WHERE product_id = $1")
            .bind(product_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", Some(product_id), e))?;

        row.map(|r| {
            r.try_get::<i64, _>("quantity")
                .map(|qty| StockRecord::new(product_id, qty))
                .map_err(|e| map_sqlx_error("get", Some(product_id), e))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn create_if_absent_async(
        &self,
        product_id: ProductId,
        initial_quantity: i64,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_ledger (product_id, quantity)
            VALUES ($1, $2)
            ON CONFLICT (product_id) DO NOTHING
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(initial_quantity)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_if_absent", Some(product_id), e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn atomic_adjust_async(&self, product_id: ProductId, delta: i64) -> Result<i64, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE stock_ledger
            SET quantity = quantity + $2, updated_at = NOW()
            WHERE product_id = $1
            RETURNING quantity
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(delta)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("atomic_adjust", Some(product_id), e))?
        .ok_or(LedgerError::NotFound(product_id))?;

        row.try_get::<i64, _>("quantity")
            .map_err(|e| map_sqlx_error("atomic_adjust", Some(product_id), e))
    }

    /// Apply `delta` once per `key`.
    ///
    /// In one transaction:
    /// 1. Look up the marker; if present, return it as a replay
    /// 2. `UPDATE ... RETURNING` the new quantity
    /// 3. Insert the marker with `ON CONFLICT DO NOTHING`
    ///
    /// If step 3 inserts nothing, a concurrent delivery of the same key won the
    /// race: roll back (undoing step 2) and return the winner's marker.
    #[instrument(
        skip(self),
        fields(key = %key, product_id = %product_id, replayed = tracing::field::Empty),
        err
    )]
    pub async fn adjust_once_async(
        &self,
        key: AdjustmentKey,
        product_id: ProductId,
        delta: i64,
    ) -> Result<AppliedAdjustment, LedgerError> {
        let line = i32::try_from(key.line)
            .map_err(|_| LedgerError::Unavailable(format!("line index {} out of range", key.line)))?;
        let map = |e: sqlx::Error| map_sqlx_error("adjust_once", Some(product_id), e);

        let mut tx = self.pool.begin().await.map_err(map)?;

        if let Some(recorded) = load_marker(&mut tx, key.event_id, line).await.map_err(map)? {
            tx.rollback().await.map_err(map)?;
            Span::current().record("replayed", true);
            return replay(key, product_id, recorded);
        }

        let current: i64 = sqlx::query(
            r#"
            UPDATE stock_ledger
            SET quantity = quantity + $2, updated_at = NOW()
            WHERE product_id = $1
            RETURNING quantity
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map)?
        .ok_or(LedgerError::NotFound(product_id))?
        .try_get("quantity")
        .map_err(map)?;

        let previous = current - delta;

        let inserted = sqlx::query(
            r#"
            INSERT INTO stock_adjustments
                (event_id, line, product_id, previous_quantity, new_quantity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id, line) DO NOTHING
            "#,
        )
        .bind(key.event_id)
        .bind(line)
        .bind(product_id.as_uuid())
        .bind(previous)
        .bind(current)
        .execute(&mut *tx)
        .await
        .map_err(map)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(map)?;
            let recorded = load_marker_from_pool(&self.pool, key.event_id, line)
                .await
                .map_err(map)?
                .ok_or_else(|| LedgerError::Unavailable(format!("marker {key} vanished after conflict")))?;
            Span::current().record("replayed", true);
            return replay(key, product_id, recorded);
        }

        tx.commit().await.map_err(map)?;
        Span::current().record("replayed", false);

        Ok(AppliedAdjustment {
            change: LedgerChange::new(product_id, previous, current),
            replayed: false,
        })
    }

    #[instrument(skip(self), fields(removed = tracing::field::Empty), err)]
    pub async fn prune_markers_async(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        let removed = sqlx::query("DELETE FROM stock_adjustments WHERE applied_at < $1")
            .bind(older_than)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_markers", None, e))?
            .rows_affected();

        Span::current().record("removed", removed);
        Ok(removed)
    }

    /// Run one of the async operations to completion under the store timeout.
    fn block_on<T, F>(&self, operation: F) -> Result<T, LedgerError>
    where
        F: std::future::Future<Output = Result<T, LedgerError>>,
    {
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            tokio::time::timeout(timeout, operation)
                .await
                .unwrap_or_else(|_| Err(LedgerError::Timeout(timeout)))
        })
    }
}

fn replay(key: AdjustmentKey, product_id: ProductId, recorded: LedgerChange) -> Result<AppliedAdjustment, LedgerError> {
    if recorded.product_id != product_id {
        return Err(LedgerError::KeyReused {
            key,
            recorded_for: recorded.product_id,
        });
    }
    Ok(AppliedAdjustment {
        change: recorded,
        replayed: true,
    })
}

const MARKER_QUERY: &str = r#"
    SELECT product_id, previous_quantity, new_quantity
    FROM stock_adjustments
    WHERE event_id = $1 AND line = $2
"#;

fn marker_from_row(row: &sqlx::postgres::PgRow) -> Result<LedgerChange, sqlx::Error> {
    Ok(LedgerChange::new(
        ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
        row.try_get("previous_quantity")?,
        row.try_get("new_quantity")?,
    ))
}

async fn load_marker(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    line: i32,
) -> Result<Option<LedgerChange>, sqlx::Error> {
    sqlx::query(MARKER_QUERY)
        .bind(event_id)
        .bind(line)
        .fetch_optional(&mut **tx)
        .await?
        .as_ref()
        .map(marker_from_row)
        .transpose()
}

async fn load_marker_from_pool(pool: &PgPool, event_id: Uuid, line: i32) -> Result<Option<LedgerChange>, sqlx::Error> {
    sqlx::query(MARKER_QUERY)
        .bind(event_id)
        .bind(line)
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(marker_from_row)
        .transpose()
}

impl StockLedgerStore for PostgresLedgerStore {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerError> {
        self.block_on(self.get_async(product_id))
    }

    fn create_if_absent(&self, product_id: ProductId, initial_quantity: i64) -> Result<bool, LedgerError> {
        self.block_on(self.create_if_absent_async(product_id, initial_quantity))
    }

    fn atomic_adjust(&self, product_id: ProductId, delta: i64) -> Result<i64, LedgerError> {
        self.block_on(self.atomic_adjust_async(product_id, delta))
    }

    fn adjust_once(
        &self,
        key: AdjustmentKey,
        product_id: ProductId,
        delta: i64,
    ) -> Result<AppliedAdjustment, LedgerError> {
        self.block_on(self.adjust_once_async(key, product_id, delta))
    }

    fn prune_markers(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.block_on(self.prune_markers_async(older_than))
    }
}

/// Map SQLx errors to `LedgerError`.
///
/// See the module docs for the full table.
fn map_sqlx_error(operation: &str, product_id: Option<ProductId>, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match (db_err.code().as_deref(), product_id) {
                (Some("22003"), Some(p)) => LedgerError::Overflow(p),
                (Some("23503"), Some(p)) => LedgerError::NotFound(p),
                _ => LedgerError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
