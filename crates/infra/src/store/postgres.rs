//! Postgres-backed ledger store.
//!
//! ## Locking
//!
//! | Unit | Locks taken (in order) |
//! |------|------------------------|
//! | `update_document` / `delete_document` | `documents` row `FOR UPDATE` |
//! | `validate_document` | `documents` row `FOR UPDATE`, then one transaction-scoped advisory lock per touched quant key in ascending `(product, location)` order, then `stock_quants` rows `FOR UPDATE` |
//! | `reconcile` | advisory lock on the counted key, its `stock_quants` row `FOR UPDATE`, then the `ADJ` sequence row |
//! | `create_document` | the type's `document_sequences` row (via upsert) |
//!
//! Every document and stock unit draws its event sequence number from `ledger_event_seq`
//! after taking its locks and before committing, so units that contend for a row are
//! numbered in commit order. A unit that rolls back after drawing leaves a gap.
//!
//! Advisory locks stand in for rows that do not exist yet: `FOR UPDATE` cannot lock a row
//! that a concurrent receipt is about to create, and an absent row must stay absent (not
//! zero) when a validation fails. Readers need no locks; a single statement sees one MVCC
//! snapshot, so it never observes half of a committed unit.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Result |
//! |------------|----------------------|--------|
//! | Database (unique violation) | `23505` | business error chosen by the caller (duplicate SKU, rule, ...) |
//! | Database (check violation) | `23514` | `StoreError::Database` (a negative quantity reached the table) |
//! | Database (other) / PoolClosed / other | any | `StoreError::Database` |
//!
//! Any error drops the open transaction, which rolls it back.
//!
//! ## Runtime
//!
//! `LedgerStore` is synchronous. The trait impl drives the async methods with
//! `block_in_place` on the current tokio handle, so it must be called from a
//! multi-threaded runtime (or a thread that has entered one).

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{
    AggregateRoot, DocumentId, ExpectedVersion, LocationId, MoveId, ProductId, UserId,
    WarehouseId,
};
use stockledger_inventory::{
    Document, DocumentNumber, DocumentStatus, DocumentType, EntityKind, LedgerError,
    LedgerResult, LineQuantity, Location, LocationType, MovementLine, Product, QuantKey,
    QuantSnapshot, ReconcilePlan, ReorderRule, StockLevel, StockPlan, check_count_differs,
    plan_reconciliation, plan_validation, touched_keys,
};

use super::r#trait::{Committed, LedgerStore, RuleTotal, StoreError, StoreResult};
use crate::config::DatabaseSettings;

/// Tables and indexes the store expects. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id              UUID PRIMARY KEY,
    sku             TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    unit_of_measure TEXT NOT NULL,
    active          BOOLEAN NOT NULL
);

CREATE TABLE IF NOT EXISTS locations (
    id            UUID PRIMARY KEY,
    warehouse_id  UUID NOT NULL,
    name          TEXT NOT NULL,
    location_type TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS locations_one_adjustment_per_warehouse
    ON locations (warehouse_id) WHERE location_type = 'ADJUSTMENT';

CREATE TABLE IF NOT EXISTS stock_quants (
    product_id  UUID NOT NULL REFERENCES products (id),
    location_id UUID NOT NULL REFERENCES locations (id),
    quantity    BIGINT NOT NULL CHECK (quantity >= 0),
    PRIMARY KEY (product_id, location_id)
);

CREATE TABLE IF NOT EXISTS document_sequences (
    doc_type   TEXT PRIMARY KEY,
    last_value BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id               UUID PRIMARY KEY,
    number           TEXT NOT NULL UNIQUE,
    doc_type         TEXT NOT NULL,
    status           TEXT NOT NULL,
    from_location_id UUID REFERENCES locations (id),
    to_location_id   UUID REFERENCES locations (id),
    counterparty     TEXT,
    scheduled_date   TIMESTAMPTZ,
    created_by       UUID NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    validated_by     UUID,
    validated_at     TIMESTAMPTZ,
    version          BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_moves (
    id               UUID PRIMARY KEY,
    document_id      UUID NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
    position         INTEGER NOT NULL,
    product_id       UUID NOT NULL REFERENCES products (id),
    from_location_id UUID REFERENCES locations (id),
    to_location_id   UUID REFERENCES locations (id),
    quantity_kind    TEXT NOT NULL,
    quantity         BIGINT NOT NULL,
    UNIQUE (document_id, position)
);

CREATE SEQUENCE IF NOT EXISTS ledger_event_seq;

CREATE TABLE IF NOT EXISTS reorder_rules (
    product_id    UUID PRIMARY KEY REFERENCES products (id),
    min_qty       BIGINT NOT NULL CHECK (min_qty >= 0),
    preferred_qty BIGINT CHECK (preferred_qty >= 0)
);
"#;

/// Postgres-backed ledger store.
///
/// `Clone` is cheap (the pool is shared).
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool sized by `settings`.
    pub async fn connect(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout())
            .connect(&settings.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create missing tables and indexes.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id, sku = %product.sku))]
    pub async fn insert_product(&self, product: Product) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, name, unit_of_measure, active)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(&product.unit_of_measure)
        .bind(product.active)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::validation(format!(
                    "product {} or sku {} already exists",
                    product.id, product.sku
                ))
            } else {
                map_sqlx_error("insert_product", e).into()
            }
        })?;
        Ok(())
    }

    pub async fn product(&self, id: ProductId) -> LedgerResult<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, sku, name, unit_of_measure, active FROM products WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("product", e))?;
        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    #[instrument(skip(self, location), fields(location_id = %location.id, warehouse_id = %location.warehouse_id))]
    pub async fn insert_location(&self, location: Location) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO locations (id, warehouse_id, name, location_type)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(location.id.as_uuid())
        .bind(location.warehouse_id.as_uuid())
        .bind(&location.name)
        .bind(location.location_type.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::validation(format!(
                    "location {} already exists or warehouse {} already has an adjustment location",
                    location.id, location.warehouse_id
                ))
            } else {
                map_sqlx_error("insert_location", e).into()
            }
        })?;
        Ok(())
    }

    pub async fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        let row = sqlx::query(
            "SELECT id, warehouse_id, name, location_type FROM locations WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("location", e))?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    pub async fn adjustment_location(
        &self,
        warehouse: WarehouseId,
    ) -> LedgerResult<Option<Location>> {
        let row = sqlx::query(
            r#"
            SELECT id, warehouse_id, name, location_type
            FROM locations
            WHERE warehouse_id = $1 AND location_type = 'ADJUSTMENT'
            "#,
        )
        .bind(warehouse.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("adjustment_location", e))?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    #[instrument(skip(self, build), fields(doc_type = %doc_type))]
    pub async fn create_document<F>(
        &self,
        doc_type: DocumentType,
        build: F,
    ) -> LedgerResult<Committed<Document>>
    where
        F: FnOnce(DocumentNumber) -> LedgerResult<Document>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let number = allocate_number(&mut tx, doc_type).await?;
        let document = build(number)?;
        insert_document(&mut tx, &document).await?;
        let sequence = next_event(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Committed::new(document, sequence))
    }

    pub async fn document(&self, id: DocumentId) -> LedgerResult<Option<Document>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(load_document(&mut conn, id, false).await?)
    }

    #[instrument(skip(self, edit), fields(document_id = %id, expected = ?expected))]
    pub async fn update_document<T, F>(
        &self,
        id: DocumentId,
        expected: ExpectedVersion,
        edit: F,
    ) -> LedgerResult<Committed<(Document, T)>>
    where
        F: FnOnce(&mut Document) -> LedgerResult<T>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut document = load_document(&mut tx, id, true)
            .await?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        document.check_version(expected)?;
        let before = document.version();
        let outcome = edit(&mut document)?;
        if document.version() == before {
            return Ok(Committed::unchanged((document, outcome)));
        }
        save_document(&mut tx, &document).await?;
        let sequence = next_event(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Committed::new((document, outcome), sequence))
    }

    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn delete_document(&self, id: DocumentId) -> LedgerResult<Committed<Document>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let document = load_document(&mut tx, id, true)
            .await?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        document.check_deletable()?;
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_document", e))?;
        let sequence = next_event(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Committed::new(document, sequence))
    }

    #[instrument(skip(self, at), fields(document_id = %id, actor = %actor, rows_written = tracing::field::Empty))]
    pub async fn validate_document(
        &self,
        id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Committed<(Document, StockPlan)>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut document = load_document(&mut tx, id, true)
            .await?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        document.check_validate()?;

        let snapshot = lock_quants(&mut tx, &touched_keys(&document)).await?;
        let plan = plan_validation(&document, &snapshot)?;
        document.mark_validated(actor, at)?;

        write_quants(&mut tx, &plan.writes).await?;
        save_header(&mut tx, &document).await?;
        let sequence = next_event(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("rows_written", plan.writes.len());
        Ok(Committed::new((document, plan), sequence))
    }

    #[instrument(skip(self, counterpart, build), fields(product_id = %key.product, location_id = %key.location, counted))]
    pub async fn reconcile<F>(
        &self,
        key: QuantKey,
        counterpart: LedgerResult<LocationId>,
        counted: i64,
        build: F,
    ) -> LedgerResult<Committed<(Document, ReconcilePlan)>>
    where
        F: FnOnce(DocumentNumber, &ReconcilePlan) -> Document,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let snapshot = lock_quants(&mut tx, &BTreeSet::from([key])).await?;
        let current = snapshot.get(&key).copied().flatten();
        let counterpart = match counterpart {
            Ok(location) => location,
            Err(missing) => {
                check_count_differs(key.product, key.location, current, counted)?;
                return Err(missing);
            }
        };
        let plan = plan_reconciliation(key.product, key.location, counterpart, current, counted)?;

        let number = allocate_number(&mut tx, DocumentType::Adjustment).await?;
        let document = build(number, &plan);
        write_quants(&mut tx, &BTreeMap::from([(key, plan.counted)])).await?;
        insert_document(&mut tx, &document).await?;
        let sequence = next_event(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Committed::new((document, plan), sequence))
    }

    pub async fn stock(&self, product: ProductId) -> LedgerResult<Vec<StockLevel>> {
        let rows = sqlx::query(
            r#"
            SELECT q.location_id, l.warehouse_id, q.quantity
            FROM stock_quants q
            JOIN locations l ON l.id = q.location_id
            WHERE q.product_id = $1
            ORDER BY q.location_id
            "#,
        )
        .bind(product.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock", e))?;

        let levels = rows
            .iter()
            .map(|row| -> StoreResult<StockLevel> {
                Ok(StockLevel {
                    location: LocationId::from_uuid(get(row, "stock_quants", "location_id")?),
                    warehouse: WarehouseId::from_uuid(get(row, "stock_quants", "warehouse_id")?),
                    quantity: get(row, "stock_quants", "quantity")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(levels)
    }

    pub async fn quantity(&self, key: QuantKey) -> LedgerResult<Option<i64>> {
        let quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM stock_quants WHERE product_id = $1 AND location_id = $2",
        )
        .bind(key.product.as_uuid())
        .bind(key.location.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quantity", e))?;
        Ok(quantity)
    }

    #[instrument(skip(self, rule), fields(product_id = %rule.product))]
    pub async fn insert_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO reorder_rules (product_id, min_qty, preferred_qty) VALUES ($1, $2, $3)",
        )
        .bind(rule.product.as_uuid())
        .bind(rule.min_qty)
        .bind(rule.preferred_qty)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::DuplicateReorderRule {
                    product: rule.product,
                }
            } else {
                map_sqlx_error("insert_reorder_rule", e).into()
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, rule), fields(product_id = %rule.product))]
    pub async fn replace_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE reorder_rules SET min_qty = $2, preferred_qty = $3 WHERE product_id = $1",
        )
        .bind(rule.product.as_uuid())
        .bind(rule.min_qty)
        .bind(rule.preferred_qty)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("replace_reorder_rule", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found(EntityKind::ReorderRule, rule.product));
        }
        Ok(())
    }

    pub async fn remove_reorder_rule(
        &self,
        product: ProductId,
    ) -> LedgerResult<Option<ReorderRule>> {
        let row = sqlx::query(
            r#"
            DELETE FROM reorder_rules WHERE product_id = $1
            RETURNING product_id, min_qty, preferred_qty
            "#,
        )
        .bind(product.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_reorder_rule", e))?;
        Ok(row.as_ref().map(rule_from_row).transpose()?)
    }

    pub async fn reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        let row = sqlx::query(
            "SELECT product_id, min_qty, preferred_qty FROM reorder_rules WHERE product_id = $1",
        )
        .bind(product.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reorder_rule", e))?;
        Ok(row.as_ref().map(rule_from_row).transpose()?)
    }

    pub async fn low_stock_candidates(&self) -> LedgerResult<Vec<RuleTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT
                p.id, p.sku, p.name, p.unit_of_measure, p.active,
                r.product_id, r.min_qty, r.preferred_qty,
                COALESCE(
                    (SELECT SUM(q.quantity) FROM stock_quants q WHERE q.product_id = p.id),
                    0
                )::BIGINT AS total
            FROM reorder_rules r
            JOIN products p ON p.id = r.product_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("low_stock_candidates", e))?;

        let candidates = rows
            .iter()
            .map(|row| -> StoreResult<RuleTotal> {
                Ok((
                    product_from_row(row)?,
                    rule_from_row(row)?,
                    get(row, "stock_quants", "total")?,
                ))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(candidates)
    }
}

/// Run a store future to completion from synchronous code.
fn block_on<T>(future: impl Future<Output = LedgerResult<T>>) -> LedgerResult<T> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::Runtime(
            "PostgresLedgerStore requires a tokio runtime; call it from within one".to_string(),
        )
    })?;
    tokio::task::block_in_place(|| handle.block_on(future))
}

impl LedgerStore for PostgresLedgerStore {
    fn insert_product(&self, product: Product) -> LedgerResult<()> {
        block_on(self.insert_product(product))
    }

    fn product(&self, id: ProductId) -> LedgerResult<Option<Product>> {
        block_on(self.product(id))
    }

    fn insert_location(&self, location: Location) -> LedgerResult<()> {
        block_on(self.insert_location(location))
    }

    fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        block_on(self.location(id))
    }

    fn adjustment_location(&self, warehouse: WarehouseId) -> LedgerResult<Option<Location>> {
        block_on(self.adjustment_location(warehouse))
    }

    fn create_document<F>(
        &self,
        doc_type: DocumentType,
        build: F,
    ) -> LedgerResult<Committed<Document>>
    where
        F: FnOnce(DocumentNumber) -> LedgerResult<Document>,
    {
        block_on(self.create_document(doc_type, build))
    }

    fn document(&self, id: DocumentId) -> LedgerResult<Option<Document>> {
        block_on(self.document(id))
    }

    fn update_document<T, F>(
        &self,
        id: DocumentId,
        expected: ExpectedVersion,
        edit: F,
    ) -> LedgerResult<Committed<(Document, T)>>
    where
        F: FnOnce(&mut Document) -> LedgerResult<T>,
    {
        block_on(self.update_document(id, expected, edit))
    }

    fn delete_document(&self, id: DocumentId) -> LedgerResult<Committed<Document>> {
        block_on(self.delete_document(id))
    }

    fn validate_document(
        &self,
        id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Committed<(Document, StockPlan)>> {
        block_on(self.validate_document(id, actor, at))
    }

    fn reconcile<F>(
        &self,
        key: QuantKey,
        counterpart: LedgerResult<LocationId>,
        counted: i64,
        build: F,
    ) -> LedgerResult<Committed<(Document, ReconcilePlan)>>
    where
        F: FnOnce(DocumentNumber, &ReconcilePlan) -> Document,
    {
        block_on(self.reconcile(key, counterpart, counted, build))
    }

    fn stock(&self, product: ProductId) -> LedgerResult<Vec<StockLevel>> {
        block_on(self.stock(product))
    }

    fn quantity(&self, key: QuantKey) -> LedgerResult<Option<i64>> {
        block_on(self.quantity(key))
    }

    fn insert_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        block_on(self.insert_reorder_rule(rule))
    }

    fn replace_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        block_on(self.replace_reorder_rule(rule))
    }

    fn remove_reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        block_on(self.remove_reorder_rule(product))
    }

    fn reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        block_on(self.reorder_rule(product))
    }

    fn low_stock_candidates(&self) -> LedgerResult<Vec<RuleTotal>> {
        block_on(self.low_stock_candidates())
    }
}

/// Next number for `doc_type`, locking its sequence row until the transaction ends.
async fn allocate_number(
    conn: &mut PgConnection,
    doc_type: DocumentType,
) -> StoreResult<DocumentNumber> {
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO document_sequences (doc_type, last_value)
        VALUES ($1, 1)
        ON CONFLICT (doc_type)
        DO UPDATE SET last_value = document_sequences.last_value + 1
        RETURNING last_value
        "#,
    )
    .bind(doc_type.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("allocate_number", e))?;
    Ok(DocumentNumber::format(doc_type, sequence as u64))
}

/// Envelope sequence number for the unit running on `conn`.
async fn next_event(conn: &mut PgConnection) -> StoreResult<u64> {
    let sequence: i64 = sqlx::query_scalar("SELECT nextval('ledger_event_seq')")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("next_event", e))?;
    Ok(sequence as u64)
}

/// Lock `keys` in ascending order and read their current values.
async fn lock_quants(
    conn: &mut PgConnection,
    keys: &BTreeSet<QuantKey>,
) -> StoreResult<QuantSnapshot> {
    let mut snapshot = QuantSnapshot::new();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("stock_quant:{}:{}", key.product, key.location))
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("lock_quant", e))?;

        let quantity: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT quantity FROM stock_quants
            WHERE product_id = $1 AND location_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.product.as_uuid())
        .bind(key.location.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("read_quant", e))?;
        snapshot.insert(*key, quantity);
    }
    Ok(snapshot)
}

async fn write_quants(conn: &mut PgConnection, writes: &BTreeMap<QuantKey, i64>) -> StoreResult<()> {
    for (key, quantity) in writes {
        sqlx::query(
            r#"
            INSERT INTO stock_quants (product_id, location_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id, location_id)
            DO UPDATE SET quantity = EXCLUDED.quantity
            "#,
        )
        .bind(key.product.as_uuid())
        .bind(key.location.as_uuid())
        .bind(*quantity)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("write_quant", e))?;
    }
    Ok(())
}

async fn load_document(
    conn: &mut PgConnection,
    id: DocumentId,
    for_update: bool,
) -> StoreResult<Option<Document>> {
    let sql = if for_update {
        "SELECT * FROM documents WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM documents WHERE id = $1"
    };
    let Some(header) = sqlx::query(sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_document", e))?
    else {
        return Ok(None);
    };

    let line_rows = sqlx::query(
        r#"
        SELECT id, product_id, from_location_id, to_location_id, quantity_kind, quantity
        FROM stock_moves
        WHERE document_id = $1
        ORDER BY position
        "#,
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_lines", e))?;
    let lines = line_rows
        .iter()
        .map(line_from_row)
        .collect::<StoreResult<Vec<_>>>()?;

    document_from_row(&header, lines).map(Some)
}

async fn insert_document(conn: &mut PgConnection, document: &Document) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (
            id, number, doc_type, status, from_location_id, to_location_id, counterparty,
            scheduled_date, created_by, created_at, validated_by, validated_at, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(document.document_id().as_uuid())
    .bind(document.number().as_str())
    .bind(document.doc_type().as_str())
    .bind(document.status().as_str())
    .bind(document.from_location().map(Uuid::from))
    .bind(document.to_location().map(Uuid::from))
    .bind(document.counterparty())
    .bind(document.scheduled_date())
    .bind(document.created_by().as_uuid())
    .bind(document.created_at())
    .bind(document.validated_by().map(Uuid::from))
    .bind(document.validated_at())
    .bind(version_column(document))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_document", e))?;

    insert_lines(conn, document).await
}

/// Persist header and lines of an existing document.
async fn save_document(conn: &mut PgConnection, document: &Document) -> StoreResult<()> {
    save_header(conn, document).await?;
    sqlx::query("DELETE FROM stock_moves WHERE document_id = $1")
        .bind(document.document_id().as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_lines", e))?;
    insert_lines(conn, document).await
}

async fn save_header(conn: &mut PgConnection, document: &Document) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE documents SET
            status = $2,
            from_location_id = $3,
            to_location_id = $4,
            counterparty = $5,
            scheduled_date = $6,
            validated_by = $7,
            validated_at = $8,
            version = $9
        WHERE id = $1
        "#,
    )
    .bind(document.document_id().as_uuid())
    .bind(document.status().as_str())
    .bind(document.from_location().map(Uuid::from))
    .bind(document.to_location().map(Uuid::from))
    .bind(document.counterparty())
    .bind(document.scheduled_date())
    .bind(document.validated_by().map(Uuid::from))
    .bind(document.validated_at())
    .bind(version_column(document))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_document", e))?;
    Ok(())
}

async fn insert_lines(conn: &mut PgConnection, document: &Document) -> StoreResult<()> {
    for (position, line) in document.lines().iter().enumerate() {
        let (kind, quantity) = quantity_columns(&line.quantity);
        sqlx::query(
            r#"
            INSERT INTO stock_moves (
                id, document_id, position, product_id, from_location_id, to_location_id,
                quantity_kind, quantity
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(line.id.as_uuid())
        .bind(document.document_id().as_uuid())
        .bind(position as i32)
        .bind(line.product.as_uuid())
        .bind(line.from_location.map(Uuid::from))
        .bind(line.to_location.map(Uuid::from))
        .bind(kind)
        .bind(quantity)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_line", e))?;
    }
    Ok(())
}

fn version_column(document: &Document) -> i64 {
    document.version() as i64
}

fn quantity_columns(quantity: &LineQuantity) -> (&'static str, i64) {
    match *quantity {
        LineQuantity::Amount(q) => ("amount", q),
        LineQuantity::TargetCount(q) => ("target_count", q),
        LineQuantity::CountDelta(q) => ("count_delta", q),
    }
}

fn get<'r, T>(row: &'r PgRow, table: &'static str, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| StoreError::Corrupt {
        table,
        message: format!("{column}: {e}"),
    })
}

fn corrupt(table: &'static str, message: String) -> StoreError {
    StoreError::Corrupt { table, message }
}

fn product_from_row(row: &PgRow) -> StoreResult<Product> {
    Ok(Product {
        id: ProductId::from_uuid(get(row, "products", "id")?),
        sku: get(row, "products", "sku")?,
        name: get(row, "products", "name")?,
        unit_of_measure: get(row, "products", "unit_of_measure")?,
        active: get(row, "products", "active")?,
    })
}

fn location_from_row(row: &PgRow) -> StoreResult<Location> {
    let raw_type: String = get(row, "locations", "location_type")?;
    let location_type = LocationType::parse(&raw_type)
        .ok_or_else(|| corrupt("locations", format!("unknown location type {raw_type}")))?;
    Ok(Location {
        id: LocationId::from_uuid(get(row, "locations", "id")?),
        warehouse_id: WarehouseId::from_uuid(get(row, "locations", "warehouse_id")?),
        name: get(row, "locations", "name")?,
        location_type,
    })
}

fn rule_from_row(row: &PgRow) -> StoreResult<ReorderRule> {
    Ok(ReorderRule {
        product: ProductId::from_uuid(get(row, "reorder_rules", "product_id")?),
        min_qty: get(row, "reorder_rules", "min_qty")?,
        preferred_qty: get(row, "reorder_rules", "preferred_qty")?,
    })
}

fn line_from_row(row: &PgRow) -> StoreResult<MovementLine> {
    let kind: String = get(row, "stock_moves", "quantity_kind")?;
    let value: i64 = get(row, "stock_moves", "quantity")?;
    let quantity = match kind.as_str() {
        "amount" => LineQuantity::Amount(value),
        "target_count" => LineQuantity::TargetCount(value),
        "count_delta" => LineQuantity::CountDelta(value),
        other => return Err(corrupt("stock_moves", format!("unknown quantity kind {other}"))),
    };
    let from_location: Option<Uuid> = get(row, "stock_moves", "from_location_id")?;
    let to_location: Option<Uuid> = get(row, "stock_moves", "to_location_id")?;
    Ok(MovementLine {
        id: MoveId::from_uuid(get(row, "stock_moves", "id")?),
        product: ProductId::from_uuid(get(row, "stock_moves", "product_id")?),
        from_location: from_location.map(LocationId::from_uuid),
        to_location: to_location.map(LocationId::from_uuid),
        quantity,
    })
}

fn document_from_row(row: &PgRow, lines: Vec<MovementLine>) -> StoreResult<Document> {
    let raw_number: String = get(row, "documents", "number")?;
    let raw_type: String = get(row, "documents", "doc_type")?;
    let raw_status: String = get(row, "documents", "status")?;
    let doc_type = DocumentType::parse(&raw_type)
        .ok_or_else(|| corrupt("documents", format!("unknown document type {raw_type}")))?;
    let status = DocumentStatus::parse(&raw_status)
        .ok_or_else(|| corrupt("documents", format!("unknown status {raw_status}")))?;
    let number = DocumentNumber::parse(&raw_number)
        .map(|(t, sequence)| DocumentNumber::format(t, sequence))
        .ok_or_else(|| corrupt("documents", format!("malformed number {raw_number}")))?;

    let from_location: Option<Uuid> = get(row, "documents", "from_location_id")?;
    let to_location: Option<Uuid> = get(row, "documents", "to_location_id")?;
    let validated_by: Option<Uuid> = get(row, "documents", "validated_by")?;
    let version: i64 = get(row, "documents", "version")?;

    Ok(Document::restore(
        DocumentId::from_uuid(get(row, "documents", "id")?),
        number,
        doc_type,
        status,
        from_location.map(LocationId::from_uuid),
        to_location.map(LocationId::from_uuid),
        get(row, "documents", "counterparty")?,
        get(row, "documents", "scheduled_date")?,
        UserId::from_uuid(get(row, "documents", "created_by")?),
        get(row, "documents", "created_at")?,
        validated_by.map(UserId::from_uuid),
        get(row, "documents", "validated_at")?,
        lines,
        version as u64,
    ))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    let message = match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("[{}] {}", code, db_err.message()),
            None => db_err.message().to_string(),
        },
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        sqlx::Error::RowNotFound => "unexpected row not found".to_string(),
        other => other.to_string(),
    };
    StoreError::Database { operation, message }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
