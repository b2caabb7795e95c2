use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockledger_core::{DocumentId, ExpectedVersion, LocationId, ProductId, UserId, WarehouseId};
use stockledger_inventory::{
    Document, DocumentNumber, DocumentType, LedgerError, LedgerResult, Location, Product,
    QuantKey, ReconcilePlan, ReorderRule, StockLevel, StockPlan,
};

/// Storage failure (never a business outcome).
///
/// Every variant surfaces to callers as `LedgerError::Storage` after the unit of work has
/// been rolled back.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A thread panicked while holding one of the store's locks.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },

    /// A persisted row could not be turned back into a domain value.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("async runtime unavailable: {0}")]
    Runtime(String),
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        LedgerError::storage(value.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Output of a mutating unit, with the event sequence number the store drew for it.
///
/// The number is drawn after the unit's checks pass and before it releases its locks, so
/// units over the same quant row or document are numbered in the order they committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    /// `None` when the unit turned out to change nothing (an edit that left the document's
    /// version alone); nothing was written and no number was used.
    pub sequence: Option<u64>,
}

impl<T> Committed<T> {
    pub fn new(value: T, sequence: u64) -> Self {
        Self {
            value,
            sequence: Some(sequence),
        }
    }

    pub fn unchanged(value: T) -> Self {
        Self {
            value,
            sequence: None,
        }
    }
}

/// Low-stock input row: an active-or-not product, its rule and its total across locations.
pub type RuleTotal = (Product, ReorderRule, i64);

/// Durable home of the ledger: catalog references, documents, quant rows and reorder rules.
///
/// ## Atomic units
///
/// Every mutating method is one atomic unit. The closure-taking methods run their closure
/// while holding the unit's locks; if the closure (or any check) fails, nothing is written.
/// Document and stock units return [`Committed`], stamped with an event sequence number
/// drawn from one store-wide counter while the unit still holds its locks.
///
/// - `create_document` allocates the document number and inserts in one unit.
/// - `update_document` serializes on the document (per-document lock / `FOR UPDATE`).
/// - `validate_document` locks the document, then every quant row it touches in ascending
///   [`QuantKey`] order, plans, and writes rows plus the DONE flip together.
/// - `reconcile` locks the counted row, plans against its current value, and writes the row
///   plus a DONE adjustment document together.
///
/// Readers of several quant rows (`stock`, `low_stock_candidates`) take the same ordered
/// locks so they never observe half of a unit.
pub trait LedgerStore: Send + Sync {
    // catalog

    /// Fails with `Validation` if the id or SKU is already taken.
    fn insert_product(&self, product: Product) -> LedgerResult<()>;

    fn product(&self, id: ProductId) -> LedgerResult<Option<Product>>;

    /// Fails with `Validation` if the id is taken or the warehouse already has an
    /// ADJUSTMENT location and `location` is another one.
    fn insert_location(&self, location: Location) -> LedgerResult<()>;

    fn location(&self, id: LocationId) -> LedgerResult<Option<Location>>;

    fn adjustment_location(&self, warehouse: WarehouseId) -> LedgerResult<Option<Location>>;

    // documents

    fn create_document<F>(
        &self,
        doc_type: DocumentType,
        build: F,
    ) -> LedgerResult<Committed<Document>>
    where
        F: FnOnce(DocumentNumber) -> LedgerResult<Document>;

    fn document(&self, id: DocumentId) -> LedgerResult<Option<Document>>;

    /// Run `edit` against the current document under its lock and persist the result.
    /// Returns the stored document and whatever `edit` returned. An edit that leaves the
    /// version unchanged is not written and comes back [`Committed::unchanged`].
    fn update_document<T, F>(
        &self,
        id: DocumentId,
        expected: ExpectedVersion,
        edit: F,
    ) -> LedgerResult<Committed<(Document, T)>>
    where
        F: FnOnce(&mut Document) -> LedgerResult<T>;

    /// Remove an open or canceled document and its lines.
    fn delete_document(&self, id: DocumentId) -> LedgerResult<Committed<Document>>;

    fn validate_document(
        &self,
        id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Committed<(Document, StockPlan)>>;

    /// `counterpart` is the warehouse's ADJUSTMENT location, or the error to report if the
    /// count differs and there is none.
    fn reconcile<F>(
        &self,
        key: QuantKey,
        counterpart: LedgerResult<LocationId>,
        counted: i64,
        build: F,
    ) -> LedgerResult<Committed<(Document, ReconcilePlan)>>
    where
        F: FnOnce(DocumentNumber, &ReconcilePlan) -> Document;

    // quantities

    /// Every existing row of `product`, with its location's warehouse.
    fn stock(&self, product: ProductId) -> LedgerResult<Vec<StockLevel>>;

    /// Current quantity of one row; `None` if the row was never created.
    fn quantity(&self, key: QuantKey) -> LedgerResult<Option<i64>>;

    // reorder rules

    /// Fails with `DuplicateReorderRule` if the product already has one.
    fn insert_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()>;

    /// Fails with `NotFound` if the product has no rule.
    fn replace_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()>;

    fn remove_reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>>;

    fn reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>>;

    /// Every product with a rule, together with its current total.
    fn low_stock_candidates(&self) -> LedgerResult<Vec<RuleTotal>>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore,
{
    fn insert_product(&self, product: Product) -> LedgerResult<()> {
        (**self).insert_product(product)
    }

    fn product(&self, id: ProductId) -> LedgerResult<Option<Product>> {
        (**self).product(id)
    }

    fn insert_location(&self, location: Location) -> LedgerResult<()> {
        (**self).insert_location(location)
    }

    fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        (**self).location(id)
    }

    fn adjustment_location(&self, warehouse: WarehouseId) -> LedgerResult<Option<Location>> {
        (**self).adjustment_location(warehouse)
    }

    fn create_document<F>(
        &self,
        doc_type: DocumentType,
        build: F,
    ) -> LedgerResult<Committed<Document>>
    where
        F: FnOnce(DocumentNumber) -> LedgerResult<Document>,
    {
        (**self).create_document(doc_type, build)
    }

    fn document(&self, id: DocumentId) -> LedgerResult<Option<Document>> {
        (**self).document(id)
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
        (**self).update_document(id, expected, edit)
    }

    fn delete_document(&self, id: DocumentId) -> LedgerResult<Committed<Document>> {
        (**self).delete_document(id)
    }

    fn validate_document(
        &self,
        id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Committed<(Document, StockPlan)>> {
        (**self).validate_document(id, actor, at)
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
        (**self).reconcile(key, counterpart, counted, build)
    }

    fn stock(&self, product: ProductId) -> LedgerResult<Vec<StockLevel>> {
        (**self).stock(product)
    }

    fn quantity(&self, key: QuantKey) -> LedgerResult<Option<i64>> {
        (**self).quantity(key)
    }

    fn insert_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        (**self).insert_reorder_rule(rule)
    }

    fn replace_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        (**self).replace_reorder_rule(rule)
    }

    fn remove_reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        (**self).remove_reorder_rule(product)
    }

    fn reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        (**self).reorder_rule(product)
    }

    fn low_stock_candidates(&self) -> LedgerResult<Vec<RuleTotal>> {
        (**self).low_stock_candidates()
    }
}
