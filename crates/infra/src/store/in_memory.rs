use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};

use stockledger_core::{
    AggregateRoot, DocumentId, ExpectedVersion, LocationId, ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    Document, DocumentNumber, DocumentType, EntityKind, LedgerError, LedgerResult, Location,
    NumberSequences, Product, QuantKey, QuantSnapshot, ReconcilePlan, ReorderRule, StockLevel,
    StockPlan, check_count_differs, plan_reconciliation, plan_validation, touched_keys,
};

use super::r#trait::{Committed, LedgerStore, RuleTotal, StoreError, StoreResult};

/// One quant row. `None` until the first increase creates the row.
type RowSlot = Arc<Mutex<Option<i64>>>;

/// One document. `None` once deleted (a concurrent holder of the slot sees the tombstone).
type DocumentSlot = Arc<Mutex<Option<Document>>>;

type LockedRows<'a> = Vec<(QuantKey, MutexGuard<'a, Option<i64>>)>;

#[derive(Debug, Default)]
struct Catalog {
    products: HashMap<ProductId, Product>,
    skus: HashMap<String, ProductId>,
    locations: HashMap<LocationId, Location>,
    adjustment_locations: HashMap<WarehouseId, LocationId>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev and single-process deployments. Each quant row and each document
/// sits behind its own mutex; the maps that hold them are only locked long enough to clone
/// an `Arc`, so units over disjoint rows never block each other.
///
/// Lock order, to stay deadlock-free: document → quant rows (ascending `QuantKey`) →
/// number sequences → document map → row map. No method waits on a document or row mutex
/// while holding a map lock.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    catalog: RwLock<Catalog>,
    documents: RwLock<HashMap<DocumentId, DocumentSlot>>,
    rows: RwLock<BTreeMap<QuantKey, RowSlot>>,
    sequences: Mutex<NumberSequences>,
    reorder_rules: RwLock<BTreeMap<ProductId, ReorderRule>>,
    /// Last envelope sequence number drawn by a unit.
    events: AtomicU64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn document_slot(&self, id: DocumentId) -> LedgerResult<DocumentSlot> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StoreError::Poisoned("documents"))?;
        documents
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))
    }

    /// Slots for `keys` in key order, creating empty ones where no row exists yet.
    fn row_slots(&self, keys: &BTreeSet<QuantKey>) -> StoreResult<Vec<(QuantKey, RowSlot)>> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned("rows"))?;
        Ok(keys
            .iter()
            .map(|key| (*key, Arc::clone(rows.entry(*key).or_default())))
            .collect())
    }

    /// Forget rows a unit created but never filled. A slot that another unit has cloned
    /// in the meantime stays, since that unit may be about to fill it; clones are only
    /// taken under the map lock, so the count is stable while it is held.
    fn discard_empty_rows(&self, rows: &LockedRows<'_>, slots: &[(QuantKey, RowSlot)]) {
        let Ok(mut map) = self.rows.write() else {
            return;
        };
        for ((key, row), (_, slot)) in rows.iter().zip(slots) {
            if row.is_none() && Arc::strong_count(slot) == 2 {
                map.remove(key);
            }
        }
    }

    /// Next envelope sequence number. Callers still hold the unit's locks.
    fn next_event(&self) -> u64 {
        self.events.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reconcile against the locked counted row: set it and insert the adjustment document.
    fn reconcile_row<F>(
        &self,
        key: QuantKey,
        rows: &mut LockedRows<'_>,
        counterpart: LedgerResult<LocationId>,
        counted: i64,
        build: F,
    ) -> LedgerResult<Committed<(Document, ReconcilePlan)>>
    where
        F: FnOnce(DocumentNumber, &ReconcilePlan) -> Document,
    {
        let (_, row) = rows.first_mut().ok_or_else(|| StoreError::Corrupt {
            table: "stock_quants",
            message: format!("row {key} has no lock slot"),
        })?;
        let current = **row;

        let counterpart = match counterpart {
            Ok(location) => location,
            Err(missing) => {
                check_count_differs(key.product, key.location, current, counted)?;
                return Err(missing);
            }
        };
        let plan = plan_reconciliation(key.product, key.location, counterpart, current, counted)?;

        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| StoreError::Poisoned("sequences"))?;
        let mut next = sequences.clone();
        let document = build(next.allocate(DocumentType::Adjustment), &plan);
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::Poisoned("documents"))?;

        **row = Some(plan.counted);
        documents.insert(
            document.document_id(),
            Arc::new(Mutex::new(Some(document.clone()))),
        );
        *sequences = next;
        Ok(Committed::new((document, plan), self.next_event()))
    }

    /// Slots that already exist and match `filter`, in key order.
    fn existing_row_slots(
        &self,
        filter: impl Fn(&QuantKey) -> bool,
    ) -> StoreResult<Vec<(QuantKey, RowSlot)>> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("rows"))?;
        Ok(rows
            .iter()
            .filter(|(key, _)| filter(key))
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect())
    }
}

/// Lock every slot in the order given (callers pass key order).
fn lock_rows(slots: &[(QuantKey, RowSlot)]) -> StoreResult<LockedRows<'_>> {
    slots
        .iter()
        .map(|(key, slot)| {
            slot.lock()
                .map(|guard| (*key, guard))
                .map_err(|_| StoreError::Poisoned("quant row"))
        })
        .collect()
}

/// Plan `current` against the locked rows and, if every line passes, write the new
/// quantities. Nothing is written on failure.
fn apply_validation(
    current: &Document,
    rows: &mut LockedRows<'_>,
    actor: UserId,
    at: DateTime<Utc>,
) -> LedgerResult<(Document, StockPlan)> {
    let snapshot: QuantSnapshot = rows.iter().map(|(key, row)| (*key, **row)).collect();
    let plan = plan_validation(current, &snapshot)?;
    let mut validated = current.clone();
    validated.mark_validated(actor, at)?;

    for (key, row) in rows.iter_mut() {
        if let Some(quantity) = plan.writes.get(&*key) {
            **row = Some(*quantity);
        }
    }
    Ok((validated, plan))
}

impl LedgerStore for InMemoryLedgerStore {
    fn insert_product(&self, product: Product) -> LedgerResult<()> {
        let mut catalog = self
            .catalog
            .write()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        if catalog.products.contains_key(&product.id) {
            return Err(LedgerError::validation(format!(
                "product {} already exists",
                product.id
            )));
        }
        if catalog.skus.contains_key(&product.sku) {
            return Err(LedgerError::validation(format!(
                "sku {} already exists",
                product.sku
            )));
        }
        catalog.skus.insert(product.sku.clone(), product.id);
        catalog.products.insert(product.id, product);
        Ok(())
    }

    fn product(&self, id: ProductId) -> LedgerResult<Option<Product>> {
        let catalog = self
            .catalog
            .read()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        Ok(catalog.products.get(&id).cloned())
    }

    fn insert_location(&self, location: Location) -> LedgerResult<()> {
        let mut catalog = self
            .catalog
            .write()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        if catalog.locations.contains_key(&location.id) {
            return Err(LedgerError::validation(format!(
                "location {} already exists",
                location.id
            )));
        }
        if location.is_adjustment() {
            if catalog
                .adjustment_locations
                .contains_key(&location.warehouse_id)
            {
                return Err(LedgerError::validation(format!(
                    "warehouse {} already has an adjustment location",
                    location.warehouse_id
                )));
            }
            catalog
                .adjustment_locations
                .insert(location.warehouse_id, location.id);
        }
        catalog.locations.insert(location.id, location);
        Ok(())
    }

    fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        let catalog = self
            .catalog
            .read()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        Ok(catalog.locations.get(&id).cloned())
    }

    fn adjustment_location(&self, warehouse: WarehouseId) -> LedgerResult<Option<Location>> {
        let catalog = self
            .catalog
            .read()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        Ok(catalog
            .adjustment_locations
            .get(&warehouse)
            .and_then(|id| catalog.locations.get(id))
            .cloned())
    }

    fn create_document<F>(
        &self,
        doc_type: DocumentType,
        build: F,
    ) -> LedgerResult<Committed<Document>>
    where
        F: FnOnce(DocumentNumber) -> LedgerResult<Document>,
    {
        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| StoreError::Poisoned("sequences"))?;
        let mut next = sequences.clone();
        let document = build(next.allocate(doc_type))?;

        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::Poisoned("documents"))?;
        if documents.contains_key(&document.document_id()) {
            return Err(LedgerError::validation(format!(
                "document {} already exists",
                document.document_id()
            )));
        }
        documents.insert(
            document.document_id(),
            Arc::new(Mutex::new(Some(document.clone()))),
        );
        *sequences = next;
        Ok(Committed::new(document, self.next_event()))
    }

    fn document(&self, id: DocumentId) -> LedgerResult<Option<Document>> {
        let slot = match self.document_slot(id) {
            Ok(slot) => slot,
            Err(LedgerError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let guard = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("document"))?;
        Ok(guard.clone())
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
        let slot = self.document_slot(id)?;
        let mut guard = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("document"))?;
        let current = guard
            .as_ref()
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        current.check_version(expected)?;

        let mut working = current.clone();
        let outcome = edit(&mut working)?;
        if working.version() == current.version() {
            return Ok(Committed::unchanged((working, outcome)));
        }
        *guard = Some(working.clone());
        Ok(Committed::new((working, outcome), self.next_event()))
    }

    fn delete_document(&self, id: DocumentId) -> LedgerResult<Committed<Document>> {
        let slot = self.document_slot(id)?;
        let mut guard = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("document"))?;
        let current = guard
            .as_ref()
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        current.check_deletable()?;
        let removed = current.clone();

        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::Poisoned("documents"))?;
        *guard = None;
        documents.remove(&id);
        Ok(Committed::new(removed, self.next_event()))
    }

    fn validate_document(
        &self,
        id: DocumentId,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Committed<(Document, StockPlan)>> {
        let slot = self.document_slot(id)?;
        let mut guard = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("document"))?;
        let current = guard
            .as_ref()
            .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))?;
        current.check_validate()?;

        let slots = self.row_slots(&touched_keys(current))?;
        let mut rows = lock_rows(&slots)?;
        let applied = apply_validation(current, &mut rows, actor, at);
        self.discard_empty_rows(&rows, &slots);
        let (validated, plan) = applied?;

        *guard = Some(validated.clone());
        Ok(Committed::new((validated, plan), self.next_event()))
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
        let slots = self.row_slots(&BTreeSet::from([key]))?;
        let mut rows = lock_rows(&slots)?;
        let outcome = self.reconcile_row(key, &mut rows, counterpart, counted, build);
        self.discard_empty_rows(&rows, &slots);
        outcome
    }

    fn stock(&self, product: ProductId) -> LedgerResult<Vec<StockLevel>> {
        let slots = self.existing_row_slots(|key| key.product == product)?;
        let rows = lock_rows(&slots)?;
        let catalog = self
            .catalog
            .read()
            .map_err(|_| StoreError::Poisoned("catalog"))?;

        rows.iter()
            .filter_map(|(key, row)| (**row).map(|quantity| (key, quantity)))
            .map(|(key, quantity)| -> LedgerResult<StockLevel> {
                let location = catalog.locations.get(&key.location).ok_or_else(|| {
                    StoreError::Corrupt {
                        table: "stock_quants",
                        message: format!("row {key} references unknown location"),
                    }
                })?;
                Ok(StockLevel {
                    location: key.location,
                    warehouse: location.warehouse_id,
                    quantity,
                })
            })
            .collect()
    }

    fn quantity(&self, key: QuantKey) -> LedgerResult<Option<i64>> {
        let slots = self.existing_row_slots(|k| *k == key)?;
        let rows = lock_rows(&slots)?;
        Ok(rows.first().and_then(|(_, row)| **row))
    }

    fn insert_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        let mut rules = self
            .reorder_rules
            .write()
            .map_err(|_| StoreError::Poisoned("reorder rules"))?;
        if rules.contains_key(&rule.product) {
            return Err(LedgerError::DuplicateReorderRule {
                product: rule.product,
            });
        }
        rules.insert(rule.product, rule);
        Ok(())
    }

    fn replace_reorder_rule(&self, rule: ReorderRule) -> LedgerResult<()> {
        let mut rules = self
            .reorder_rules
            .write()
            .map_err(|_| StoreError::Poisoned("reorder rules"))?;
        match rules.get_mut(&rule.product) {
            Some(existing) => {
                *existing = rule;
                Ok(())
            }
            None => Err(LedgerError::not_found(EntityKind::ReorderRule, rule.product)),
        }
    }

    fn remove_reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        let mut rules = self
            .reorder_rules
            .write()
            .map_err(|_| StoreError::Poisoned("reorder rules"))?;
        Ok(rules.remove(&product))
    }

    fn reorder_rule(&self, product: ProductId) -> LedgerResult<Option<ReorderRule>> {
        let rules = self
            .reorder_rules
            .read()
            .map_err(|_| StoreError::Poisoned("reorder rules"))?;
        Ok(rules.get(&product).copied())
    }

    fn low_stock_candidates(&self) -> LedgerResult<Vec<RuleTotal>> {
        let rules: Vec<ReorderRule> = {
            let rules = self
                .reorder_rules
                .read()
                .map_err(|_| StoreError::Poisoned("reorder rules"))?;
            rules.values().copied().collect()
        };
        let ruled: BTreeSet<ProductId> = rules.iter().map(|r| r.product).collect();

        let slots = self.existing_row_slots(|key| ruled.contains(&key.product))?;
        let rows = lock_rows(&slots)?;
        let mut totals: HashMap<ProductId, i64> = HashMap::new();
        for (key, row) in &rows {
            if let Some(quantity) = **row {
                *totals.entry(key.product).or_insert(0) += quantity;
            }
        }
        drop(rows);

        let catalog = self
            .catalog
            .read()
            .map_err(|_| StoreError::Poisoned("catalog"))?;
        Ok(rules
            .into_iter()
            .filter_map(|rule| {
                let product = catalog.products.get(&rule.product)?.clone();
                let total = totals.get(&rule.product).copied().unwrap_or(0);
                Some((product, rule, total))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_inventory::{DocumentStatus, LocationType, NewDocument};

    struct Fixture {
        store: InMemoryLedgerStore,
        product: ProductId,
        shelf: LocationId,
        adjustment: LocationId,
    }

    fn fixture() -> Fixture {
        let store = InMemoryLedgerStore::new();
        let warehouse = WarehouseId::new();
        let product = Product::new(ProductId::new(), "sku-1", "Widget").unwrap();
        let shelf = Location::new(LocationId::new(), warehouse, "A-1", LocationType::Internal);
        let adjustment = Location::new(
            LocationId::new(),
            warehouse,
            "Adjustments",
            LocationType::Adjustment,
        );
        let ids = (product.id, shelf.id, adjustment.id);
        store.insert_product(product).unwrap();
        store.insert_location(shelf).unwrap();
        store.insert_location(adjustment).unwrap();
        Fixture {
            store,
            product: ids.0,
            shelf: ids.1,
            adjustment: ids.2,
        }
    }

    fn create(store: &InMemoryLedgerStore, spec: NewDocument) -> Document {
        let doc_type = spec.doc_type;
        store
            .create_document(doc_type, |number| {
                Document::create(DocumentId::new(), number, spec, UserId::new(), Utc::now())
            })
            .unwrap()
            .value
    }

    fn row_count(store: &InMemoryLedgerStore) -> usize {
        store.rows.read().unwrap().len()
    }

    #[test]
    fn duplicate_sku_and_second_adjustment_location_are_rejected() {
        let f = fixture();
        let twin = Product::new(ProductId::new(), " SKU-1", "Twin").unwrap();
        assert!(matches!(
            f.store.insert_product(twin),
            Err(LedgerError::Validation(_))
        ));

        let warehouse = f.store.location(f.shelf).unwrap().unwrap().warehouse_id;
        let second = Location::new(
            LocationId::new(),
            warehouse,
            "More adjustments",
            LocationType::Adjustment,
        );
        assert!(f.store.insert_location(second).is_err());
        assert_eq!(
            f.store.adjustment_location(warehouse).unwrap().map(|l| l.id),
            Some(f.adjustment)
        );
    }

    #[test]
    fn failed_build_does_not_consume_a_number() {
        let f = fixture();
        let err = f
            .store
            .create_document(DocumentType::Receipt, |_| {
                Err(LedgerError::validation("nope"))
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let doc = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        assert_eq!(doc.number().as_str(), "REC-000001");
    }

    #[test]
    fn rejected_validation_creates_no_row() {
        let f = fixture();
        let key = QuantKey::new(f.product, f.shelf);
        let delivery = create(
            &f.store,
            NewDocument::new(DocumentType::Delivery)
                .from(f.shelf)
                .line(f.product, 1),
        );
        let err = f
            .store
            .validate_document(delivery.document_id(), UserId::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { available: 0, .. }));
        assert_eq!(f.store.quantity(key).unwrap(), None);
        assert!(f.store.stock(f.product).unwrap().is_empty());
        assert_eq!(
            f.store
                .document(delivery.document_id())
                .unwrap()
                .unwrap()
                .status(),
            DocumentStatus::Draft
        );
    }

    #[test]
    fn rejected_validations_leave_no_empty_slots_behind() {
        let f = fixture();
        let warehouse = f.store.location(f.shelf).unwrap().unwrap().warehouse_id;
        for n in 0..20 {
            let bin = Location::new(
                LocationId::new(),
                warehouse,
                &format!("Bin {n}"),
                LocationType::Internal,
            );
            let bin_id = bin.id;
            f.store.insert_location(bin).unwrap();
            let delivery = create(
                &f.store,
                NewDocument::new(DocumentType::Delivery)
                    .from(bin_id)
                    .line(f.product, 1),
            );
            assert!(
                f.store
                    .validate_document(delivery.document_id(), UserId::new(), Utc::now())
                    .is_err()
            );
        }
        assert_eq!(row_count(&f.store), 0);

        let missing = Err(LedgerError::not_found(
            EntityKind::AdjustmentLocation,
            warehouse,
        ));
        assert!(
            f.store
                .reconcile(QuantKey::new(f.product, f.shelf), missing, 4, |_, _| {
                    unreachable!()
                })
                .is_err()
        );
        assert_eq!(row_count(&f.store), 0);
    }

    #[test]
    fn units_draw_increasing_sequence_numbers() {
        let f = fixture();
        let created = f
            .store
            .create_document(DocumentType::Receipt, |number| {
                Document::create(
                    DocumentId::new(),
                    number,
                    NewDocument::new(DocumentType::Receipt)
                        .to(f.shelf)
                        .line(f.product, 5),
                    UserId::new(),
                    Utc::now(),
                )
            })
            .unwrap();
        assert_eq!(created.sequence, Some(1));
        let id = created.value.document_id();

        let same = f
            .store
            .update_document(id, ExpectedVersion::Any, |d| {
                d.set_open_status(DocumentStatus::Draft)
            })
            .unwrap();
        assert_eq!(same.sequence, None);

        let validated = f
            .store
            .validate_document(id, UserId::new(), Utc::now())
            .unwrap();
        assert_eq!(validated.sequence, Some(2));

        let counted = f
            .store
            .reconcile(
                QuantKey::new(f.product, f.shelf),
                Ok(f.adjustment),
                3,
                |number, plan| {
                    Document::reconciliation(
                        DocumentId::new(),
                        number,
                        plan,
                        UserId::new(),
                        Utc::now(),
                    )
                },
            )
            .unwrap();
        assert_eq!(counted.sequence, Some(3));
        assert_eq!(counted.value.1.previous, 5);
    }

    #[test]
    fn row_drained_to_zero_stays_visible() {
        let f = fixture();
        let key = QuantKey::new(f.product, f.shelf);
        let receipt = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        f.store
            .validate_document(receipt.document_id(), UserId::new(), Utc::now())
            .unwrap();
        let delivery = create(
            &f.store,
            NewDocument::new(DocumentType::Delivery)
                .from(f.shelf)
                .line(f.product, 5),
        );
        f.store
            .validate_document(delivery.document_id(), UserId::new(), Utc::now())
            .unwrap();

        assert_eq!(f.store.quantity(key).unwrap(), Some(0));
        let stock = f.store.stock(f.product).unwrap();
        assert_eq!(stock.len(), 1);
        assert_eq!(stock[0].quantity, 0);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let f = fixture();
        let doc = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        let (updated, previous) = f
            .store
            .update_document(doc.document_id(), ExpectedVersion::Exact(1), |d| {
                d.set_open_status(DocumentStatus::Ready)
            })
            .unwrap()
            .value;
        assert_eq!(previous, DocumentStatus::Draft);
        assert_eq!(updated.status(), DocumentStatus::Ready);

        let err = f
            .store
            .update_document(doc.document_id(), ExpectedVersion::Exact(1), |d| {
                d.set_open_status(DocumentStatus::Waiting)
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[test]
    fn failed_edit_leaves_stored_document_untouched() {
        let f = fixture();
        let doc = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        let err = f
            .store
            .update_document(doc.document_id(), ExpectedVersion::Any, |d| {
                d.set_open_status(DocumentStatus::Ready)?;
                d.set_open_status(DocumentStatus::Done)
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(
            f.store.document(doc.document_id()).unwrap().unwrap(),
            doc
        );
    }

    #[test]
    fn deleted_document_is_gone_and_its_number_is_not_reused() {
        let f = fixture();
        let first = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        f.store.delete_document(first.document_id()).unwrap();
        assert!(f.store.document(first.document_id()).unwrap().is_none());
        assert!(matches!(
            f.store.delete_document(first.document_id()),
            Err(LedgerError::NotFound {
                kind: EntityKind::Document,
                ..
            })
        ));

        let second = create(
            &f.store,
            NewDocument::new(DocumentType::Receipt)
                .to(f.shelf)
                .line(f.product, 5),
        );
        assert_eq!(second.number().as_str(), "REC-000002");
    }

    #[test]
    fn reconcile_without_counterpart_prefers_no_adjustment_needed() {
        let f = fixture();
        let key = QuantKey::new(f.product, f.shelf);
        let missing = || -> LedgerResult<LocationId> {
            Err(LedgerError::not_found(
                EntityKind::AdjustmentLocation,
                WarehouseId::new(),
            ))
        };

        let err = f
            .store
            .reconcile(key, missing(), 0, |_, _| unreachable!())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NoAdjustmentNeeded { .. }));

        let err = f
            .store
            .reconcile(key, missing(), 3, |_, _| unreachable!())
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotFound {
                kind: EntityKind::AdjustmentLocation,
                ..
            }
        ));
        assert_eq!(f.store.quantity(key).unwrap(), None);
    }

    #[test]
    fn reorder_rules_are_unique_per_product() {
        let f = fixture();
        let rule = ReorderRule::new(f.product, 10, None).unwrap();
        f.store.insert_reorder_rule(rule).unwrap();
        assert_eq!(
            f.store.insert_reorder_rule(rule).unwrap_err(),
            LedgerError::DuplicateReorderRule { product: f.product }
        );

        let candidates = f.store.low_stock_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].2, 0);

        assert_eq!(f.store.remove_reorder_rule(f.product).unwrap(), Some(rule));
        assert!(matches!(
            f.store.replace_reorder_rule(rule),
            Err(LedgerError::NotFound {
                kind: EntityKind::ReorderRule,
                ..
            })
        ));
    }
}
