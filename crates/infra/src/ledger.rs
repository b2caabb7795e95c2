//! Ledger service: the operations collaborators call.
//!
//! Each operation follows the same pipeline:
//!
//! ```text
//! request
//!   ↓
//! 1. Resolve references (products, locations) and reject bad input
//!   ↓
//! 2. Run one atomic store unit (lock, decide, write)
//!   ↓
//! 3. Publish the resulting LedgerEvent (only after commit)
//! ```
//!
//! Envelope sequence numbers come from the store unit, so events about the same row or
//! document carry numbers in commit order. A publish failure is returned as
//! `LedgerError::Publish`: the change stands and the operation must not be retried.

use tracing::{Span, field, instrument};
use uuid::Uuid;

use stockledger_core::{
    AggregateRoot, Clock, DocumentId, ExpectedVersion, LocationId, ProductId, SystemClock,
    UserId,
};
use stockledger_events::{Event, EventBus, EventEnvelope};
use stockledger_inventory::{
    Document, DocumentCanceled, DocumentCreated, DocumentDeleted, DocumentPatch, DocumentStatus,
    DocumentStatusChanged, DocumentUpdated, DocumentValidated, EntityKind, LedgerError,
    LedgerEvent, LedgerResult, Location, LowStockItem, NewDocument, Product, ProductStock,
    QuantKey, ReorderRule, StatusTransition, StockReconciled, is_low_stock, low_stock_report,
};

use crate::store::{Committed, LedgerStore};

/// Run `op`, logging its failure at the level its kind deserves.
///
/// Business rejections are expected outcomes and stay at `debug`; storage and publish
/// failures are errors.
fn observe<T>(operation: &'static str, op: impl FnOnce() -> LedgerResult<T>) -> LedgerResult<T> {
    let result = op();
    if let Err(err) = &result {
        if err.is_business() {
            tracing::debug!(operation, code = err.code(), error = %err, "request rejected");
        } else if err.is_committed() {
            tracing::error!(operation, error = %err, "change committed but event lost");
        } else {
            tracing::error!(operation, error = %err, "ledger operation failed");
        }
    }
    result
}

/// Inventory ledger over a store `S`, publishing to bus `B`, stamping times from `C`.
#[derive(Debug)]
pub struct Ledger<S, B, C = SystemClock> {
    store: S,
    bus: B,
    clock: C,
}

impl<S, B> Ledger<S, B, SystemClock> {
    pub fn new(store: S, bus: B) -> Self {
        Self::with_clock(store, bus, SystemClock)
    }
}

impl<S, B, C> Ledger<S, B, C> {
    pub fn with_clock(store: S, bus: B, clock: C) -> Self {
        Self { store, bus, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B, C> Ledger<S, B, C>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<LedgerEvent>>,
    C: Clock,
{
    // catalog

    #[instrument(skip_all, fields(product_id = %product.id, sku = %product.sku))]
    pub fn register_product(&self, product: Product) -> LedgerResult<Product> {
        observe("register_product", || {
            self.store.insert_product(product.clone())?;
            Ok(product)
        })
    }

    #[instrument(skip_all, fields(location_id = %location.id, warehouse_id = %location.warehouse_id))]
    pub fn register_location(&self, location: Location) -> LedgerResult<Location> {
        observe("register_location", || {
            self.store.insert_location(location.clone())?;
            Ok(location)
        })
    }

    // documents

    /// Author a document (DRAFT unless `spec` says otherwise) and give it the next number
    /// of its type.
    #[instrument(skip_all, fields(doc_type = %spec.doc_type, actor = %actor, document_id = field::Empty))]
    pub fn create_document(&self, spec: NewDocument, actor: UserId) -> LedgerResult<Document> {
        observe("create_document", || {
            self.check_references(spec.products(), spec.locations())?;

            let id = DocumentId::new();
            let now = self.clock.now();
            let Committed {
                value: document,
                sequence,
            } = self.store.create_document(spec.doc_type, |number| {
                Document::create(id, number, spec, actor, now)
            })?;
            Span::current().record("document_id", field::display(id));
            tracing::info!(number = %document.number(), "document created");

            self.publish(
                sequence,
                LedgerEvent::DocumentCreated(DocumentCreated {
                    document: id,
                    number: document.number().clone(),
                    doc_type: document.doc_type(),
                    status: document.status(),
                    created_by: actor,
                    occurred_at: now,
                }),
            )?;
            Ok(document)
        })
    }

    pub fn get_document(&self, id: DocumentId) -> LedgerResult<Document> {
        observe("get_document", || {
            self.store
                .document(id)?
                .ok_or_else(|| LedgerError::not_found(EntityKind::Document, id))
        })
    }

    /// Edit an open document. `expected` guards against lost updates.
    #[instrument(skip_all, fields(document_id = %id, expected = ?expected))]
    pub fn update_document(
        &self,
        id: DocumentId,
        patch: DocumentPatch,
        expected: ExpectedVersion,
    ) -> LedgerResult<Document> {
        observe("update_document", || {
            self.check_references(patch.products(), patch.locations())?;

            let Committed {
                value: (document, ()),
                sequence,
            } = self
                .store
                .update_document(id, expected, |doc| doc.apply_patch(patch))?;

            self.publish(
                sequence,
                LedgerEvent::DocumentUpdated(DocumentUpdated {
                    document: id,
                    version: document.version(),
                    line_count: document.lines().len(),
                    occurred_at: self.clock.now(),
                }),
            )?;
            Ok(document)
        })
    }

    /// Remove an open or canceled document. Its number is never handed out again.
    #[instrument(skip_all, fields(document_id = %id))]
    pub fn delete_document(&self, id: DocumentId) -> LedgerResult<Document> {
        observe("delete_document", || {
            let Committed {
                value: document,
                sequence,
            } = self.store.delete_document(id)?;
            tracing::info!(number = %document.number(), "document deleted");

            self.publish(
                sequence,
                LedgerEvent::DocumentDeleted(DocumentDeleted {
                    document: id,
                    number: document.number().clone(),
                    occurred_at: self.clock.now(),
                }),
            )?;
            Ok(document)
        })
    }

    /// Move a document to `target`: DONE validates, CANCELED cancels, anything else is a
    /// plain update between open statuses.
    #[instrument(skip_all, fields(document_id = %id, target = %target, actor = %actor))]
    pub fn set_status(
        &self,
        id: DocumentId,
        target: DocumentStatus,
        actor: UserId,
    ) -> LedgerResult<Document> {
        match StatusTransition::for_target(target) {
            StatusTransition::Validate => self.validate(id, actor),
            StatusTransition::Cancel => self.cancel(id),
            StatusTransition::Reopen(status) => observe("set_status", || {
                let Committed {
                    value: (document, previous),
                    sequence,
                } = self
                    .store
                    .update_document(id, ExpectedVersion::Any, |doc| doc.set_open_status(status))?;

                self.publish(
                    sequence,
                    LedgerEvent::DocumentStatusChanged(DocumentStatusChanged {
                        document: id,
                        from: previous,
                        to: status,
                        occurred_at: self.clock.now(),
                    }),
                )?;
                Ok(document)
            }),
        }
    }

    /// Apply the document's lines to stock and mark it DONE, all or nothing.
    #[instrument(skip_all, fields(document_id = %id, actor = %actor))]
    pub fn validate(&self, id: DocumentId, actor: UserId) -> LedgerResult<Document> {
        observe("validate", || {
            let now = self.clock.now();
            let Committed {
                value: (document, plan),
                sequence,
            } = self.store.validate_document(id, actor, now)?;
            tracing::info!(
                number = %document.number(),
                rows = plan.writes.len(),
                "document validated"
            );

            self.publish(
                sequence,
                LedgerEvent::DocumentValidated(DocumentValidated {
                    document: id,
                    number: document.number().clone(),
                    doc_type: document.doc_type(),
                    validated_by: actor,
                    deltas: plan.deltas,
                    occurred_at: now,
                }),
            )?;
            Ok(document)
        })
    }

    /// Cancel an open document. Stock is never touched.
    #[instrument(skip_all, fields(document_id = %id))]
    pub fn cancel(&self, id: DocumentId) -> LedgerResult<Document> {
        observe("cancel", || {
            let Committed {
                value: (document, from),
                sequence,
            } = self.store.update_document(id, ExpectedVersion::Any, |doc| {
                let from = doc.status();
                doc.mark_canceled()?;
                Ok(from)
            })?;
            tracing::info!(number = %document.number(), "document canceled");

            self.publish(
                sequence,
                LedgerEvent::DocumentCanceled(DocumentCanceled {
                    document: id,
                    from,
                    occurred_at: self.clock.now(),
                }),
            )?;
            Ok(document)
        })
    }

    // stock

    /// Record a physical count: sets the row to `counted` and books the difference against
    /// the warehouse's adjustment location in a DONE adjustment document.
    #[instrument(skip_all, fields(product_id = %product, location_id = %location, counted, actor = %actor))]
    pub fn reconcile_count(
        &self,
        product: ProductId,
        location: LocationId,
        counted: i64,
        actor: UserId,
    ) -> LedgerResult<Document> {
        observe("reconcile_count", || {
            self.require_product(product)?;
            let counted_at = self.require_location(location)?;
            if counted_at.is_adjustment() {
                return Err(LedgerError::validation(format!(
                    "location {location} is an adjustment location and cannot be counted"
                )));
            }
            let counterpart = self
                .store
                .adjustment_location(counted_at.warehouse_id)?
                .map(|l| l.id)
                .ok_or_else(|| {
                    LedgerError::not_found(EntityKind::AdjustmentLocation, counted_at.warehouse_id)
                });

            let now = self.clock.now();
            let Committed {
                value: (document, plan),
                sequence,
            } = self.store.reconcile(
                QuantKey::new(product, location),
                counterpart,
                counted,
                |number, plan| Document::reconciliation(DocumentId::new(), number, plan, actor, now),
            )?;
            tracing::info!(
                number = %document.number(),
                previous = plan.previous,
                direction = ?plan.direction,
                "stock reconciled"
            );

            self.publish(
                sequence,
                LedgerEvent::StockReconciled(StockReconciled {
                    document: document.document_id(),
                    number: document.number().clone(),
                    product,
                    location,
                    previous: plan.previous,
                    counted: plan.counted,
                    direction: plan.direction,
                    counted_by: actor,
                    occurred_at: now,
                }),
            )?;
            Ok(document)
        })
    }

    /// Total and per-location breakdown for a product.
    pub fn get_stock(&self, product: ProductId) -> LedgerResult<ProductStock> {
        observe("get_stock", || {
            self.require_product(product)?;
            let rows = self.store.stock(product)?;
            Ok(ProductStock::from_rows(product, rows))
        })
    }

    pub fn is_low_stock(&self, product: ProductId) -> LedgerResult<bool> {
        observe("is_low_stock", || {
            self.require_product(product)?;
            let rule = self.store.reorder_rule(product)?;
            let total: i64 = self.store.stock(product)?.iter().map(|l| l.quantity).sum();
            Ok(is_low_stock(total, rule.as_ref()))
        })
    }

    pub fn list_low_stock(&self) -> LedgerResult<Vec<LowStockItem>> {
        observe("list_low_stock", || {
            let candidates = self.store.low_stock_candidates()?;
            Ok(low_stock_report(
                candidates
                    .iter()
                    .map(|(product, rule, total)| (product, rule, *total)),
            ))
        })
    }

    // reorder rules

    #[instrument(skip_all, fields(product_id = %product, min_qty))]
    pub fn create_reorder_rule(
        &self,
        product: ProductId,
        min_qty: i64,
        preferred_qty: Option<i64>,
    ) -> LedgerResult<ReorderRule> {
        observe("create_reorder_rule", || {
            self.require_product(product)?;
            let rule = ReorderRule::new(product, min_qty, preferred_qty)?;
            self.store.insert_reorder_rule(rule)?;
            Ok(rule)
        })
    }

    #[instrument(skip_all, fields(product_id = %product, min_qty))]
    pub fn update_reorder_rule(
        &self,
        product: ProductId,
        min_qty: i64,
        preferred_qty: Option<i64>,
    ) -> LedgerResult<ReorderRule> {
        observe("update_reorder_rule", || {
            let rule = ReorderRule::new(product, min_qty, preferred_qty)?;
            self.store.replace_reorder_rule(rule)?;
            Ok(rule)
        })
    }

    #[instrument(skip_all, fields(product_id = %product))]
    pub fn delete_reorder_rule(&self, product: ProductId) -> LedgerResult<ReorderRule> {
        observe("delete_reorder_rule", || {
            self.store
                .remove_reorder_rule(product)?
                .ok_or_else(|| LedgerError::not_found(EntityKind::ReorderRule, product))
        })
    }

    pub fn get_reorder_rule(&self, product: ProductId) -> LedgerResult<ReorderRule> {
        observe("get_reorder_rule", || {
            self.store
                .reorder_rule(product)?
                .ok_or_else(|| LedgerError::not_found(EntityKind::ReorderRule, product))
        })
    }

    fn require_product(&self, id: ProductId) -> LedgerResult<Product> {
        self.store
            .product(id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Product, id))
    }

    fn require_location(&self, id: LocationId) -> LedgerResult<Location> {
        self.store
            .location(id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Location, id))
    }

    /// Every product must exist and be active; every location must exist.
    fn check_references(
        &self,
        products: impl Iterator<Item = ProductId>,
        locations: impl Iterator<Item = LocationId>,
    ) -> LedgerResult<()> {
        for id in products {
            let product = self.require_product(id)?;
            if !product.active {
                return Err(LedgerError::validation(format!(
                    "product {} ({}) is inactive",
                    product.sku, product.id
                )));
            }
        }
        for id in locations {
            self.require_location(id)?;
        }
        Ok(())
    }

    /// Publish `event` under the sequence number its unit drew. Units that changed nothing
    /// drew none and publish nothing.
    fn publish(&self, sequence: Option<u64>, event: LedgerEvent) -> LedgerResult<()> {
        let Some(sequence) = sequence else {
            return Ok(());
        };
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            event.event_type(),
            event.subject_id(),
            sequence,
            event,
        );
        self.bus
            .publish(envelope)
            .map_err(|e| LedgerError::Publish {
                sequence,
                reason: format!("{e:?}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{TimeZone, Utc};
    use stockledger_core::{FixedClock, WarehouseId};
    use stockledger_events::{InMemoryEventBus, Subscription};
    use stockledger_inventory::{DocumentType, LocationType};

    use super::*;
    use crate::store::InMemoryLedgerStore;

    /// Delivers until closed, then refuses every message.
    #[derive(Debug, Default)]
    struct ClosableBus {
        inner: InMemoryEventBus<EventEnvelope<LedgerEvent>>,
        closed: AtomicBool,
    }

    impl EventBus<EventEnvelope<LedgerEvent>> for ClosableBus {
        type Error = &'static str;

        fn publish(&self, message: EventEnvelope<LedgerEvent>) -> Result<(), Self::Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err("bus closed");
            }
            self.inner.publish(message).map_err(|_| "bus poisoned")
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<LedgerEvent>> {
            self.inner.subscribe()
        }
    }

    fn catalog<B, C>(ledger: &Ledger<Arc<InMemoryLedgerStore>, B, C>) -> (ProductId, LocationId)
    where
        B: EventBus<EventEnvelope<LedgerEvent>>,
        C: Clock,
    {
        let product = Product::new(ProductId::new(), "SKU-1", "Widget").unwrap();
        let shelf = Location::new(
            LocationId::new(),
            WarehouseId::new(),
            "Shelf",
            LocationType::Internal,
        );
        let (p, l) = (product.id, shelf.id);
        ledger.register_product(product).unwrap();
        ledger.register_location(shelf).unwrap();
        (p, l)
    }

    #[test]
    fn publish_failure_reports_the_committed_sequence() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()), ClosableBus::default());
        let (product, shelf) = catalog(&ledger);
        let doc = ledger
            .create_document(
                NewDocument::new(DocumentType::Receipt)
                    .to(shelf)
                    .line(product, 5),
                UserId::new(),
            )
            .unwrap();

        ledger.bus().closed.store(true, Ordering::SeqCst);
        let err = ledger.validate(doc.document_id(), UserId::new()).unwrap_err();
        assert!(matches!(err, LedgerError::Publish { sequence: 2, .. }));
        assert_eq!(err.code(), "publish_failed");
        assert!(err.is_committed());
        assert!(!err.is_business());

        assert_eq!(ledger.get_stock(product).unwrap().total, 5);
        assert_eq!(
            ledger.get_document(doc.document_id()).unwrap().status(),
            DocumentStatus::Done
        );
        assert_eq!(
            ledger.validate(doc.document_id(), UserId::new()).unwrap_err(),
            LedgerError::AlreadyValidated {
                document: doc.document_id()
            }
        );
    }

    #[test]
    fn create_behind_a_closed_bus_is_committed_not_fatal() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()), ClosableBus::default());
        let (product, shelf) = catalog(&ledger);
        let receipt = || {
            NewDocument::new(DocumentType::Receipt)
                .to(shelf)
                .line(product, 5)
        };

        ledger.bus().closed.store(true, Ordering::SeqCst);
        let err = ledger.create_document(receipt(), UserId::new()).unwrap_err();
        assert!(err.is_committed());
        assert_ne!(err.code(), "storage_error");

        ledger.bus().closed.store(false, Ordering::SeqCst);
        let next = ledger.create_document(receipt(), UserId::new()).unwrap();
        assert_eq!(next.number().as_str(), "REC-000002");
    }

    #[test]
    fn documents_are_stamped_with_the_injected_clock() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let ledger = Ledger::with_clock(
            Arc::new(InMemoryLedgerStore::new()),
            InMemoryEventBus::new(),
            FixedClock(at),
        );
        let (product, shelf) = catalog(&ledger);
        let actor = UserId::new();

        let doc = ledger
            .create_document(
                NewDocument::new(DocumentType::Receipt)
                    .to(shelf)
                    .line(product, 5),
                actor,
            )
            .unwrap();
        let done = ledger.validate(doc.document_id(), actor).unwrap();

        assert_eq!(done.created_at(), at);
        assert_eq!(done.validated_at(), Some(at));
        assert_eq!(done.validated_by(), Some(actor));
    }

    #[test]
    fn reopen_to_same_status_publishes_nothing() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()), InMemoryEventBus::new());
        let (product, shelf) = catalog(&ledger);
        let doc = ledger
            .create_document(
                NewDocument::new(DocumentType::Receipt)
                    .to(shelf)
                    .line(product, 1),
                UserId::new(),
            )
            .unwrap();

        let events = ledger.bus().subscribe();
        let same = ledger
            .set_status(doc.document_id(), DocumentStatus::Draft, UserId::new())
            .unwrap();
        assert_eq!(same.version(), doc.version());
        assert!(events.drain().is_empty());

        ledger
            .set_status(doc.document_id(), DocumentStatus::Ready, UserId::new())
            .unwrap();
        let published = events.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "document.status_changed");
    }

    #[test]
    fn counting_an_adjustment_location_is_rejected() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()), InMemoryEventBus::new());
        let (product, _) = catalog(&ledger);
        let adj = Location::new(
            LocationId::new(),
            WarehouseId::new(),
            "Inventory loss",
            LocationType::Adjustment,
        );
        let adj_id = adj.id;
        ledger.register_location(adj).unwrap();

        let err = ledger
            .reconcile_count(product, adj_id, 3, UserId::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
