//! Inventory ledger domain.
//!
//! Business rules for movement documents and the per-location quantity store,
//! implemented as deterministic domain logic (no IO, no locking, no storage). Stores in
//! `stockledger-infra` lock the rows a document touches, hand their current values to the
//! planner here, and write back whatever the plan says.

pub mod catalog;
pub mod document;
pub mod error;
pub mod event;
pub mod line;
pub mod numbering;
pub mod planner;
pub mod reorder;

pub use catalog::{Location, LocationType, Product};
pub use document::{
    Document, DocumentPatch, DocumentStatus, DocumentType, NewDocument, StatusTransition,
};
pub use error::{EntityKind, LedgerError, LedgerResult, LocationRole};
pub use event::{
    DocumentCanceled, DocumentCreated, DocumentDeleted, DocumentStatusChanged, DocumentUpdated,
    DocumentValidated, LedgerEvent, StockReconciled,
};
pub use line::{LineQuantity, MovementLine, NewLine};
pub use numbering::{DocumentNumber, NumberSequences};
pub use planner::{
    CountDirection, QuantDelta, QuantKey, QuantSnapshot, ReconcilePlan, StockPlan,
    check_count_differs, plan_reconciliation, plan_validation, touched_keys,
};
pub use reorder::{
    LowStockItem, ProductStock, ReorderRule, StockLevel, is_low_stock, low_stock_report,
};
