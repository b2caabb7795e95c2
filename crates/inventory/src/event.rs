//! Facts published after a ledger mutation commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DocumentId, LocationId, ProductId, UserId};
use stockledger_events::Event;

use crate::document::{DocumentStatus, DocumentType};
use crate::numbering::DocumentNumber;
use crate::planner::{CountDirection, QuantDelta};

/// Event: DocumentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCreated {
    pub document: DocumentId,
    pub number: DocumentNumber,
    pub doc_type: DocumentType,
    pub status: DocumentStatus,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DocumentUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdated {
    pub document: DocumentId,
    pub version: u64,
    pub line_count: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DocumentStatusChanged (between open statuses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatusChanged {
    pub document: DocumentId,
    pub from: DocumentStatus,
    pub to: DocumentStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DocumentValidated. `deltas` are the quant changes applied in the same commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentValidated {
    pub document: DocumentId,
    pub number: DocumentNumber,
    pub doc_type: DocumentType,
    pub validated_by: UserId,
    pub deltas: Vec<QuantDelta>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DocumentCanceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCanceled {
    pub document: DocumentId,
    pub from: DocumentStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DocumentDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDeleted {
    pub document: DocumentId,
    pub number: DocumentNumber,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReconciled {
    pub document: DocumentId,
    pub number: DocumentNumber,
    pub product: ProductId,
    pub location: LocationId,
    pub previous: i64,
    pub counted: i64,
    pub direction: CountDirection,
    pub counted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    DocumentCreated(DocumentCreated),
    DocumentUpdated(DocumentUpdated),
    DocumentStatusChanged(DocumentStatusChanged),
    DocumentValidated(DocumentValidated),
    DocumentCanceled(DocumentCanceled),
    DocumentDeleted(DocumentDeleted),
    StockReconciled(StockReconciled),
}

impl LedgerEvent {
    /// Id of the entity the event is about. Every event concerns a document.
    pub fn subject_id(&self) -> Uuid {
        let document = match self {
            LedgerEvent::DocumentCreated(e) => e.document,
            LedgerEvent::DocumentUpdated(e) => e.document,
            LedgerEvent::DocumentStatusChanged(e) => e.document,
            LedgerEvent::DocumentValidated(e) => e.document,
            LedgerEvent::DocumentCanceled(e) => e.document,
            LedgerEvent::DocumentDeleted(e) => e.document,
            LedgerEvent::StockReconciled(e) => e.document,
        };
        document.into()
    }

    /// Products whose stock changed, if any.
    pub fn affected_products(&self) -> Vec<ProductId> {
        let mut products: Vec<ProductId> = match self {
            LedgerEvent::DocumentValidated(e) => e.deltas.iter().map(|d| d.key.product).collect(),
            LedgerEvent::StockReconciled(e) => vec![e.product],
            _ => Vec::new(),
        };
        products.sort();
        products.dedup();
        products
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::DocumentCreated(_) => "document.created",
            LedgerEvent::DocumentUpdated(_) => "document.updated",
            LedgerEvent::DocumentStatusChanged(_) => "document.status_changed",
            LedgerEvent::DocumentValidated(_) => "document.validated",
            LedgerEvent::DocumentCanceled(_) => "document.canceled",
            LedgerEvent::DocumentDeleted(_) => "document.deleted",
            LedgerEvent::StockReconciled(_) => "stock.reconciled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::DocumentCreated(e) => e.occurred_at,
            LedgerEvent::DocumentUpdated(e) => e.occurred_at,
            LedgerEvent::DocumentStatusChanged(e) => e.occurred_at,
            LedgerEvent::DocumentValidated(e) => e.occurred_at,
            LedgerEvent::DocumentCanceled(e) => e.occurred_at,
            LedgerEvent::DocumentDeleted(e) => e.occurred_at,
            LedgerEvent::StockReconciled(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::QuantKey;

    #[test]
    fn validated_event_lists_each_product_once() {
        let p = ProductId::new();
        let key_a = QuantKey::new(p, LocationId::new());
        let key_b = QuantKey::new(p, LocationId::new());
        let document = DocumentId::new();
        let event = LedgerEvent::DocumentValidated(DocumentValidated {
            document,
            number: DocumentNumber::format(DocumentType::InternalTransfer, 3),
            doc_type: DocumentType::InternalTransfer,
            validated_by: UserId::new(),
            deltas: vec![
                QuantDelta {
                    key: key_a,
                    delta: -5,
                },
                QuantDelta {
                    key: key_b,
                    delta: 5,
                },
            ],
            occurred_at: Utc::now(),
        });

        assert_eq!(event.event_type(), "document.validated");
        assert_eq!(event.affected_products(), vec![p]);
        assert_eq!(event.subject_id(), Uuid::from(document));
    }

    #[test]
    fn status_change_touches_no_stock() {
        let event = LedgerEvent::DocumentStatusChanged(DocumentStatusChanged {
            document: DocumentId::new(),
            from: DocumentStatus::Draft,
            to: DocumentStatus::Ready,
            occurred_at: Utc::now(),
        });
        assert!(event.affected_products().is_empty());
        assert_eq!(event.version(), 1);
    }
}
