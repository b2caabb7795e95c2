//! Ledger error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use stockledger_core::{DocumentId, DomainError, LocationId, ProductId};

use crate::document::{DocumentStatus, DocumentType};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Kind of record a `NotFound` refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Product,
    Location,
    /// The ADJUSTMENT-typed location of a warehouse.
    AdjustmentLocation,
    ReorderRule,
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            EntityKind::Document => "document",
            EntityKind::Product => "product",
            EntityKind::Location => "location",
            EntityKind::AdjustmentLocation => "adjustment location",
            EntityKind::ReorderRule => "reorder rule",
        })
    }
}

/// Which side of a movement a location sits on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationRole {
    Source,
    Destination,
}

impl core::fmt::Display for LocationRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            LocationRole::Source => "source",
            LocationRole::Destination => "destination",
        })
    }
}

fn target_label(to: &Option<DocumentStatus>) -> String {
    match to {
        Some(status) => format!("cannot move to {status}"),
        None => "document is read-only".to_string(),
    }
}

/// Every outcome of a ledger operation other than success.
///
/// All variants except `Storage` and `Publish` are expected business outcomes: they carry
/// enough context for the caller to act and must not be reported as unexpected failures.
/// `Storage` means the backing store failed; the operation was rolled back before
/// returning. `Publish` means the opposite: the change committed and only its event was
/// lost, so the operation must not be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    /// A terminal document was asked to change state or content.
    #[error("document {document} is {from}: {}", target_label(.to))]
    InvalidTransition {
        document: DocumentId,
        from: DocumentStatus,
        to: Option<DocumentStatus>,
    },

    #[error("document {document} is already validated")]
    AlreadyValidated { document: DocumentId },

    #[error("document {document} is already canceled")]
    AlreadyCanceled { document: DocumentId },

    #[error("document {document} is validated and cannot be canceled")]
    CannotCancelValidated { document: DocumentId },

    #[error(
        "insufficient stock of product {product} at location {location}: available {available}, requested {requested}"
    )]
    InsufficientStock {
        product: ProductId,
        location: LocationId,
        available: i64,
        requested: i64,
    },

    #[error("{doc_type} documents require a {role} location")]
    MissingRequiredLocation {
        doc_type: DocumentType,
        role: LocationRole,
    },

    #[error(
        "no adjustment needed: product {product} at location {location} already holds {quantity}"
    )]
    NoAdjustmentNeeded {
        product: ProductId,
        location: LocationId,
        quantity: i64,
    },

    #[error("product {product} already has a reorder rule")]
    DuplicateReorderRule { product: ProductId },

    /// Malformed input (empty line set, non-positive quantity, inactive product, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic version check failed on an open document.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),

    /// The change is committed; the event numbered `sequence` never reached the bus.
    #[error("committed, but event {sequence} was not published: {reason}")]
    Publish { sequence: u64, reason: String },
}

impl LedgerError {
    pub fn not_found(kind: EntityKind, id: impl Into<Uuid>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// `true` for expected outcomes, `false` for store and publish failures.
    pub fn is_business(&self) -> bool {
        !matches!(self, LedgerError::Storage(_) | LedgerError::Publish { .. })
    }

    /// `true` when the operation's change stands despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, LedgerError::Publish { .. })
    }

    /// Stable machine-readable code for collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::AlreadyValidated { .. } => "already_validated",
            LedgerError::AlreadyCanceled { .. } => "already_canceled",
            LedgerError::CannotCancelValidated { .. } => "cannot_cancel_validated",
            LedgerError::InsufficientStock { .. } => "insufficient_stock",
            LedgerError::MissingRequiredLocation { .. } => "missing_required_location",
            LedgerError::NoAdjustmentNeeded { .. } => "no_adjustment_needed",
            LedgerError::DuplicateReorderRule { .. } => "duplicate_reorder_rule",
            LedgerError::Validation(_) => "validation_error",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::Storage(_) => "storage_error",
            LedgerError::Publish { .. } => "publish_failed",
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                LedgerError::Validation(msg)
            }
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_message_names_quantities() {
        let err = LedgerError::InsufficientStock {
            product: ProductId::new(),
            location: LocationId::new(),
            available: 40,
            requested: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("available 40"));
        assert!(msg.contains("requested 60"));
        assert_eq!(err.code(), "insufficient_stock");
    }

    #[test]
    fn invalid_transition_message_mentions_target() {
        let document = DocumentId::new();
        let to_done = LedgerError::InvalidTransition {
            document,
            from: DocumentStatus::Canceled,
            to: Some(DocumentStatus::Done),
        };
        assert!(to_done.to_string().ends_with("CANCELED: cannot move to DONE"));

        let edit = LedgerError::InvalidTransition {
            document,
            from: DocumentStatus::Done,
            to: None,
        };
        assert!(edit.to_string().ends_with("read-only"));
    }

    #[test]
    fn storage_and_publish_are_not_business() {
        assert!(!LedgerError::storage("disk").is_business());
        assert!(
            !LedgerError::Publish {
                sequence: 3,
                reason: "bus closed".into()
            }
            .is_business()
        );
        assert!(LedgerError::validation("x").is_business());
        assert!(
            LedgerError::DuplicateReorderRule {
                product: ProductId::new()
            }
            .is_business()
        );
    }

    #[test]
    fn only_publish_failures_are_committed() {
        let lost = LedgerError::Publish {
            sequence: 7,
            reason: "bus closed".into(),
        };
        assert!(lost.is_committed());
        assert_eq!(lost.code(), "publish_failed");
        assert!(lost.to_string().contains("event 7"));

        let fatal = LedgerError::storage("disk");
        assert!(!fatal.is_committed());
        assert_eq!(fatal.code(), "storage_error");
    }

    #[test]
    fn domain_conflict_maps_to_conflict() {
        let err: LedgerError = DomainError::conflict("stale").into();
        assert_eq!(err, LedgerError::Conflict("stale".to_string()));
    }
}
