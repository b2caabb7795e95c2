//! Movement lines (stock moves) owned by a document.

use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, MoveId, ProductId};

use crate::document::DocumentType;
use crate::error::{LedgerError, LedgerResult};

/// What a line's number means.
///
/// Adjustment documents carry two unrelated meanings depending on how they were made, so
/// the meaning travels with the value instead of being inferred from the document type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LineQuantity {
    /// Literal amount moved from source to destination (receipt, delivery, transfer).
    Amount(i64),
    /// Absolute count expected at the destination once the adjustment is validated.
    TargetCount(i64),
    /// Magnitude already moved between the counterpart and the counted location by a
    /// reconciliation; the direction is given by the line's locations.
    CountDelta(i64),
}

impl LineQuantity {
    pub fn value(&self) -> i64 {
        match *self {
            LineQuantity::Amount(q) | LineQuantity::TargetCount(q) | LineQuantity::CountDelta(q) => q,
        }
    }
}

/// Line as supplied by a collaborator when authoring a document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub product: ProductId,
    pub quantity: i64,
}

impl NewLine {
    pub fn new(product: ProductId, quantity: i64) -> Self {
        Self { product, quantity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLine {
    pub id: MoveId,
    pub product: ProductId,
    pub from_location: Option<LocationId>,
    pub to_location: Option<LocationId>,
    pub quantity: LineQuantity,
}

impl MovementLine {
    /// Build an authored line. Lines inherit the header's locations.
    pub fn authored(
        id: MoveId,
        doc_type: DocumentType,
        from_location: Option<LocationId>,
        to_location: Option<LocationId>,
        line: NewLine,
    ) -> LedgerResult<Self> {
        let quantity = match doc_type {
            DocumentType::Adjustment => {
                if line.quantity < 0 {
                    return Err(LedgerError::validation(format!(
                        "counted quantity for product {} cannot be negative",
                        line.product
                    )));
                }
                LineQuantity::TargetCount(line.quantity)
            }
            _ => {
                if line.quantity <= 0 {
                    return Err(LedgerError::validation(format!(
                        "quantity for product {} must be positive",
                        line.product
                    )));
                }
                LineQuantity::Amount(line.quantity)
            }
        };

        Ok(Self {
            id,
            product: line.product,
            from_location,
            to_location,
            quantity,
        })
    }

    /// Every location this line references.
    pub fn locations(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.from_location.into_iter().chain(self.to_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_lines_are_target_counts_and_allow_zero() {
        let line = MovementLine::authored(
            MoveId::new(),
            DocumentType::Adjustment,
            None,
            Some(LocationId::new()),
            NewLine::new(ProductId::new(), 0),
        )
        .unwrap();
        assert_eq!(line.quantity, LineQuantity::TargetCount(0));
    }

    #[test]
    fn movement_lines_require_positive_amounts() {
        for qty in [0, -5] {
            let err = MovementLine::authored(
                MoveId::new(),
                DocumentType::Receipt,
                None,
                Some(LocationId::new()),
                NewLine::new(ProductId::new(), qty),
            )
            .unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)));
        }
    }

    #[test]
    fn lines_copy_header_locations() {
        let from = LocationId::new();
        let to = LocationId::new();
        let line = MovementLine::authored(
            MoveId::new(),
            DocumentType::InternalTransfer,
            Some(from),
            Some(to),
            NewLine::new(ProductId::new(), 3),
        )
        .unwrap();
        assert_eq!(line.locations().collect::<Vec<_>>(), vec![from, to]);
        assert_eq!(line.quantity.value(), 3);
    }
}
