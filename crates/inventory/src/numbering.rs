//! Human-readable document numbers (`REC-000001`, `ADJ-000042`, ...).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::document::DocumentType;

const COUNTER_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentNumber(String);

impl DocumentNumber {
    pub fn format(doc_type: DocumentType, sequence: u64) -> Self {
        Self(format!(
            "{}-{:0width$}",
            doc_type.prefix(),
            sequence,
            width = COUNTER_WIDTH
        ))
    }

    /// Split a number back into its type and counter.
    pub fn parse(s: &str) -> Option<(DocumentType, u64)> {
        let (prefix, counter) = s.split_once('-')?;
        let doc_type = DocumentType::from_prefix(prefix)?;
        let sequence = counter.parse().ok()?;
        Some((doc_type, sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-type monotonic counters.
///
/// Numbers come from counters, never from counting existing documents: deleted documents
/// would otherwise free their number for reuse. Callers hold whatever lock guards the
/// sequences while allocating.
#[derive(Debug, Clone, Default)]
pub struct NumberSequences {
    last: HashMap<DocumentType, u64>,
}

impl NumberSequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, doc_type: DocumentType) -> DocumentNumber {
        let last = self.last.entry(doc_type).or_insert(0);
        *last += 1;
        DocumentNumber::format(doc_type, *last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_use_type_prefix_and_padding() {
        assert_eq!(
            DocumentNumber::format(DocumentType::Receipt, 1).as_str(),
            "REC-000001"
        );
        assert_eq!(
            DocumentNumber::format(DocumentType::InternalTransfer, 1234).as_str(),
            "INT-001234"
        );
    }

    #[test]
    fn sequences_are_independent_per_type() {
        let mut seq = NumberSequences::new();
        assert_eq!(seq.allocate(DocumentType::Receipt).as_str(), "REC-000001");
        assert_eq!(seq.allocate(DocumentType::Receipt).as_str(), "REC-000002");
        assert_eq!(seq.allocate(DocumentType::Delivery).as_str(), "DEL-000001");
        assert_eq!(seq.allocate(DocumentType::Adjustment).as_str(), "ADJ-000001");
    }

    #[test]
    fn parse_rejects_unknown_prefix() {
        assert_eq!(DocumentNumber::parse("XYZ-000001"), None);
        assert_eq!(
            DocumentNumber::parse("ADJ-000003"),
            Some((DocumentType::Adjustment, 3))
        );
    }
}
