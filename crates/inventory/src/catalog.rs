//! Catalog records the ledger references but never mutates.
//!
//! Products and locations are owned by the administrative layer; the ledger only needs
//! enough of them to resolve references, reject inactive products and find a warehouse's
//! adjustment counterpart.

use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, ProductId, WarehouseId};

use crate::error::{LedgerError, LedgerResult};

const DEFAULT_UNIT_OF_MEASURE: &str = "pcs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Unique, trimmed and upper-cased.
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    pub active: bool,
}

impl Product {
    pub fn new(id: ProductId, sku: &str, name: &str) -> LedgerResult<Self> {
        let sku = normalize_sku(sku)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::validation("product name cannot be empty"));
        }
        Ok(Self {
            id,
            sku,
            name: name.to_string(),
            unit_of_measure: DEFAULT_UNIT_OF_MEASURE.to_string(),
            active: true,
        })
    }

    pub fn with_unit_of_measure(mut self, unit: &str) -> Self {
        let unit = unit.trim();
        if !unit.is_empty() {
            self.unit_of_measure = unit.to_string();
        }
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Canonical SKU form used for uniqueness checks.
pub fn normalize_sku(sku: &str) -> LedgerResult<String> {
    let sku = sku.trim();
    if sku.is_empty() {
        return Err(LedgerError::validation("sku cannot be empty"));
    }
    Ok(sku.to_uppercase())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    Internal,
    Vendor,
    Customer,
    Scrap,
    /// Counterpart for reconciliation entries; one per warehouse.
    Adjustment,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Internal => "INTERNAL",
            LocationType::Vendor => "VENDOR",
            LocationType::Customer => "CUSTOMER",
            LocationType::Scrap => "SCRAP",
            LocationType::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTERNAL" => Some(LocationType::Internal),
            "VENDOR" => Some(LocationType::Vendor),
            "CUSTOMER" => Some(LocationType::Customer),
            "SCRAP" => Some(LocationType::Scrap),
            "ADJUSTMENT" => Some(LocationType::Adjustment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub warehouse_id: WarehouseId,
    pub name: String,
    pub location_type: LocationType,
}

impl Location {
    pub fn new(
        id: LocationId,
        warehouse_id: WarehouseId,
        name: &str,
        location_type: LocationType,
    ) -> Self {
        Self {
            id,
            warehouse_id,
            name: name.trim().to_string(),
            location_type,
        }
    }

    pub fn is_adjustment(&self) -> bool {
        self.location_type == LocationType::Adjustment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sku_is_trimmed_and_upper_cased() {
        let p = Product::new(ProductId::new(), "  ab-12 ", "Widget").unwrap();
        assert_eq!(p.sku, "AB-12");
        assert_eq!(p.unit_of_measure, "pcs");
        assert!(p.active);
    }

    #[test]
    fn blank_sku_or_name_is_rejected() {
        assert!(matches!(
            Product::new(ProductId::new(), "   ", "Widget"),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            Product::new(ProductId::new(), "SKU", " "),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn location_type_parse_matches_as_str() {
        for t in [
            LocationType::Internal,
            LocationType::Vendor,
            LocationType::Customer,
            LocationType::Scrap,
            LocationType::Adjustment,
        ] {
            assert_eq!(LocationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(LocationType::parse("internal"), None);
    }
}
