//! Reorder thresholds and stock views.

use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, ProductId, WarehouseId};

use crate::catalog::Product;
use crate::error::{LedgerError, LedgerResult};

/// Minimum (and optional preferred) on-hand quantity for a product. One per product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRule {
    pub product: ProductId,
    pub min_qty: i64,
    pub preferred_qty: Option<i64>,
}

impl ReorderRule {
    pub fn new(product: ProductId, min_qty: i64, preferred_qty: Option<i64>) -> LedgerResult<Self> {
        if min_qty < 0 {
            return Err(LedgerError::validation("minimum quantity cannot be negative"));
        }
        if preferred_qty.is_some_and(|q| q < 0) {
            return Err(LedgerError::validation("preferred quantity cannot be negative"));
        }
        Ok(Self {
            product,
            min_qty,
            preferred_qty,
        })
    }
}

/// `true` iff a rule exists and the product's total is strictly below its minimum.
pub fn is_low_stock(total: i64, rule: Option<&ReorderRule>) -> bool {
    rule.is_some_and(|r| total < r.min_qty)
}

/// One quant row as seen by readers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub location: LocationId,
    pub warehouse: WarehouseId,
    pub quantity: i64,
}

/// A product's stock across every location that has a row for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product: ProductId,
    pub total: i64,
    /// Sorted by location id. Rows at zero stay listed.
    pub breakdown: Vec<StockLevel>,
}

impl ProductStock {
    pub fn from_rows(product: ProductId, rows: impl IntoIterator<Item = StockLevel>) -> Self {
        let mut breakdown: Vec<StockLevel> = rows.into_iter().collect();
        breakdown.sort_by_key(|level| level.location);
        let total = breakdown.iter().map(|level| level.quantity).sum();
        Self {
            product,
            total,
            breakdown,
        }
    }

    pub fn quantity_at(&self, location: LocationId) -> i64 {
        self.breakdown
            .iter()
            .find(|level| level.location == location)
            .map_or(0, |level| level.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockItem {
    pub product: ProductId,
    pub sku: String,
    pub total: i64,
    pub min_qty: i64,
    pub preferred_qty: Option<i64>,
}

/// Build the low-stock list from `(product, rule, total)` triples.
///
/// Inactive products are skipped. Output is sorted by total ascending, then SKU.
pub fn low_stock_report<'a>(
    entries: impl IntoIterator<Item = (&'a Product, &'a ReorderRule, i64)>,
) -> Vec<LowStockItem> {
    let mut items: Vec<LowStockItem> = entries
        .into_iter()
        .filter(|(product, rule, total)| product.active && is_low_stock(*total, Some(*rule)))
        .map(|(product, rule, total)| LowStockItem {
            product: product.id,
            sku: product.sku.clone(),
            total,
            min_qty: rule.min_qty,
            preferred_qty: rule.preferred_qty,
        })
        .collect();
    items.sort_by(|a, b| a.total.cmp(&b.total).then_with(|| a.sku.cmp(&b.sku)));
    items
}
