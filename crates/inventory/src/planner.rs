//! Stock planning: turn a document (or a physical count) plus the current quantities of the
//! rows it touches into the exact writes a store must perform.
//!
//! Planning is pure. Stores lock every key from [`touched_keys`] in ascending order, read
//! their values into a [`QuantSnapshot`], plan, and only then write. A plan that comes back
//! `Ok` can always be applied in full, so a failed check never leaves partial effects.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, ProductId};

use crate::document::{Document, DocumentType};
use crate::error::{LedgerError, LedgerResult, LocationRole};
use crate::line::{LineQuantity, MovementLine};

/// Identity of a quant row. Ordering (product, then location) is the global lock order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuantKey {
    pub product: ProductId,
    pub location: LocationId,
}

impl QuantKey {
    pub fn new(product: ProductId, location: LocationId) -> Self {
        Self { product, location }
    }
}

impl core::fmt::Display for QuantKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.product, self.location)
    }
}

/// Current value of each locked row. `None` means the row does not exist, which is distinct
/// from an existing row holding zero.
pub type QuantSnapshot = BTreeMap<QuantKey, Option<i64>>;

/// Signed change a single line makes to a single row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantDelta {
    pub key: QuantKey,
    pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockPlan {
    /// Per-line changes in line order (zero-diff adjustments are omitted).
    pub deltas: Vec<QuantDelta>,
    /// Final value of every row that changes. Rows not listed keep their value.
    pub writes: BTreeMap<QuantKey, i64>,
}

impl StockPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Every quant row validating `doc` could read or write, in lock order.
pub fn touched_keys(doc: &Document) -> BTreeSet<QuantKey> {
    let mut keys = BTreeSet::new();
    for line in doc.lines() {
        let (source, destination) = effective_locations(doc.doc_type(), line);
        keys.extend(source.map(|l| QuantKey::new(line.product, l)));
        keys.extend(destination.map(|l| QuantKey::new(line.product, l)));
    }
    keys
}

/// Locations a line actually moves stock at, by document type. A receipt may name a vendor
/// location as its source; that location has no quant row to decrement.
fn effective_locations(
    doc_type: DocumentType,
    line: &MovementLine,
) -> (Option<LocationId>, Option<LocationId>) {
    match doc_type {
        DocumentType::Receipt => (None, line.to_location),
        DocumentType::Delivery => (line.from_location, None),
        DocumentType::InternalTransfer => (line.from_location, line.to_location),
        DocumentType::Adjustment => (None, line.to_location),
    }
}

/// Compute the stock effect of validating `doc`.
///
/// Lines apply sequentially against a working copy, so two lines drawing on the same row
/// see each other's effect. Returns the first failing check.
pub fn plan_validation(doc: &Document, snapshot: &QuantSnapshot) -> LedgerResult<StockPlan> {
    let mut working = snapshot.clone();
    let mut plan = StockPlan::default();

    for line in doc.lines() {
        let (source, destination) = effective_locations(doc.doc_type(), line);
        match line.quantity {
            LineQuantity::Amount(qty) => {
                let source_key = match (doc.doc_type().requires_source(), source) {
                    (true, None) => return Err(missing(doc.doc_type(), LocationRole::Source)),
                    (_, s) => s.map(|l| QuantKey::new(line.product, l)),
                };
                let destination_key = match (doc.doc_type().requires_destination(), destination)
                {
                    (true, None) => {
                        return Err(missing(doc.doc_type(), LocationRole::Destination));
                    }
                    (_, d) => d.map(|l| QuantKey::new(line.product, l)),
                };

                if let Some(key) = source_key {
                    decrease(&mut working, &mut plan, key, qty)?;
                }
                if let Some(key) = destination_key {
                    increase(&mut working, &mut plan, key, qty)?;
                }
            }
            LineQuantity::TargetCount(target) => {
                let location =
                    destination.ok_or_else(|| missing(doc.doc_type(), LocationRole::Destination))?;
                set_count(&mut working, &mut plan, QuantKey::new(line.product, location), target)?;
            }
            LineQuantity::CountDelta(_) => {
                return Err(LedgerError::validation(format!(
                    "line {} records an applied count and cannot be validated again",
                    line.id
                )));
            }
        }
    }

    Ok(plan)
}

fn missing(doc_type: DocumentType, role: LocationRole) -> LedgerError {
    LedgerError::MissingRequiredLocation { doc_type, role }
}

fn current(working: &QuantSnapshot, key: QuantKey) -> LedgerResult<Option<i64>> {
    working
        .get(&key)
        .copied()
        .ok_or_else(|| LedgerError::storage(format!("quant row {key} was not locked")))
}

fn overflow(key: QuantKey) -> LedgerError {
    LedgerError::validation(format!("quantity overflow at {key}"))
}

fn record(working: &mut QuantSnapshot, plan: &mut StockPlan, key: QuantKey, delta: i64, next: i64) {
    working.insert(key, Some(next));
    plan.writes.insert(key, next);
    plan.deltas.push(QuantDelta { key, delta });
}

fn increase(
    working: &mut QuantSnapshot,
    plan: &mut StockPlan,
    key: QuantKey,
    qty: i64,
) -> LedgerResult<()> {
    let available = current(working, key)?.unwrap_or(0);
    let next = available.checked_add(qty).ok_or_else(|| overflow(key))?;
    record(working, plan, key, qty, next);
    Ok(())
}

fn decrease(
    working: &mut QuantSnapshot,
    plan: &mut StockPlan,
    key: QuantKey,
    qty: i64,
) -> LedgerResult<()> {
    let available = current(working, key)?.unwrap_or(0);
    if available < qty {
        return Err(LedgerError::InsufficientStock {
            product: key.product,
            location: key.location,
            available,
            requested: qty,
        });
    }
    record(working, plan, key, -qty, available - qty);
    Ok(())
}

fn set_count(
    working: &mut QuantSnapshot,
    plan: &mut StockPlan,
    key: QuantKey,
    target: i64,
) -> LedgerResult<()> {
    if target < 0 {
        return Err(LedgerError::validation(format!(
            "counted quantity at {key} cannot be negative"
        )));
    }
    let existing = current(working, key)?;
    let available = existing.unwrap_or(0);
    let diff = target.checked_sub(available).ok_or_else(|| overflow(key))?;
    if diff == 0 {
        return Ok(());
    }
    record(working, plan, key, diff, target);
    Ok(())
}

/// Which way a physical count moves stock relative to the warehouse's adjustment location.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountDirection {
    /// More on the shelf than recorded: stock comes in from the adjustment location.
    Surplus,
    /// Less on the shelf than recorded: stock goes out to the adjustment location.
    Shortage,
}

/// Outcome of comparing a physical count to the recorded quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub product: ProductId,
    /// Counted location.
    pub location: LocationId,
    /// The warehouse's ADJUSTMENT location.
    pub counterpart: LocationId,
    pub previous: i64,
    pub counted: i64,
    pub direction: CountDirection,
    /// Absolute difference, always positive.
    pub line_quantity: i64,
    pub from_location: LocationId,
    pub to_location: LocationId,
}

impl ReconcilePlan {
    pub fn key(&self) -> QuantKey {
        QuantKey::new(self.product, self.location)
    }

    /// Signed change at the counted location.
    pub fn delta(&self) -> i64 {
        self.counted - self.previous
    }
}

/// Fails unless `counted` is a valid count that differs from the recorded quantity.
/// Returns the recorded quantity (zero for an absent row).
pub fn check_count_differs(
    product: ProductId,
    location: LocationId,
    current: Option<i64>,
    counted: i64,
) -> LedgerResult<i64> {
    if counted < 0 {
        return Err(LedgerError::validation("counted quantity cannot be negative"));
    }
    let previous = current.unwrap_or(0);
    if counted == previous {
        return Err(LedgerError::NoAdjustmentNeeded {
            product,
            location,
            quantity: counted,
        });
    }
    Ok(previous)
}

/// Plan a reconciliation. Only the counted row changes; the counterpart is bookkeeping.
pub fn plan_reconciliation(
    product: ProductId,
    location: LocationId,
    counterpart: LocationId,
    current: Option<i64>,
    counted: i64,
) -> LedgerResult<ReconcilePlan> {
    let previous = check_count_differs(product, location, current, counted)?;
    let (direction, from_location, to_location) = if counted > previous {
        (CountDirection::Surplus, counterpart, location)
    } else {
        (CountDirection::Shortage, location, counterpart)
    };

    Ok(ReconcilePlan {
        product,
        location,
        counterpart,
        previous,
        counted,
        direction,
        line_quantity: (counted - previous).abs(),
        from_location,
        to_location,
    })
}
