//! Movement documents and their lifecycle.
//!
//! ```text
//!   DRAFT ⇄ WAITING ⇄ READY          (open: editable, freely re-statused)
//!     │        │        │
//!     ├────────┴────────┴──► DONE      (validate: stock applied, read-only)
//!     └────────┴────────┴──► CANCELED  (cancel: no stock effect, read-only)
//! ```
//!
//! The document itself only enforces the state machine and authoring rules; applying stock
//! is the store's job, driven by `planner::plan_validation`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DocumentId, ExpectedVersion, LocationId, MoveId, ProductId, UserId};

use crate::error::{LedgerError, LedgerResult, LocationRole};
use crate::line::{LineQuantity, MovementLine, NewLine};
use crate::numbering::DocumentNumber;
use crate::planner::ReconcilePlan;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Receipt,
    Delivery,
    InternalTransfer,
    Adjustment,
}

impl DocumentType {
    pub const ALL: [DocumentType; 4] = [
        DocumentType::Receipt,
        DocumentType::Delivery,
        DocumentType::InternalTransfer,
        DocumentType::Adjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Receipt => "RECEIPT",
            DocumentType::Delivery => "DELIVERY",
            DocumentType::InternalTransfer => "INTERNAL_TRANSFER",
            DocumentType::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Three-letter prefix used in document numbers.
    pub fn prefix(&self) -> &'static str {
        &self.as_str()[..3]
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.prefix() == prefix)
    }

    pub fn requires_source(&self) -> bool {
        matches!(self, DocumentType::Delivery | DocumentType::InternalTransfer)
    }

    pub fn requires_destination(&self) -> bool {
        !matches!(self, DocumentType::Delivery)
    }
}

impl core::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Draft,
    Waiting,
    Ready,
    Done,
    Canceled,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Draft,
        DocumentStatus::Waiting,
        DocumentStatus::Ready,
        DocumentStatus::Done,
        DocumentStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "DRAFT",
            DocumentStatus::Waiting => "WAITING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Done => "DONE",
            DocumentStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft | DocumentStatus::Waiting | DocumentStatus::Ready
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a requested target status must be carried out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusTransition {
    /// Apply stock and move to DONE.
    Validate,
    /// Move to CANCELED without touching stock.
    Cancel,
    /// Plain field update between open statuses.
    Reopen(DocumentStatus),
}

impl StatusTransition {
    pub fn for_target(target: DocumentStatus) -> Self {
        match target {
            DocumentStatus::Done => StatusTransition::Validate,
            DocumentStatus::Canceled => StatusTransition::Cancel,
            open => StatusTransition::Reopen(open),
        }
    }
}

/// Authoring input for a new document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub doc_type: DocumentType,
    pub status: DocumentStatus,
    pub from_location: Option<LocationId>,
    pub to_location: Option<LocationId>,
    /// Supplier for receipts, customer for deliveries.
    pub counterparty: Option<String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub lines: Vec<NewLine>,
}

impl NewDocument {
    pub fn new(doc_type: DocumentType) -> Self {
        Self {
            doc_type,
            status: DocumentStatus::Draft,
            from_location: None,
            to_location: None,
            counterparty: None,
            scheduled_date: None,
            lines: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: DocumentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn from(mut self, location: LocationId) -> Self {
        self.from_location = Some(location);
        self
    }

    pub fn to(mut self, location: LocationId) -> Self {
        self.to_location = Some(location);
        self
    }

    pub fn counterparty(mut self, name: impl Into<String>) -> Self {
        self.counterparty = Some(name.into());
        self
    }

    pub fn scheduled_for(mut self, date: DateTime<Utc>) -> Self {
        self.scheduled_date = Some(date);
        self
    }

    pub fn line(mut self, product: ProductId, quantity: i64) -> Self {
        self.lines.push(NewLine::new(product, quantity));
        self
    }

    pub fn products(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.lines.iter().map(|l| l.product)
    }

    pub fn locations(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.from_location.into_iter().chain(self.to_location)
    }
}

/// Edit of an open document. `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub from_location: Option<Option<LocationId>>,
    pub to_location: Option<Option<LocationId>>,
    pub counterparty: Option<Option<String>>,
    pub scheduled_date: Option<Option<DateTime<Utc>>>,
    /// Replaces the whole line set.
    pub lines: Option<Vec<NewLine>>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.from_location.is_none()
            && self.to_location.is_none()
            && self.counterparty.is_none()
            && self.scheduled_date.is_none()
            && self.lines.is_none()
    }

    /// Products and locations the patch would introduce.
    pub fn products(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.lines.iter().flatten().map(|l| l.product)
    }

    pub fn locations(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.from_location
            .into_iter()
            .flatten()
            .chain(self.to_location.into_iter().flatten())
    }
}

/// Aggregate root: a movement document with its lines.
///
/// Fields are private so every change goes through the state machine below; once DONE or
/// CANCELED every mutator refuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    number: DocumentNumber,
    doc_type: DocumentType,
    status: DocumentStatus,
    from_location: Option<LocationId>,
    to_location: Option<LocationId>,
    counterparty: Option<String>,
    scheduled_date: Option<DateTime<Utc>>,
    created_by: UserId,
    created_at: DateTime<Utc>,
    validated_by: Option<UserId>,
    validated_at: Option<DateTime<Utc>>,
    lines: Vec<MovementLine>,
    version: u64,
}

impl Document {
    /// Author a new open document.
    pub fn create(
        id: DocumentId,
        number: DocumentNumber,
        spec: NewDocument,
        created_by: UserId,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if spec.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                document: id,
                from: DocumentStatus::Draft,
                to: Some(spec.status),
            });
        }
        check_locations(spec.doc_type, spec.from_location, spec.to_location)?;
        let lines = build_lines(
            spec.doc_type,
            spec.from_location,
            spec.to_location,
            spec.lines,
        )?;

        Ok(Self {
            id,
            number,
            doc_type: spec.doc_type,
            status: spec.status,
            from_location: spec.from_location,
            to_location: spec.to_location,
            counterparty: clean_counterparty(spec.counterparty),
            scheduled_date: spec.scheduled_date,
            created_by,
            created_at,
            validated_by: None,
            validated_at: None,
            lines,
            version: 1,
        })
    }

    /// A reconciliation entry: created already DONE, validated by the counting actor.
    pub fn reconciliation(
        id: DocumentId,
        number: DocumentNumber,
        plan: &ReconcilePlan,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Self {
        let line = MovementLine {
            id: MoveId::new(),
            product: plan.product,
            from_location: Some(plan.from_location),
            to_location: Some(plan.to_location),
            quantity: LineQuantity::CountDelta(plan.line_quantity),
        };

        Self {
            id,
            number,
            doc_type: DocumentType::Adjustment,
            status: DocumentStatus::Done,
            from_location: Some(plan.from_location),
            to_location: Some(plan.to_location),
            counterparty: None,
            scheduled_date: Some(at),
            created_by: actor,
            created_at: at,
            validated_by: Some(actor),
            validated_at: Some(at),
            lines: vec![line],
            version: 1,
        }
    }

    /// Rebuild a document from persisted fields (storage adapters only).
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: DocumentId,
        number: DocumentNumber,
        doc_type: DocumentType,
        status: DocumentStatus,
        from_location: Option<LocationId>,
        to_location: Option<LocationId>,
        counterparty: Option<String>,
        scheduled_date: Option<DateTime<Utc>>,
        created_by: UserId,
        created_at: DateTime<Utc>,
        validated_by: Option<UserId>,
        validated_at: Option<DateTime<Utc>>,
        lines: Vec<MovementLine>,
        version: u64,
    ) -> Self {
        Self {
            id,
            number,
            doc_type,
            status,
            from_location,
            to_location,
            counterparty,
            scheduled_date,
            created_by,
            created_at,
            validated_by,
            validated_at,
            lines,
            version,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.id
    }

    pub fn number(&self) -> &DocumentNumber {
        &self.number
    }

    pub fn doc_type(&self) -> DocumentType {
        self.doc_type
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn from_location(&self) -> Option<LocationId> {
        self.from_location
    }

    pub fn to_location(&self) -> Option<LocationId> {
        self.to_location
    }

    pub fn counterparty(&self) -> Option<&str> {
        self.counterparty.as_deref()
    }

    pub fn scheduled_date(&self) -> Option<DateTime<Utc>> {
        self.scheduled_date
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn validated_by(&self) -> Option<UserId> {
        self.validated_by
    }

    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        self.validated_at
    }

    pub fn lines(&self) -> &[MovementLine] {
        &self.lines
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Fails unless the document can still be edited or re-statused.
    pub fn ensure_open(&self) -> LedgerResult<()> {
        if self.status.is_open() {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransition {
                document: self.id,
                from: self.status,
                to: None,
            })
        }
    }

    pub fn check_validate(&self) -> LedgerResult<()> {
        match self.status {
            DocumentStatus::Done => Err(LedgerError::AlreadyValidated { document: self.id }),
            DocumentStatus::Canceled => Err(LedgerError::InvalidTransition {
                document: self.id,
                from: self.status,
                to: Some(DocumentStatus::Done),
            }),
            _ => Ok(()),
        }
    }

    pub fn check_cancel(&self) -> LedgerResult<()> {
        match self.status {
            DocumentStatus::Done => Err(LedgerError::CannotCancelValidated { document: self.id }),
            DocumentStatus::Canceled => Err(LedgerError::AlreadyCanceled { document: self.id }),
            _ => Ok(()),
        }
    }

    /// Only open and canceled documents may be removed; a DONE document's effects live in
    /// the quantity store.
    pub fn check_deletable(&self) -> LedgerResult<()> {
        if self.status == DocumentStatus::Done {
            return Err(LedgerError::InvalidTransition {
                document: self.id,
                from: self.status,
                to: None,
            });
        }
        Ok(())
    }

    pub fn check_version(&self, expected: ExpectedVersion) -> LedgerResult<()> {
        expected.check(self.version).map_err(LedgerError::from)
    }

    /// Flip to DONE. The caller must have applied the stock plan in the same unit.
    pub fn mark_validated(&mut self, actor: UserId, at: DateTime<Utc>) -> LedgerResult<()> {
        self.check_validate()?;
        self.status = DocumentStatus::Done;
        self.validated_by = Some(actor);
        self.validated_at = Some(at);
        self.version += 1;
        Ok(())
    }

    pub fn mark_canceled(&mut self) -> LedgerResult<()> {
        self.check_cancel()?;
        self.status = DocumentStatus::Canceled;
        self.version += 1;
        Ok(())
    }

    /// Move between open statuses. Returns the previous status.
    pub fn set_open_status(&mut self, target: DocumentStatus) -> LedgerResult<DocumentStatus> {
        if self.status.is_terminal() || target.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                document: self.id,
                from: self.status,
                to: Some(target),
            });
        }
        let previous = self.status;
        if previous != target {
            self.status = target;
            self.version += 1;
        }
        Ok(previous)
    }

    /// Apply an edit while open. Either the whole patch applies or nothing changes.
    pub fn apply_patch(&mut self, patch: DocumentPatch) -> LedgerResult<()> {
        self.ensure_open()?;
        if patch.is_empty() {
            return Ok(());
        }

        let from_location = patch.from_location.unwrap_or(self.from_location);
        let to_location = patch.to_location.unwrap_or(self.to_location);
        check_locations(self.doc_type, from_location, to_location)?;

        let lines = match patch.lines {
            Some(lines) => build_lines(self.doc_type, from_location, to_location, lines)?,
            None => self
                .lines
                .iter()
                .cloned()
                .map(|mut line| {
                    line.from_location = from_location;
                    line.to_location = to_location;
                    line
                })
                .collect(),
        };

        self.from_location = from_location;
        self.to_location = to_location;
        self.lines = lines;
        if let Some(counterparty) = patch.counterparty {
            self.counterparty = clean_counterparty(counterparty);
        }
        if let Some(scheduled_date) = patch.scheduled_date {
            self.scheduled_date = scheduled_date;
        }
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for Document {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn check_locations(
    doc_type: DocumentType,
    from_location: Option<LocationId>,
    to_location: Option<LocationId>,
) -> LedgerResult<()> {
    if doc_type.requires_source() && from_location.is_none() {
        return Err(LedgerError::MissingRequiredLocation {
            doc_type,
            role: LocationRole::Source,
        });
    }
    if doc_type.requires_destination() && to_location.is_none() {
        return Err(LedgerError::MissingRequiredLocation {
            doc_type,
            role: LocationRole::Destination,
        });
    }
    if doc_type == DocumentType::InternalTransfer && from_location == to_location {
        return Err(LedgerError::validation(
            "internal transfer source and destination must differ",
        ));
    }
    Ok(())
}

fn build_lines(
    doc_type: DocumentType,
    from_location: Option<LocationId>,
    to_location: Option<LocationId>,
    lines: Vec<NewLine>,
) -> LedgerResult<Vec<MovementLine>> {
    if lines.is_empty() {
        return Err(LedgerError::validation("at least one line is required"));
    }
    lines
        .into_iter()
        .map(|line| MovementLine::authored(MoveId::new(), doc_type, from_location, to_location, line))
        .collect()
}

fn clean_counterparty(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}
