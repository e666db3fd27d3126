//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for quantities and money)
//! - Closed tagged variants for everything that crosses the storage boundary
//! - Tenant scoping on every identifier that reaches a query

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant identifier (isolation boundary)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create new tenant ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix of customer-account subject keys.
const ACCOUNT_PREFIX: &str = "acct:";

/// What a ledger tracks a balance for.
///
/// Stock subjects render as `WAREHOUSE/ITEM` (e.g. `WH1/ITEM42`), account
/// subjects as `acct:CUSTOMER`. Warehouse codes must not contain `/` or
/// start with `acct:`; [`SubjectId::validate`] enforces this before any write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubjectId {
    /// Inventory location x item
    Stock {
        /// Warehouse / stock location code
        warehouse: String,
        /// Item code
        item: String,
    },
    /// Customer accounts-receivable balance
    Account {
        /// Customer code
        customer: String,
    },
}

impl SubjectId {
    /// Stock subject for a warehouse and item
    pub fn stock(warehouse: impl Into<String>, item: impl Into<String>) -> Self {
        SubjectId::Stock {
            warehouse: warehouse.into(),
            item: item.into(),
        }
    }

    /// Customer account subject
    pub fn account(customer: impl Into<String>) -> Self {
        SubjectId::Account {
            customer: customer.into(),
        }
    }

    /// Canonical storage key
    pub fn key(&self) -> String {
        match self {
            SubjectId::Stock { warehouse, item } => format!("{}/{}", warehouse, item),
            SubjectId::Account { customer } => format!("{}{}", ACCOUNT_PREFIX, customer),
        }
    }

    /// Parse a canonical storage key
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(customer) = key.strip_prefix(ACCOUNT_PREFIX) {
            if customer.is_empty() {
                return None;
            }
            return Some(SubjectId::account(customer));
        }

        let (warehouse, item) = key.split_once('/')?;
        if warehouse.is_empty() || item.is_empty() {
            return None;
        }
        Some(SubjectId::stock(warehouse, item))
    }

    /// Reject subjects whose storage key would not parse back to themselves
    pub fn validate(&self) -> crate::Result<()> {
        let problem = match self {
            SubjectId::Stock { warehouse, item } => {
                if warehouse.trim().is_empty() || item.trim().is_empty() {
                    Some("warehouse and item must not be empty")
                } else if warehouse.contains('/') {
                    Some("warehouse must not contain '/'")
                } else if warehouse.starts_with(ACCOUNT_PREFIX) {
                    Some("warehouse must not start with 'acct:'")
                } else {
                    None
                }
            }
            SubjectId::Account { customer } if customer.trim().is_empty() => {
                Some("customer must not be empty")
            }
            SubjectId::Account { .. } => None,
        };

        match problem {
            Some(problem) => Err(crate::Error::InvalidRequest(format!(
                "subject {:?}: {}",
                self.key(),
                problem
            ))),
            None => Ok(()),
        }
    }

    /// Item code, for stock subjects
    pub fn item(&self) -> Option<&str> {
        match self {
            SubjectId::Stock { item, .. } => Some(item),
            SubjectId::Account { .. } => None,
        }
    }

    /// Warehouse code, for stock subjects
    pub fn warehouse(&self) -> Option<&str> {
        match self {
            SubjectId::Stock { warehouse, .. } => Some(warehouse),
            SubjectId::Account { .. } => None,
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl TryFrom<String> for SubjectId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SubjectId::parse(&value).ok_or_else(|| format!("invalid subject key: {}", value))
    }
}

impl From<SubjectId> for String {
    fn from(subject: SubjectId) -> Self {
        subject.key()
    }
}

/// Monotonically assigned ledger entry ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the entry a posting lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Increases the balance
    Debit,
    /// Decreases the balance
    Credit,
    /// Sign carried by the amount itself
    Signed,
}

/// Entry category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    /// Goods received into a location
    Receipt,
    /// Goods leaving a location (sale, production, fulfilment)
    Consumption,
    /// Goods shipped back to a supplier
    ReturnShipment,
    /// Outbound leg of a transfer
    TransferOut,
    /// Inbound leg of a transfer
    TransferIn,
    /// Signed correction
    Adjustment,
    /// Customer payment (reduces receivable)
    Payment,
    /// Customer invoice (increases receivable)
    Invoice,
    /// Compensating entry written by a void
    Reversal,
}

impl EntryKind {
    /// All kinds
    pub const ALL: [EntryKind; 9] = [
        EntryKind::Receipt,
        EntryKind::Consumption,
        EntryKind::ReturnShipment,
        EntryKind::TransferOut,
        EntryKind::TransferIn,
        EntryKind::Adjustment,
        EntryKind::Payment,
        EntryKind::Invoice,
        EntryKind::Reversal,
    ];

    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Receipt => "RECEIPT",
            EntryKind::Consumption => "CONSUMPTION",
            EntryKind::ReturnShipment => "RETURN_SHIPMENT",
            EntryKind::TransferOut => "TRANSFER_OUT",
            EntryKind::TransferIn => "TRANSFER_IN",
            EntryKind::Adjustment => "ADJUSTMENT",
            EntryKind::Payment => "PAYMENT",
            EntryKind::Invoice => "INVOICE",
            EntryKind::Reversal => "REVERSAL",
        }
    }

    /// Parse storage code
    pub fn parse(s: &str) -> Option<Self> {
        EntryKind::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Side the posted amount lands on
    pub fn side(&self) -> Side {
        match self {
            EntryKind::Receipt | EntryKind::TransferIn | EntryKind::Invoice => Side::Debit,
            EntryKind::Consumption
            | EntryKind::TransferOut
            | EntryKind::ReturnShipment
            | EntryKind::Payment => Side::Credit,
            EntryKind::Adjustment | EntryKind::Reversal => Side::Signed,
        }
    }

    /// Kinds whose posting must not take the subject below zero
    pub fn is_depleting(&self) -> bool {
        matches!(
            self,
            EntryKind::Consumption | EntryKind::TransferOut | EntryKind::ReturnShipment
        )
    }

    /// Whether this kind may be posted against the given subject
    pub fn applies_to(&self, subject: &SubjectId) -> bool {
        let stock = matches!(subject, SubjectId::Stock { .. });
        match self {
            EntryKind::Receipt
            | EntryKind::Consumption
            | EntryKind::TransferOut
            | EntryKind::TransferIn
            | EntryKind::ReturnShipment => stock,
            EntryKind::Invoice | EntryKind::Payment => !stock,
            EntryKind::Adjustment | EntryKind::Reversal => true,
        }
    }

    /// Whether this kind may be posted with the given reference
    pub fn accepts(&self, reference: &Reference) -> bool {
        use Reference as R;
        match self {
            EntryKind::Receipt => matches!(reference, R::PurchaseReceipt { .. } | R::Manual { .. }),
            EntryKind::Consumption => matches!(
                reference,
                R::SalesShipment { .. } | R::Reservation { .. } | R::Manual { .. }
            ),
            EntryKind::ReturnShipment => matches!(reference, R::PurchaseReturn { .. }),
            EntryKind::TransferOut | EntryKind::TransferIn => {
                matches!(reference, R::StockTransfer { .. })
            }
            EntryKind::Adjustment => matches!(reference, R::Manual { .. }),
            EntryKind::Payment => matches!(reference, R::CustomerPayment { .. }),
            EntryKind::Invoice => matches!(reference, R::CustomerInvoice { .. }),
            EntryKind::Reversal => matches!(reference, R::Void { .. }),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business document that caused an entry. Audit only, never used for recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reference {
    /// Purchase receiving document
    PurchaseReceipt {
        /// Receipt document ID
        receipt_id: String,
    },
    /// Line of a return to supplier
    PurchaseReturn {
        /// Return document ID
        return_id: String,
        /// Return line ID
        line_id: String,
        /// Receiving document the goods originally came in on
        original_receipt_id: Option<String>,
    },
    /// Inter-location stock transfer
    StockTransfer {
        /// Transfer document ID
        transfer_id: String,
    },
    /// Outbound sales shipment
    SalesShipment {
        /// Sales order ID
        order_id: String,
    },
    /// Fulfilment of a reservation
    Reservation {
        /// Reservation ID
        reservation_id: Uuid,
        /// Document the reservation was taken for
        source_document_id: String,
    },
    /// Customer invoice
    CustomerInvoice {
        /// Invoice ID
        invoice_id: String,
    },
    /// Customer payment
    CustomerPayment {
        /// Payment ID
        payment_id: String,
    },
    /// Manual correction
    Manual {
        /// Free-text note
        note: String,
    },
    /// Void of an earlier entry
    Void {
        /// Entry being voided
        entry_id: EntryId,
        /// Operator reason
        reason: String,
    },
}

impl Reference {
    /// Short type code stored in `reference_type`
    pub fn reference_type(&self) -> &'static str {
        match self {
            Reference::PurchaseReceipt { .. } => "purchase_receipt",
            Reference::PurchaseReturn { .. } => "purchase_return",
            Reference::StockTransfer { .. } => "stock_transfer",
            Reference::SalesShipment { .. } => "sales_shipment",
            Reference::Reservation { .. } => "reservation",
            Reference::CustomerInvoice { .. } => "customer_invoice",
            Reference::CustomerPayment { .. } => "customer_payment",
            Reference::Manual { .. } => "manual",
            Reference::Void { .. } => "void",
        }
    }

    /// Primary document ID stored in `reference_id`
    pub fn reference_id(&self) -> String {
        match self {
            Reference::PurchaseReceipt { receipt_id } => receipt_id.clone(),
            Reference::PurchaseReturn {
                return_id, line_id, ..
            } => format!("{}#{}", return_id, line_id),
            Reference::StockTransfer { transfer_id } => transfer_id.clone(),
            Reference::SalesShipment { order_id } => order_id.clone(),
            Reference::Reservation { reservation_id, .. } => reservation_id.to_string(),
            Reference::CustomerInvoice { invoice_id } => invoice_id.clone(),
            Reference::CustomerPayment { payment_id } => payment_id.clone(),
            Reference::Manual { note } => note.clone(),
            Reference::Void { entry_id, .. } => entry_id.to_string(),
        }
    }

    /// Original receiving document, for traceability queries
    pub fn origin_document_id(&self) -> Option<&str> {
        match self {
            Reference::PurchaseReturn {
                original_receipt_id,
                ..
            } => original_receipt_id.as_deref(),
            _ => None,
        }
    }
}

/// Immutable record of a single posted change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic ID
    pub id: EntryId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Subject affected
    pub subject_id: SubjectId,

    /// Entry category
    pub kind: EntryKind,

    /// Amount increasing the balance (non-negative)
    pub debit: Decimal,

    /// Amount decreasing the balance (non-negative)
    pub credit: Decimal,

    /// Cached balance just before this entry was applied
    pub balance_before: Decimal,

    /// Cached balance just after this entry was applied
    pub balance_after: Decimal,

    /// External correlation key for the idempotency guard
    pub source_event_id: Option<String>,

    /// Business document link
    pub reference: Reference,

    /// Entry this one compensates (reversals only)
    pub reverses_entry_id: Option<EntryId>,

    /// Excluded from balance computation
    pub voided: bool,

    /// When the entry was voided
    pub voided_at: Option<DateTime<Utc>>,

    /// Why the entry was voided
    pub void_reason: Option<String>,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,

    /// Acting user or process
    pub created_by: String,
}

impl LedgerEntry {
    /// Signed effect on the balance
    pub fn delta(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// Denormalized current balance of one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Subject
    pub subject_id: SubjectId,
    /// Materialized Σ(non-voided entries)
    pub cached_balance: Decimal,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Last committing reconciliation
    pub last_rebuilt_at: Option<DateTime<Utc>>,
}

/// Reservation lifecycle: ACTIVE -> {CONSUMED, RELEASED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Holding quantity
    Active,
    /// Fulfilled by a ledger entry (terminal)
    Consumed,
    /// Cancelled without ledger effect (terminal)
    Released,
}

impl ReservationStatus {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Consumed => "CONSUMED",
            ReservationStatus::Released => "RELEASED",
        }
    }

    /// Parse storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ReservationStatus::Active),
            "CONSUMED" => Some(ReservationStatus::Consumed),
            "RELEASED" => Some(ReservationStatus::Released),
            _ => None,
        }
    }

    /// Check if reservation is in terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Soft hold on stock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID (UUIDv7)
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Held subject
    pub subject_id: SubjectId,
    /// Quantity held while ACTIVE
    pub reserved_quantity: Decimal,
    /// Document the hold was taken for
    pub source_document_id: String,
    /// Lifecycle state
    pub status: ReservationStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of consumption or release
    pub resolved_at: Option<DateTime<Utc>>,
    /// Quantity actually consumed
    pub fulfilled_quantity: Option<Decimal>,
    /// Ledger entry posted on fulfilment
    pub consumption_entry_id: Option<EntryId>,
    /// Why the hold was released
    pub release_reason: Option<String>,
}

/// Input to [`crate::Ledger::post`]
#[derive(Debug, Clone)]
pub struct PostRequest {
    /// Owning tenant
    pub tenant: TenantId,
    /// Subject to post against
    pub subject: SubjectId,
    /// Entry category
    pub kind: EntryKind,
    /// Positive magnitude, or signed for adjustments
    pub amount: Decimal,
    /// Idempotency key, unique per (subject, kind)
    pub source_event_id: Option<String>,
    /// Business document link
    pub reference: Reference,
    /// Skip the insufficiency check (corrective flows only)
    pub allow_negative: bool,
    /// Acting user or process
    pub actor: String,
}

impl PostRequest {
    /// Create a request posted by `system`
    pub fn new(
        tenant: TenantId,
        subject: SubjectId,
        kind: EntryKind,
        amount: Decimal,
        reference: Reference,
    ) -> Self {
        Self {
            tenant,
            subject,
            kind,
            amount,
            source_event_id: None,
            reference,
            allow_negative: false,
            actor: "system".to_string(),
        }
    }

    /// Attach an idempotency key
    pub fn with_source_event(mut self, source_event_id: impl Into<String>) -> Self {
        self.source_event_id = Some(source_event_id.into());
        self
    }

    /// Allow the balance to go negative
    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    /// Set acting user
    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Result of a post
#[derive(Debug, Clone)]
pub struct Posted {
    /// The committed entry (the original one on replay)
    pub entry: LedgerEntry,
    /// True when the source event had already been applied
    pub replayed: bool,
}

/// Input to [`crate::Ledger::transfer`]
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Owning tenant
    pub tenant: TenantId,
    /// Source subject
    pub from: SubjectId,
    /// Destination subject
    pub to: SubjectId,
    /// Positive quantity
    pub quantity: Decimal,
    /// Transfer document ID, also the idempotency key of both legs
    pub transfer_id: String,
    /// Acting user or process
    pub actor: String,
}

/// Both legs of a committed transfer
#[derive(Debug, Clone)]
pub struct Transfer {
    /// TRANSFER_OUT entry on the source
    pub outbound: LedgerEntry,
    /// TRANSFER_IN entry on the destination
    pub inbound: LedgerEntry,
    /// True when the transfer had already been applied
    pub replayed: bool,
}

/// Input to [`crate::Ledger::reserve`]
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Owning tenant
    pub tenant: TenantId,
    /// Subject to hold
    pub subject: SubjectId,
    /// Positive quantity
    pub quantity: Decimal,
    /// Document the hold is for; one reservation per (subject, document)
    pub source_document_id: String,
}

/// One line of a return to supplier
#[derive(Debug, Clone)]
pub struct ReturnLine {
    /// Line ID within the return
    pub line_id: String,
    /// Location x item the goods leave from
    pub subject: SubjectId,
    /// Positive quantity
    pub quantity: Decimal,
    /// Receiving document the goods came in on, when traceable
    pub original_receipt_id: Option<String>,
}

/// A multi-line return to supplier
#[derive(Debug, Clone)]
pub struct ReturnShipment {
    /// Owning tenant
    pub tenant: TenantId,
    /// Return document ID
    pub return_id: String,
    /// Lines to ship
    pub lines: Vec<ReturnLine>,
    /// Acting user or process
    pub actor: String,
}
