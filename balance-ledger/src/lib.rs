//! Balance Ledger
//!
//! Ledger-backed quantity and balance engine: stock per location x item and
//! customer account balances, each kept as an append-only log of entries
//! plus a cached current balance.
//!
//! # Architecture
//!
//! - **Append-only log**: entries are inserted once and can only be voided,
//!   by a compensating reversal; the store rejects deletes and edits
//! - **Balance cache**: one row per subject, moved in the same transaction
//!   as the entry that justifies it
//! - **Idempotency**: a source event posts at most once per (subject, kind);
//!   replays return the original entry
//! - **Subject locks**: every check-then-write on a subject is serialized
//! - **Reconciliation**: balances recomputed from the log, drift reported and
//!   optionally corrected
//!
//! # Invariants
//!
//! - Conservation: cached balance == Σ(debit − credit) over non-voided entries
//! - Non-negativity: depletions never take a subject below its reservations
//!   without an explicit override
//! - Availability: Σ ACTIVE reservations never exceeds the cached balance
//! - Atomicity: multi-entry operations commit all their entries or none

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod reconcile;
pub mod storage;
pub mod types;
pub mod validation;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use reconcile::{
    BatchResult, DiscrepancyInfo, DriftSeverity, RebuildResult, RebuildScope,
    ReconciliationSummary, Unresolved,
};
pub use storage::Storage;
pub use types::{
    BalanceRow, EntryId, EntryKind, LedgerEntry, PostRequest, Posted, Reference, Reservation,
    ReservationStatus, ReserveRequest, ReturnLine, ReturnShipment, SubjectId, TenantId, Transfer,
    TransferRequest,
};
pub use validation::{LineViolation, ViolationReason};
