//! Error types for the ledger

use crate::types::{EntryId, EntryKind, ReservationStatus, SubjectId};
use crate::validation::LineViolation;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite primary result code for a busy database.
const SQLITE_BUSY: &str = "5";

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Depleting operation would take the subject below zero
    #[error("Insufficient balance on {subject}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Subject that would go negative
        subject: SubjectId,
        /// Quantity asked for
        requested: Decimal,
        /// Quantity that could be taken
        available: Decimal,
    },

    /// Source event already applied. Converted into a replay at the service boundary.
    #[error("Duplicate event {source_event_id} for {subject} ({kind})")]
    DuplicateEvent {
        /// Subject
        subject: SubjectId,
        /// Entry kind
        kind: EntryKind,
        /// Idempotency key
        source_event_id: String,
    },

    /// Per-subject lock not acquired within the configured wait
    #[error("Timed out after {waited_ms}ms waiting for lock on {subject}")]
    SubjectLockTimeout {
        /// Contended subject
        subject: SubjectId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Business-rule violations, every failing line included
    #[error("Validation failed: {}", format_violations(.0))]
    ValidationFailed(Vec<LineViolation>),

    /// Zero or malformed amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Request is structurally invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Reservation state change not allowed
    #[error("Reservation {reservation_id} is {status}, cannot {action}")]
    InvalidTransition {
        /// Reservation
        reservation_id: Uuid,
        /// Current state
        status: ReservationStatus,
        /// Attempted action
        action: &'static str,
    },

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Reservation not found
    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// Storage error (SQLite)
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Persisted value could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_violations(violations: &[LineViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the caller may retry the same request (safe: posts are idempotent)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SubjectLockTimeout { .. } => true,
            Error::Storage(sqlx::Error::Database(db)) => db.code().as_deref() == Some(SQLITE_BUSY),
            Error::Storage(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::DuplicateEvent { .. } => "duplicate_event",
            Error::SubjectLockTimeout { .. } => "subject_lock_timeout",
            Error::ValidationFailed(_) => "validation_failed",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::EntryNotFound(_) | Error::ReservationNotFound(_) => "not_found",
            Error::Storage(_) | Error::Migration(_) | Error::Io(_) => "storage_error",
            Error::Corrupt(_) => "corrupt_record",
            Error::Config(_) | Error::Metrics(_) => "config_error",
        }
    }

    /// Whether the error is the caller's to fix (4xx-style)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::ValidationFailed(_)
                | Error::InvalidAmount(_)
                | Error::InvalidRequest(_)
                | Error::InvalidTransition { .. }
                | Error::EntryNotFound(_)
                | Error::ReservationNotFound(_)
        )
    }
}

/// Detect a unique constraint violation from the store.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// A checked Decimal operation on a request left the representable range
pub(crate) fn out_of_range(subject: &SubjectId) -> Error {
    Error::InvalidAmount(format!(
        "amount on {} leaves the representable decimal range",
        subject
    ))
}

/// Stored figures whose sum overflows were not written by this engine
pub(crate) fn overflowed_sum(what: &str) -> Error {
    Error::Corrupt(format!("sum of {} overflows the decimal range", what))
}
