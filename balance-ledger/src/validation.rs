//! Return-to-supplier traceability checks
//!
//! Before stock leaves on a return, every line is checked against the
//! receiving document it came in on:
//! - quantity removed never exceeds quantity received on that document minus
//!   what earlier returns (and earlier lines of the same request) took back
//! - the location shipped from is one that received the item on that document
//! - the location actually has the stock available
//!
//! All lines are checked; the caller gets every violation at once.

use crate::error::{out_of_range, Result};
use crate::storage::{balances, entries, reservations};
use crate::types::{ReturnLine, ReturnShipment, SubjectId};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::fmt;

/// One failing line of a multi-line request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineViolation {
    /// Line ID within the request
    pub line_id: String,
    /// Subject of the line
    pub subject: SubjectId,
    /// What is wrong with it
    pub reason: ViolationReason,
}

impl fmt::Display for LineViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} ({}): {}", self.line_id, self.subject, self.reason)
    }
}

/// Violated business rule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ViolationReason {
    /// Quantity is zero or negative
    InvalidQuantity,
    /// Line is not against a stock subject
    NotStock,
    /// Original document never received this item
    NotReceived {
        /// Receiving document
        receipt_id: String,
    },
    /// Location differs from where the goods were received
    LocationMismatch {
        /// Location(s) recorded on the receiving document
        expected: Vec<String>,
        /// Location on the line
        actual: String,
    },
    /// More would be returned than was received
    ExceedsReceived {
        /// Received on the original document
        received: Decimal,
        /// Already returned against it, earlier lines included
        already_returned: Decimal,
        /// Quantity on this line
        requested: Decimal,
    },
    /// Location does not hold enough unreserved stock
    InsufficientStock {
        /// Unreserved stock left for this line
        available: Decimal,
        /// Quantity on this line
        requested: Decimal,
    },
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::InvalidQuantity => write!(f, "quantity must be positive"),
            ViolationReason::NotStock => write!(f, "returns apply to stock subjects only"),
            ViolationReason::NotReceived { receipt_id } => {
                write!(f, "item was not received on {}", receipt_id)
            }
            ViolationReason::LocationMismatch { expected, actual } => write!(
                f,
                "location {} does not match receiving location {}",
                actual,
                expected.join(", ")
            ),
            ViolationReason::ExceedsReceived {
                received,
                already_returned,
                requested,
            } => write!(
                f,
                "returning {} exceeds received {} minus already returned {}",
                requested, received, already_returned
            ),
            ViolationReason::InsufficientStock {
                available,
                requested,
            } => write!(f, "requested {}, only {} available", requested, available),
        }
    }
}

/// Validate every line of a return against the store.
///
/// Runs inside the posting transaction with all line subjects locked, so the
/// figures it reads cannot move before the lines are written.
pub(crate) async fn validate_return_lines(
    conn: &mut SqliteConnection,
    shipment: &ReturnShipment,
    lines: &[&ReturnLine],
) -> Result<Vec<LineViolation>> {
    let tenant = &shipment.tenant;
    let mut violations = Vec::new();

    // Quantities claimed by earlier lines of this request
    let mut pending_by_origin: HashMap<(String, String), Decimal> = HashMap::new();
    let mut pending_by_subject: HashMap<String, Decimal> = HashMap::new();

    for line in lines {
        let mut violate = |reason| {
            violations.push(LineViolation {
                line_id: line.line_id.clone(),
                subject: line.subject.clone(),
                reason,
            })
        };

        if line.quantity <= Decimal::ZERO {
            violate(ViolationReason::InvalidQuantity);
            continue;
        }
        let (warehouse, item) = match (line.subject.warehouse(), line.subject.item()) {
            (Some(warehouse), Some(item)) => (warehouse, item),
            _ => {
                violate(ViolationReason::NotStock);
                continue;
            }
        };

        if let Some(receipt_id) = &line.original_receipt_id {
            let received =
                entries::received_on_document(conn, tenant, receipt_id, item).await?;

            if received.is_empty() {
                violate(ViolationReason::NotReceived {
                    receipt_id: receipt_id.clone(),
                });
            } else {
                if !received.iter().any(|(s, _)| *s == line.subject) {
                    violate(ViolationReason::LocationMismatch {
                        expected: received
                            .iter()
                            .filter_map(|(s, _)| s.warehouse().map(str::to_string))
                            .collect(),
                        actual: warehouse.to_string(),
                    });
                }

                let total_received = received
                    .iter()
                    .try_fold(Decimal::ZERO, |acc, (_, q)| acc.checked_add(*q))
                    .ok_or_else(|| out_of_range(&line.subject))?;
                let origin_key = (receipt_id.clone(), item.to_string());
                let pending = pending_by_origin.entry(origin_key).or_default();
                let already_returned =
                    entries::returned_against_document(conn, tenant, receipt_id, item)
                        .await?
                        .checked_add(*pending)
                        .ok_or_else(|| out_of_range(&line.subject))?;
                let after_return = already_returned
                    .checked_add(line.quantity)
                    .ok_or_else(|| out_of_range(&line.subject))?;

                if after_return > total_received {
                    violate(ViolationReason::ExceedsReceived {
                        received: total_received,
                        already_returned,
                        requested: line.quantity,
                    });
                }
                *pending = pending
                    .checked_add(line.quantity)
                    .ok_or_else(|| out_of_range(&line.subject))?;
            }
        }

        let balance = balances::cached_balance(conn, tenant, &line.subject).await?;
        let reserved = reservations::active_total(conn, tenant, &line.subject).await?;
        let claimed = pending_by_subject.entry(line.subject.key()).or_default();
        let available = balance
            .checked_sub(reserved)
            .and_then(|free| free.checked_sub(*claimed))
            .ok_or_else(|| out_of_range(&line.subject))?;

        if line.quantity > available {
            violate(ViolationReason::InsufficientStock {
                available: available.max(Decimal::ZERO),
                requested: line.quantity,
            });
        }
        *claimed = claimed
            .checked_add(line.quantity)
            .ok_or_else(|| out_of_range(&line.subject))?;
    }

    Ok(violations)
}
