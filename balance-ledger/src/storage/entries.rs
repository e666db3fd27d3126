//! `ledger_entries` access
//!
//! Entries are inserted and, at most once, flagged voided. Nothing here
//! updates amounts or deletes rows; the schema triggers reject both.

use super::{decimal_col, decimal_text, subject_col, tenant_col};
use crate::error::{is_unique_violation, overflowed_sum, Error, Result};
use crate::types::{EntryId, EntryKind, LedgerEntry, Reference, SubjectId, TenantId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;

const ENTRY_COLUMNS: &str = r#"
    id, tenant_id, subject_id, kind, debit, credit, balance_before, balance_after,
    source_event_id, reference, reverses_entry_id, voided, voided_at, void_reason,
    created_at, created_by
"#;

/// Entry about to be appended
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Subject
    pub subject_id: SubjectId,
    /// Kind
    pub kind: EntryKind,
    /// Debit side
    pub debit: Decimal,
    /// Credit side
    pub credit: Decimal,
    /// Cache before
    pub balance_before: Decimal,
    /// Cache after
    pub balance_after: Decimal,
    /// Idempotency key
    pub source_event_id: Option<String>,
    /// Document link
    pub reference: Reference,
    /// Compensated entry
    pub reverses_entry_id: Option<EntryId>,
    /// Written already voided (reversal half of a void pair)
    pub voided: bool,
    /// Void reason when written voided
    pub void_reason: Option<String>,
    /// Commit time
    pub created_at: DateTime<Utc>,
    /// Actor
    pub created_by: String,
}

/// Append an entry.
///
/// A clash on the idempotency index surfaces as [`Error::DuplicateEvent`].
pub async fn insert(conn: &mut SqliteConnection, entry: NewEntry) -> Result<LedgerEntry> {
    let reference_json = serde_json::to_string(&entry.reference)
        .map_err(|e| Error::Corrupt(format!("reference not serializable: {}", e)))?;
    let voided_at = entry.voided.then_some(entry.created_at);

    let result = sqlx::query(
        r#"
        INSERT INTO ledger_entries (
            tenant_id, subject_id, kind, debit, credit, balance_before, balance_after,
            source_event_id, reference_type, reference_id, reference, origin_document_id,
            reverses_entry_id, voided, voided_at, void_reason, created_at, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        "#,
    )
    .bind(entry.tenant_id.as_str())
    .bind(entry.subject_id.key())
    .bind(entry.kind.as_str())
    .bind(decimal_text(entry.debit))
    .bind(decimal_text(entry.credit))
    .bind(decimal_text(entry.balance_before))
    .bind(decimal_text(entry.balance_after))
    .bind(entry.source_event_id.as_deref())
    .bind(entry.reference.reference_type())
    .bind(entry.reference.reference_id())
    .bind(reference_json)
    .bind(entry.reference.origin_document_id())
    .bind(entry.reverses_entry_id.map(|id| id.0))
    .bind(entry.voided)
    .bind(voided_at)
    .bind(entry.void_reason.as_deref())
    .bind(entry.created_at)
    .bind(&entry.created_by)
    .execute(&mut *conn)
    .await;

    let result = match result {
        Ok(result) => result,
        Err(e) if is_unique_violation(&e) => {
            return Err(Error::DuplicateEvent {
                subject: entry.subject_id,
                kind: entry.kind,
                source_event_id: entry.source_event_id.unwrap_or_default(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let id = EntryId(result.last_insert_rowid());

    tracing::debug!(
        entry_id = %id,
        tenant = %entry.tenant_id,
        subject = %entry.subject_id,
        kind = %entry.kind,
        "Entry appended"
    );

    Ok(LedgerEntry {
        id,
        tenant_id: entry.tenant_id,
        subject_id: entry.subject_id,
        kind: entry.kind,
        debit: entry.debit,
        credit: entry.credit,
        balance_before: entry.balance_before,
        balance_after: entry.balance_after,
        source_event_id: entry.source_event_id,
        reference: entry.reference,
        reverses_entry_id: entry.reverses_entry_id,
        voided: entry.voided,
        voided_at,
        void_reason: entry.void_reason,
        created_at: entry.created_at,
        created_by: entry.created_by,
    })
}

/// Get entry by ID
pub async fn get(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: EntryId,
) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries WHERE tenant_id = ?1 AND id = ?2",
        ENTRY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Look up the entry already posted for a source event
pub async fn find_by_source(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    kind: EntryKind,
    source_event_id: &str,
) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        r#"
        SELECT {} FROM ledger_entries
        WHERE tenant_id = ?1 AND subject_id = ?2 AND kind = ?3 AND source_event_id = ?4
        "#,
        ENTRY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(subject.key())
        .bind(kind.as_str())
        .bind(source_event_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Full audit trail of a subject, oldest first, voided entries included
pub async fn list_for_subject(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries WHERE tenant_id = ?1 AND subject_id = ?2 ORDER BY id",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(subject.key())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Σ(debit − credit) over non-voided entries, with the number of entries summed
pub async fn true_balance(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<(Decimal, u64)> {
    let rows = sqlx::query(
        r#"
        SELECT debit, credit FROM ledger_entries
        WHERE tenant_id = ?1 AND subject_id = ?2 AND voided = 0
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .fetch_all(&mut *conn)
    .await?;

    let mut balance = Decimal::ZERO;
    for row in &rows {
        balance = balance
            .checked_add(row_delta(row)?)
            .ok_or_else(|| overflowed_sum("ledger entries"))?;
    }
    Ok((balance, rows.len() as u64))
}

/// True balances of every subject of a tenant, from a single scan of the log
pub async fn true_balances(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
) -> Result<BTreeMap<String, (Decimal, u64)>> {
    let rows = sqlx::query(
        r#"
        SELECT subject_id, debit, credit FROM ledger_entries
        WHERE tenant_id = ?1 AND voided = 0
        ORDER BY subject_id
        "#,
    )
    .bind(tenant.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut totals: BTreeMap<String, (Decimal, u64)> = BTreeMap::new();
    for row in &rows {
        let subject: String = row.try_get("subject_id")?;
        let delta = row_delta(row)?;
        let total = totals.entry(subject).or_insert((Decimal::ZERO, 0));
        total.0 = total
            .0
            .checked_add(delta)
            .ok_or_else(|| overflowed_sum("ledger entries"))?;
        total.1 += 1;
    }
    Ok(totals)
}

/// Flag an entry voided. Returns false if it was already voided.
pub async fn mark_voided(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: EntryId,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE ledger_entries
        SET voided = 1, voided_at = ?3, void_reason = ?4
        WHERE tenant_id = ?1 AND id = ?2 AND voided = 0
        "#,
    )
    .bind(tenant.as_str())
    .bind(id.0)
    .bind(at)
    .bind(reason)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Quantities of `item` received per location on a receiving document
pub async fn received_on_document(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    receipt_id: &str,
    item: &str,
) -> Result<Vec<(SubjectId, Decimal)>> {
    let rows = sqlx::query(
        r#"
        SELECT subject_id, debit, credit FROM ledger_entries
        WHERE tenant_id = ?1
          AND kind = 'RECEIPT'
          AND reference_type = 'purchase_receipt'
          AND reference_id = ?2
          AND voided = 0
        ORDER BY id
        "#,
    )
    .bind(tenant.as_str())
    .bind(receipt_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut received: Vec<(SubjectId, Decimal)> = Vec::new();
    for row in &rows {
        let subject = subject_col(row, "subject_id")?;
        if subject.item() != Some(item) {
            continue;
        }
        let qty = row_delta(row)?;
        match received.iter_mut().find(|(s, _)| *s == subject) {
            Some((_, total)) => {
                *total = total
                    .checked_add(qty)
                    .ok_or_else(|| overflowed_sum("received quantities"))?
            }
            None => received.push((subject, qty)),
        }
    }
    Ok(received)
}

/// Quantity of `item` already shipped back against a receiving document
pub async fn returned_against_document(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    receipt_id: &str,
    item: &str,
) -> Result<Decimal> {
    let rows = sqlx::query(
        r#"
        SELECT subject_id, debit, credit FROM ledger_entries
        WHERE tenant_id = ?1
          AND kind = 'RETURN_SHIPMENT'
          AND origin_document_id = ?2
          AND voided = 0
        "#,
    )
    .bind(tenant.as_str())
    .bind(receipt_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut returned = Decimal::ZERO;
    for row in &rows {
        if subject_col(row, "subject_id")?.item() == Some(item) {
            returned = returned
                .checked_sub(row_delta(row)?)
                .ok_or_else(|| overflowed_sum("returned quantities"))?;
        }
    }
    Ok(returned)
}

/// debit − credit of one row
fn row_delta(row: &SqliteRow) -> Result<Decimal> {
    decimal_col(row, "debit")?
        .checked_sub(decimal_col(row, "credit")?)
        .ok_or_else(|| overflowed_sum("debit and credit"))
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = EntryKind::parse(&kind_raw)
        .ok_or_else(|| Error::Corrupt(format!("kind = {:?}", kind_raw)))?;

    let reference_raw: String = row.try_get("reference")?;
    let reference: Reference = serde_json::from_str(&reference_raw)
        .map_err(|e| Error::Corrupt(format!("reference = {:?}: {}", reference_raw, e)))?;

    Ok(LedgerEntry {
        id: EntryId(row.try_get("id")?),
        tenant_id: tenant_col(row, "tenant_id")?,
        subject_id: subject_col(row, "subject_id")?,
        kind,
        debit: decimal_col(row, "debit")?,
        credit: decimal_col(row, "credit")?,
        balance_before: decimal_col(row, "balance_before")?,
        balance_after: decimal_col(row, "balance_after")?,
        source_event_id: row.try_get("source_event_id")?,
        reference,
        reverses_entry_id: row
            .try_get::<Option<i64>, _>("reverses_entry_id")?
            .map(EntryId),
        voided: row.try_get("voided")?,
        voided_at: row.try_get("voided_at")?,
        void_reason: row.try_get("void_reason")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
    })
}
