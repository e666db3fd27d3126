//! `reservations` access
//!
//! Status transitions are guarded in SQL (`WHERE status = 'ACTIVE'`), so a
//! reservation can leave ACTIVE at most once even if two callers race.

use super::{decimal_col, decimal_text, opt_decimal_col, subject_col, tenant_col};
use crate::error::{overflowed_sum, Error, Result};
use crate::types::{EntryId, Reservation, ReservationStatus, SubjectId, TenantId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const RESERVATION_COLUMNS: &str = r#"
    id, tenant_id, subject_id, reserved_quantity, source_document_id, status,
    created_at, resolved_at, fulfilled_quantity, consumption_entry_id, release_reason
"#;

/// Insert a new ACTIVE reservation
pub async fn insert(conn: &mut SqliteConnection, reservation: &Reservation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reservations (
            id, tenant_id, subject_id, reserved_quantity, source_document_id, status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(reservation.id)
    .bind(reservation.tenant_id.as_str())
    .bind(reservation.subject_id.key())
    .bind(decimal_text(reservation.reserved_quantity))
    .bind(&reservation.source_document_id)
    .bind(reservation.status.as_str())
    .bind(reservation.created_at)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        reservation_id = %reservation.id,
        subject = %reservation.subject_id,
        "Reservation stored"
    );
    Ok(())
}

/// Get reservation by ID
pub async fn get(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: Uuid,
) -> Result<Option<Reservation>> {
    let sql = format!(
        "SELECT {} FROM reservations WHERE tenant_id = ?1 AND id = ?2",
        RESERVATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(reservation_from_row).transpose()
}

/// Reservation taken for a document on a subject, whatever its status
pub async fn find_by_document(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    source_document_id: &str,
) -> Result<Option<Reservation>> {
    let sql = format!(
        r#"
        SELECT {} FROM reservations
        WHERE tenant_id = ?1 AND subject_id = ?2 AND source_document_id = ?3
        "#,
        RESERVATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(subject.key())
        .bind(source_document_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(reservation_from_row).transpose()
}

/// Σ reserved_quantity over ACTIVE reservations of a subject
pub async fn active_total(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<Decimal> {
    active_total_excluding(conn, tenant, subject, None).await
}

/// Σ reserved_quantity over ACTIVE reservations, leaving one reservation out
pub async fn active_total_excluding(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    excluded: Option<Uuid>,
) -> Result<Decimal> {
    let rows = sqlx::query(
        r#"
        SELECT id, reserved_quantity FROM reservations
        WHERE tenant_id = ?1 AND subject_id = ?2 AND status = 'ACTIVE'
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .fetch_all(&mut *conn)
    .await?;

    let mut total = Decimal::ZERO;
    for row in &rows {
        let id: Uuid = row.try_get("id")?;
        if Some(id) != excluded {
            total = total
                .checked_add(decimal_col(row, "reserved_quantity")?)
                .ok_or_else(|| overflowed_sum("reserved quantities"))?;
        }
    }
    Ok(total)
}

/// ACTIVE -> CONSUMED. Returns false if the reservation was no longer ACTIVE.
pub async fn mark_consumed(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: Uuid,
    fulfilled: Decimal,
    entry_id: EntryId,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE reservations
        SET status = 'CONSUMED', resolved_at = ?3, fulfilled_quantity = ?4, consumption_entry_id = ?5
        WHERE tenant_id = ?1 AND id = ?2 AND status = 'ACTIVE'
        "#,
    )
    .bind(tenant.as_str())
    .bind(id)
    .bind(at)
    .bind(decimal_text(fulfilled))
    .bind(entry_id.0)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// ACTIVE -> RELEASED. Returns false if the reservation was no longer ACTIVE.
pub async fn mark_released(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    id: Uuid,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE reservations
        SET status = 'RELEASED', resolved_at = ?3, release_reason = ?4
        WHERE tenant_id = ?1 AND id = ?2 AND status = 'ACTIVE'
        "#,
    )
    .bind(tenant.as_str())
    .bind(id)
    .bind(at)
    .bind(reason)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// ACTIVE reservations of a subject, oldest first
pub async fn list_active(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<Vec<Reservation>> {
    let sql = format!(
        r#"
        SELECT {} FROM reservations
        WHERE tenant_id = ?1 AND subject_id = ?2 AND status = 'ACTIVE'
        ORDER BY created_at
        "#,
        RESERVATION_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(subject.key())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(reservation_from_row).collect()
}

/// ACTIVE reservations created before `cutoff`, optionally for one subject
pub async fn list_stale(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: Option<&SubjectId>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Reservation>> {
    let sql = format!(
        r#"
        SELECT {} FROM reservations
        WHERE tenant_id = ?1
          AND status = 'ACTIVE'
          AND created_at < ?2
          AND (?3 IS NULL OR subject_id = ?3)
        ORDER BY created_at
        "#,
        RESERVATION_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(tenant.as_str())
        .bind(cutoff)
        .bind(subject.map(|s| s.key()))
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(reservation_from_row).collect()
}

fn reservation_from_row(row: &SqliteRow) -> Result<Reservation> {
    let status_raw: String = row.try_get("status")?;
    let status = ReservationStatus::parse(&status_raw)
        .ok_or_else(|| Error::Corrupt(format!("status = {:?}", status_raw)))?;

    Ok(Reservation {
        id: row.try_get("id")?,
        tenant_id: tenant_col(row, "tenant_id")?,
        subject_id: subject_col(row, "subject_id")?,
        reserved_quantity: decimal_col(row, "reserved_quantity")?,
        source_document_id: row.try_get("source_document_id")?,
        status,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        fulfilled_quantity: opt_decimal_col(row, "fulfilled_quantity")?,
        consumption_entry_id: row
            .try_get::<Option<i64>, _>("consumption_entry_id")?
            .map(EntryId),
        release_reason: row.try_get("release_reason")?,
    })
}
