//! `balance_cache` access

use super::{decimal_col, decimal_text, subject_col, tenant_col};
use crate::error::Result;
use crate::types::{BalanceRow, SubjectId, TenantId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

/// Create the zero-balance row for a subject if it does not exist yet.
///
/// Mutating transactions call this first: it is a write, so SQLite takes
/// the database write lock before anything is read in the transaction.
pub async fn ensure(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO balance_cache (tenant_id, subject_id, cached_balance, updated_at)
        VALUES (?1, ?2, '0', ?3)
        ON CONFLICT (tenant_id, subject_id) DO NOTHING
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Cached balance row, if the subject has ever been written
pub async fn get(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<Option<BalanceRow>> {
    let row = sqlx::query(
        r#"
        SELECT tenant_id, subject_id, cached_balance, updated_at, last_rebuilt_at
        FROM balance_cache
        WHERE tenant_id = ?1 AND subject_id = ?2
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(balance_from_row).transpose()
}

/// Cached balance, zero for a subject with no row
pub async fn cached_balance(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
) -> Result<Decimal> {
    Ok(get(conn, tenant, subject)
        .await?
        .map(|row| row.cached_balance)
        .unwrap_or(Decimal::ZERO))
}

/// Store the balance after an entry was applied
pub async fn set(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    balance: Decimal,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO balance_cache (tenant_id, subject_id, cached_balance, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (tenant_id, subject_id)
        DO UPDATE SET cached_balance = excluded.cached_balance, updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .bind(decimal_text(balance))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Overwrite the balance with a recomputed value and stamp `last_rebuilt_at`
pub async fn overwrite_rebuilt(
    conn: &mut SqliteConnection,
    tenant: &TenantId,
    subject: &SubjectId,
    balance: Decimal,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO balance_cache (tenant_id, subject_id, cached_balance, updated_at, last_rebuilt_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT (tenant_id, subject_id)
        DO UPDATE SET
            cached_balance = excluded.cached_balance,
            updated_at = excluded.updated_at,
            last_rebuilt_at = excluded.last_rebuilt_at
        "#,
    )
    .bind(tenant.as_str())
    .bind(subject.key())
    .bind(decimal_text(balance))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Every cached balance of a tenant, ordered by subject key
pub async fn list(conn: &mut SqliteConnection, tenant: &TenantId) -> Result<Vec<BalanceRow>> {
    let rows = sqlx::query(
        r#"
        SELECT tenant_id, subject_id, cached_balance, updated_at, last_rebuilt_at
        FROM balance_cache
        WHERE tenant_id = ?1
        ORDER BY subject_id
        "#,
    )
    .bind(tenant.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(balance_from_row).collect()
}

fn balance_from_row(row: &SqliteRow) -> Result<BalanceRow> {
    Ok(BalanceRow {
        tenant_id: tenant_col(row, "tenant_id")?,
        subject_id: subject_col(row, "subject_id")?,
        cached_balance: decimal_col(row, "cached_balance")?,
        updated_at: row.try_get("updated_at")?,
        last_rebuilt_at: row.try_get("last_rebuilt_at")?,
    })
}
