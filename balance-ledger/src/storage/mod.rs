//! Storage layer using SQLite
//!
//! # Tables
//!
//! - `ledger_entries` - Append-only entry log (key: monotonic id)
//! - `balance_cache` - One cached balance per subject (key: tenant, subject)
//! - `reservations` - Soft holds on stock (key: reservation id)
//!
//! Each table has exactly one access module. Functions take a
//! `&mut SqliteConnection`, so the same code path serves pooled reads and
//! statements inside a transaction.

pub mod balances;
pub mod entries;
pub mod reservations;

use crate::{
    error::{Error, Result},
    types::{SubjectId, TenantId},
    Config,
};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Embedded schema migrations
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Storage wrapper for the SQLite pool
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open or create database and apply migrations
    pub async fn open(config: &Config) -> Result<Self> {
        let url = config.database_url.as_str();
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        if !in_memory {
            if let Some(parent) = Self::database_path(url).and_then(|p| p.parent()) {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.storage.busy_timeout_ms))
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_millis(config.storage.acquire_timeout_ms));

        // Every connection to an in-memory database is a separate database.
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.storage.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        MIGRATOR.run(&pool).await?;

        tracing::info!(
            database_url = %url,
            max_connections = config.storage.max_connections,
            "Opened ledger store"
        );

        Ok(Self { pool })
    }

    fn database_path(url: &str) -> Option<&Path> {
        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next()?;
        if path.is_empty() {
            None
        } else {
            Some(Path::new(path))
        }
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Get storage statistics for a tenant
    pub async fn get_stats(&self, tenant: &TenantId) -> Result<StorageStats> {
        let (total_entries, voided_entries): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(voided), 0)
            FROM ledger_entries
            WHERE tenant_id = ?1
            "#,
        )
        .bind(tenant.as_str())
        .fetch_one(&self.pool)
        .await?;

        let (total_subjects,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM balance_cache WHERE tenant_id = ?1")
                .bind(tenant.as_str())
                .fetch_one(&self.pool)
                .await?;

        let (active_reservations,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM reservations WHERE tenant_id = ?1 AND status = 'ACTIVE'",
        )
        .bind(tenant.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            total_entries: total_entries as u64,
            voided_entries: voided_entries as u64,
            total_subjects: total_subjects as u64,
            active_reservations: active_reservations as u64,
        })
    }

    /// Close pool (graceful shutdown)
    pub async fn close(self) {
        self.pool.close().await;
        tracing::info!("Ledger store closed gracefully");
    }
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Entries in the log, voided included
    pub total_entries: u64,
    /// Voided entries (originals and their reversals)
    pub voided_entries: u64,
    /// Subjects with a cache row
    pub total_subjects: u64,
    /// ACTIVE reservations
    pub active_reservations: u64,
}

// Row decoding helpers

pub(crate) fn decimal_col(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).map_err(|e| Error::Corrupt(format!("{} = {:?}: {}", col, raw, e)))
}

pub(crate) fn opt_decimal_col(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        Decimal::from_str(&s).map_err(|e| Error::Corrupt(format!("{} = {:?}: {}", col, s, e)))
    })
    .transpose()
}

pub(crate) fn subject_col(row: &SqliteRow, col: &str) -> Result<SubjectId> {
    let raw: String = row.try_get(col)?;
    SubjectId::parse(&raw).ok_or_else(|| Error::Corrupt(format!("{} = {:?}", col, raw)))
}

pub(crate) fn tenant_col(row: &SqliteRow, col: &str) -> Result<TenantId> {
    let raw: String = row.try_get(col)?;
    Ok(TenantId::new(raw))
}

/// Canonical text form of a decimal
pub(crate) fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}
