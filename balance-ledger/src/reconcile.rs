//! Reconciliation engine
//!
//! Recomputes balances from the entry log and compares them with the
//! balance cache. Computation is a plain read; committing a correction
//! takes the same subject locks as posting and re-derives the balance inside
//! the correcting transaction, so a rebuild never overwrites a concurrent
//! post. Drift is returned as data, never raised.

use crate::{
    storage::{balances, entries},
    types::{SubjectId, TenantId},
    Error, Ledger, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of rebuilding one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildResult {
    /// Subject
    pub subject: SubjectId,
    /// Cached balance before the rebuild
    pub previous: Decimal,
    /// Σ non-voided entries
    pub computed: Decimal,
    /// computed − previous
    pub difference: Decimal,
    /// Entries summed
    pub entry_count: u64,
    /// Whether the cache was rewritten
    pub updated: bool,
}

/// Subjects a batch rebuild covers
#[derive(Debug, Clone)]
pub enum RebuildScope {
    /// The given subjects
    Subjects(Vec<SubjectId>),
    /// Every subject of the tenant with a cache row or an entry
    All,
}

/// Subject left drifted after a committing run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unresolved {
    /// Subject
    pub subject: SubjectId,
    /// Why it was not corrected
    pub error: String,
}

/// Outcome of a batch rebuild
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    /// Per-subject results
    pub results: Vec<RebuildResult>,
    /// Subjects examined
    pub subjects_scanned: usize,
    /// Cache rows rewritten
    pub subjects_updated: usize,
    /// Σ |difference|
    pub total_drift: Decimal,
    /// Drifted subjects that could not be corrected
    pub unresolved: Vec<Unresolved>,
}

/// How far a cached balance is off, relative to its size
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    /// At or below the significant threshold
    Minor,
    /// Above the significant threshold
    Significant,
    /// Above the critical threshold
    Critical,
}

/// One drifted subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscrepancyInfo {
    /// Subject
    pub subject: SubjectId,
    /// Cached balance
    pub cached: Decimal,
    /// Σ non-voided entries
    pub computed: Decimal,
    /// computed − cached
    pub difference: Decimal,
    /// |difference| as a percentage of |cached| (100 when cached is zero)
    pub percentage: Decimal,
    /// Classification
    pub severity: DriftSeverity,
}

/// Report of a scheduled run
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    /// Tenant reconciled
    pub tenant: TenantId,
    /// Drifted subjects found
    pub found: usize,
    /// Drifted subjects corrected
    pub fixed: usize,
    /// Drifted subjects still wrong after the run
    pub unresolved: Vec<Unresolved>,
    /// Σ |difference| over found subjects
    pub total_drift: Decimal,
    /// Every discrepancy, largest first
    pub details: Vec<DiscrepancyInfo>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

/// Percentage deviation of `difference` relative to `cached`.
///
/// Saturates at `Decimal::MAX` when the ratio leaves the decimal range,
/// e.g. against a near-zero cached value.
pub fn drift_percentage(cached: Decimal, difference: Decimal) -> Decimal {
    if cached.is_zero() {
        if difference.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::ONE_HUNDRED
        }
    } else {
        difference
            .abs()
            .checked_div(cached.abs())
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .map(|pct| pct.round_dp(4))
            .unwrap_or(Decimal::MAX)
    }
}

/// Classify a percentage deviation against the configured thresholds
pub fn classify(
    percentage: Decimal,
    significant_pct: Decimal,
    critical_pct: Decimal,
) -> DriftSeverity {
    if percentage <= significant_pct {
        DriftSeverity::Minor
    } else if percentage <= critical_pct {
        DriftSeverity::Significant
    } else {
        DriftSeverity::Critical
    }
}

/// Σ |difference|, saturating instead of overflowing
fn absolute_total(differences: impl Iterator<Item = Decimal>) -> Decimal {
    differences.fold(Decimal::ZERO, |acc, d| acc.saturating_add(d.abs()))
}

impl Ledger {
    /// Σ non-voided entries of a subject and how many there are
    pub async fn compute_true_balance(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
    ) -> Result<(Decimal, u64)> {
        let mut conn = self.storage().pool().acquire().await?;
        entries::true_balance(&mut *conn, tenant, subject).await
    }

    /// Compare one subject's cache with its entries, rewriting it if `commit`
    pub async fn rebuild(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        commit: bool,
    ) -> Result<RebuildResult> {
        if !commit {
            let mut conn = self.storage().pool().acquire().await?;
            let previous = balances::cached_balance(&mut *conn, tenant, subject).await?;
            let (computed, entry_count) = entries::true_balance(&mut *conn, tenant, subject).await?;
            return Ok(RebuildResult {
                subject: subject.clone(),
                previous,
                computed,
                difference: computed.saturating_sub(previous),
                entry_count,
                updated: false,
            });
        }

        let _guard = self.lock(tenant, std::slice::from_ref(subject)).await?;
        let mut results = self.commit_rebuilds(tenant, std::slice::from_ref(subject)).await?;
        results.pop().ok_or_else(|| Error::Corrupt(format!("no rebuild result for {}", subject)))
    }

    /// Recompute and overwrite inside one transaction. Caller holds the locks.
    async fn commit_rebuilds(
        &self,
        tenant: &TenantId,
        subjects: &[SubjectId],
    ) -> Result<Vec<RebuildResult>> {
        let now = Utc::now();
        let mut tx = self.storage().begin().await?;
        let mut results = Vec::with_capacity(subjects.len());

        for subject in subjects {
            balances::ensure(&mut *tx, tenant, subject, now).await?;
            let previous = balances::cached_balance(&mut *tx, tenant, subject).await?;
            let (computed, entry_count) = entries::true_balance(&mut *tx, tenant, subject).await?;
            let difference = computed.saturating_sub(previous);
            let updated = !difference.is_zero();

            if updated {
                balances::overwrite_rebuilt(&mut *tx, tenant, subject, computed, now).await?;
            }
            results.push(RebuildResult {
                subject: subject.clone(),
                previous,
                computed,
                difference,
                entry_count,
                updated,
            });
        }

        tx.commit().await?;

        let rewritten = results.iter().filter(|r| r.updated).count();
        for result in results.iter().filter(|r| r.updated) {
            self.invalidate(tenant, &result.subject);
            tracing::info!(
                tenant = %tenant,
                subject = %result.subject,
                previous = %result.previous,
                computed = %result.computed,
                difference = %result.difference,
                "Balance cache rebuilt"
            );
        }
        self.metrics().record_cache_rewrites(rewritten);
        Ok(results)
    }

    /// Rebuild many subjects from one scan of the entry log.
    ///
    /// The scan itself takes no locks and reads one consistent snapshot.
    /// With `commit`, only the subjects found drifted are locked (in key
    /// order) and recomputed inside a single transaction; if their locks
    /// cannot be taken they are reported in `unresolved` with their scanned
    /// figures.
    pub async fn rebuild_batch(
        &self,
        tenant: &TenantId,
        scope: RebuildScope,
        commit: bool,
        only_with_drift: bool,
    ) -> Result<BatchResult> {
        // Both reads share one snapshot so a post committing mid-scan is
        // either wholly visible or not at all.
        let (computed, cached) = {
            let mut snapshot = self.storage().begin().await?;
            let computed = entries::true_balances(&mut *snapshot, tenant).await?;
            let cached: BTreeMap<String, Decimal> = balances::list(&mut *snapshot, tenant)
                .await?
                .into_iter()
                .map(|row| (row.subject_id.key(), row.cached_balance))
                .collect();
            snapshot.rollback().await?;
            (computed, cached)
        };

        let subjects: Vec<SubjectId> = match scope {
            RebuildScope::Subjects(subjects) => subjects,
            RebuildScope::All => {
                let mut keys: Vec<&String> = computed.keys().chain(cached.keys()).collect();
                keys.sort();
                keys.dedup();
                keys.into_iter()
                    .map(|key| {
                        SubjectId::parse(key)
                            .ok_or_else(|| Error::Corrupt(format!("subject_id = {:?}", key)))
                    })
                    .collect::<Result<_>>()?
            }
        };

        let mut results: Vec<RebuildResult> = subjects
            .iter()
            .map(|subject| {
                let key = subject.key();
                let previous = cached.get(&key).copied().unwrap_or(Decimal::ZERO);
                let (true_balance, entry_count) =
                    computed.get(&key).copied().unwrap_or((Decimal::ZERO, 0));
                RebuildResult {
                    subject: subject.clone(),
                    previous,
                    computed: true_balance,
                    difference: true_balance.saturating_sub(previous),
                    entry_count,
                    updated: false,
                }
            })
            .collect();

        let mut unresolved = Vec::new();
        let drifted: Vec<SubjectId> = results
            .iter()
            .filter(|r| !r.difference.is_zero())
            .map(|r| r.subject.clone())
            .collect();

        if commit && !drifted.is_empty() {
            match self.lock(tenant, &drifted).await {
                Ok(_guard) => {
                    let committed = self.commit_rebuilds(tenant, &drifted).await?;
                    for fresh in committed {
                        let slot = results.iter_mut().find(|r| r.subject == fresh.subject);
                        if let Some(slot) = slot {
                            *slot = fresh;
                        }
                    }
                }
                Err(e @ Error::SubjectLockTimeout { .. }) => {
                    tracing::warn!(
                        tenant = %tenant,
                        subjects = drifted.len(),
                        error = %e,
                        "Could not lock drifted subjects for rebuild"
                    );
                    unresolved = drifted
                        .into_iter()
                        .map(|subject| Unresolved {
                            subject,
                            error: e.to_string(),
                        })
                        .collect();
                }
                Err(e) => return Err(e),
            }
        }

        let subjects_scanned = results.len();
        if only_with_drift {
            results.retain(|r| !r.difference.is_zero());
        }

        let batch = BatchResult {
            subjects_scanned,
            subjects_updated: results.iter().filter(|r| r.updated).count(),
            total_drift: absolute_total(results.iter().map(|r| r.difference)),
            results,
            unresolved,
        };

        tracing::debug!(
            tenant = %tenant,
            scanned = batch.subjects_scanned,
            updated = batch.subjects_updated,
            total_drift = %batch.total_drift,
            "Batch rebuild finished"
        );

        Ok(batch)
    }

    /// Subjects whose |cached − computed| exceeds `tolerance`, largest drift first
    pub async fn find_discrepancies(
        &self,
        tenant: &TenantId,
        tolerance: Decimal,
    ) -> Result<Vec<DiscrepancyInfo>> {
        let batch = self
            .rebuild_batch(tenant, RebuildScope::All, false, true)
            .await?;
        let thresholds = &self.config().reconciliation;

        let mut found: Vec<DiscrepancyInfo> = batch
            .results
            .into_iter()
            .filter(|r| r.difference.abs() > tolerance)
            .map(|r| {
                let percentage = drift_percentage(r.previous, r.difference);
                DiscrepancyInfo {
                    subject: r.subject,
                    cached: r.previous,
                    computed: r.computed,
                    difference: r.difference,
                    percentage,
                    severity: classify(
                        percentage,
                        thresholds.significant_pct,
                        thresholds.critical_pct,
                    ),
                }
            })
            .collect();

        found.sort_by(|a, b| {
            b.difference
                .abs()
                .cmp(&a.difference.abs())
                .then_with(|| a.subject.key().cmp(&b.subject.key()))
        });

        self.metrics().record_discrepancies(found.len());
        Ok(found)
    }

    /// Periodic entry point: find drift and optionally correct it
    pub async fn run_scheduled_reconciliation(
        &self,
        tenant: &TenantId,
        auto_fix: bool,
    ) -> Result<ReconciliationSummary> {
        let started_at = Utc::now();
        self.purge_expired_cache();
        let tolerance = self.config().reconciliation.tolerance;
        let details = self.find_discrepancies(tenant, tolerance).await?;

        for d in &details {
            match d.severity {
                DriftSeverity::Critical => tracing::error!(
                    tenant = %tenant,
                    subject = %d.subject,
                    cached = %d.cached,
                    computed = %d.computed,
                    percentage = %d.percentage,
                    "Critical balance drift"
                ),
                _ => tracing::warn!(
                    tenant = %tenant,
                    subject = %d.subject,
                    cached = %d.cached,
                    computed = %d.computed,
                    percentage = %d.percentage,
                    severity = ?d.severity,
                    "Balance drift"
                ),
            }
        }

        let mut fixed = 0;
        let mut unresolved: Vec<Unresolved> = Vec::new();

        if auto_fix && !details.is_empty() {
            let subjects = details.iter().map(|d| d.subject.clone()).collect();
            match self
                .rebuild_batch(tenant, RebuildScope::Subjects(subjects), true, false)
                .await
            {
                Ok(batch) => {
                    fixed = batch.subjects_updated;
                    unresolved = batch.unresolved;
                }
                Err(e) => {
                    tracing::error!(tenant = %tenant, error = %e, "Auto-fix failed");
                    unresolved = details
                        .iter()
                        .map(|d| Unresolved {
                            subject: d.subject.clone(),
                            error: e.to_string(),
                        })
                        .collect();
                }
            }
        } else {
            unresolved = details
                .iter()
                .map(|d| Unresolved {
                    subject: d.subject.clone(),
                    error: "auto-fix disabled".to_string(),
                })
                .collect();
        }

        let summary = ReconciliationSummary {
            tenant: tenant.clone(),
            found: details.len(),
            fixed,
            total_drift: absolute_total(details.iter().map(|d| d.difference)),
            unresolved,
            details,
            started_at,
            finished_at: Utc::now(),
        };

        if auto_fix && !summary.unresolved.is_empty() {
            tracing::error!(
                tenant = %tenant,
                found = summary.found,
                fixed = summary.fixed,
                unresolved = summary.unresolved.len(),
                "Reconciliation left drift uncorrected"
            );
        } else {
            tracing::info!(
                tenant = %tenant,
                found = summary.found,
                fixed = summary.fixed,
                total_drift = %summary.total_drift,
                "Reconciliation finished"
            );
        }

        Ok(summary)
    }
}
