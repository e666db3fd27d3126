//! Per-subject serialization
//!
//! Every check-then-write against a subject (depleting posts, reservations,
//! voids, committing rebuilds) runs while holding that subject's lock, so a
//! second writer always observes the first writer's committed balance.
//! Multi-subject operations take their locks in ascending key order, which
//! rules out deadlock between two transfers moving in opposite directions.
//!
//! Waiting is bounded: a lock that cannot be taken within the configured
//! timeout fails with [`Error::SubjectLockTimeout`], which callers retry.
//!
//! Registry entries live only while someone holds or waits on them; the
//! last guard to release a subject removes its entry.

use crate::types::{SubjectId, TenantId};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration, Instant};

/// Registry of subject locks
#[derive(Debug, Default)]
pub struct SubjectLocks {
    locks: DashMap<(TenantId, String), Arc<Mutex<()>>>,
}

/// Held subject locks, released on drop
#[derive(Debug)]
pub struct SubjectGuard<'a> {
    registry: &'a SubjectLocks,
    tenant: TenantId,
    held: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for SubjectGuard<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.registry.forget_if_idle(&self.tenant, key);
        }
    }
}

impl SubjectLocks {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, tenant: &TenantId, key: String) -> Arc<Mutex<()>> {
        self.locks
            .entry((tenant.clone(), key))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn forget_if_idle(&self, tenant: &TenantId, key: String) {
        // Only the registry's own reference left: nobody holds or waits
        self.locks
            .remove_if(&(tenant.clone(), key), |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Lock one subject
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        wait: Duration,
    ) -> Result<SubjectGuard<'_>> {
        self.acquire_many(tenant, std::slice::from_ref(subject), wait).await
    }

    /// Lock several subjects in stable (sorted) order, within one overall wait budget
    pub async fn acquire_many(
        &self,
        tenant: &TenantId,
        subjects: &[SubjectId],
        wait: Duration,
    ) -> Result<SubjectGuard<'_>> {
        let mut ordered: Vec<&SubjectId> = subjects.iter().collect();
        ordered.sort_by_key(|s| s.key());
        ordered.dedup_by_key(|s| s.key());

        let started = Instant::now();
        let deadline = started + wait;
        // Built up front so locks taken before a timeout are released through Drop
        let mut acquired = SubjectGuard {
            registry: self,
            tenant: tenant.clone(),
            held: Vec::with_capacity(ordered.len()),
        };

        for subject in ordered {
            let key = subject.key();
            let lock = self.lock_for(tenant, key.clone());
            let remaining = deadline.saturating_duration_since(Instant::now());

            // Bound before matching so a timed-out wait drops its Arc first
            let outcome = timeout(remaining, lock.lock_owned()).await;
            match outcome {
                Ok(guard) => acquired.held.push((key, guard)),
                Err(_) => {
                    self.forget_if_idle(tenant, key);
                    tracing::warn!(
                        tenant = %tenant,
                        subject = %subject,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Subject lock wait exceeded"
                    );
                    return Err(Error::SubjectLockTimeout {
                        subject: subject.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        Ok(acquired)
    }

    /// Number of tracked subjects
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no subjects are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
