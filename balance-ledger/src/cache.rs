//! In-process read cache for balance lookups
//!
//! Owned by one [`crate::Ledger`]; never global. Entries are dropped
//! explicitly after every write that touches the subject (post, void,
//! reservation change, committing rebuild). Only writes made through the
//! owning ledger are seen, so out-of-band edits to the store stay hidden
//! until the subject is next written or the entry's TTL runs out.
//!
//! The cache holds at most `max_entries` subjects. When full, expired
//! entries are purged; if none are, the new value is not cached.

use crate::config::CacheConfig;
use crate::types::{SubjectId, TenantId};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cached view of one subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBalance {
    /// Cached ledger balance
    pub balance: Decimal,
    /// Σ ACTIVE reservations
    pub reserved: Decimal,
}

impl CachedBalance {
    /// Balance minus active reservations
    pub fn available(&self) -> Decimal {
        self.balance.saturating_sub(self.reserved)
    }
}

/// Hit/miss counters
#[derive(Default, Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
    rejected: AtomicU64,
}

impl CacheStats {
    /// Lookups served from the cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that went to the store
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped after writes
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Entries dropped because their TTL ran out
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Inserts skipped because the cache was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            (self.hits() as f64) / (total as f64) * 100.0
        }
    }
}

/// Read cache keyed by (tenant, subject key)
#[derive(Debug)]
pub struct BalanceReadCache {
    entries: DashMap<(TenantId, String), (CachedBalance, Instant)>,
    ttl: Duration,
    max_entries: usize,
    stats: CacheStats,
}

impl Default for BalanceReadCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl BalanceReadCache {
    /// Create empty cache
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries,
            stats: CacheStats::default(),
        }
    }

    /// Look up a subject
    pub fn get(&self, tenant: &TenantId, subject: &SubjectId) -> Option<CachedBalance> {
        let key = (tenant.clone(), subject.key());
        let fresh = self
            .entries
            .get(&key)
            .and_then(|entry| (entry.1.elapsed() < self.ttl).then_some(entry.0));

        match fresh {
            Some(cached) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached)
            }
            None => {
                if self
                    .entries
                    .remove_if(&key, |_, (_, stored_at)| stored_at.elapsed() >= self.ttl)
                    .is_some()
                {
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a freshly read value
    pub fn insert(&self, tenant: &TenantId, subject: &SubjectId, value: CachedBalance) {
        let key = (tenant.clone(), subject.key());
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.entries.insert(key, (value, Instant::now()));
    }

    /// Drop a subject after a write
    pub fn invalidate(&self, tenant: &TenantId, subject: &SubjectId) {
        if self.entries.remove(&(tenant.clone(), subject.key())).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(tenant = %tenant, subject = %subject, "Read cache invalidated");
        }
    }

    /// Drop every entry past its TTL, returning how many went
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            self.stats
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached subjects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
