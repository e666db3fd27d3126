//! Metrics collection for observability
//!
//! Prometheus metrics owned by one ledger instance, registered in its own
//! registry so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `ledger_entries_posted_total` - Entries committed (reversals included)
//! - `ledger_replays_total` - Idempotent replays of an already applied event
//! - `ledger_insufficient_balance_total` - Depletions rejected for lack of stock/balance
//! - `ledger_lock_timeouts_total` - Subject lock waits that ran out
//! - `ledger_reservations_total{outcome}` - Reservations created/consumed/released
//! - `ledger_discrepancies_found_total` - Drifted subjects found by reconciliation
//! - `ledger_cache_rows_rewritten_total` - Balance cache rows overwritten by rebuilds
//! - `ledger_post_duration_seconds` - Histogram of mutation latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries committed
    pub entries_posted: IntCounter,

    /// Idempotent replays
    pub replays: IntCounter,

    /// Rejected depletions
    pub insufficient_balance: IntCounter,

    /// Lock wait timeouts
    pub lock_timeouts: IntCounter,

    /// Reservation lifecycle events by outcome
    pub reservations: IntCounterVec,

    /// Drifted subjects found
    pub discrepancies_found: IntCounter,

    /// Cache rows rewritten by rebuilds
    pub cache_rows_rewritten: IntCounter,

    /// Mutation latency
    pub post_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_posted =
            IntCounter::new("ledger_entries_posted_total", "Entries committed to the ledger")?;
        registry.register(Box::new(entries_posted.clone()))?;

        let replays = IntCounter::new(
            "ledger_replays_total",
            "Idempotent replays of an already applied source event",
        )?;
        registry.register(Box::new(replays.clone()))?;

        let insufficient_balance = IntCounter::new(
            "ledger_insufficient_balance_total",
            "Depleting operations rejected for insufficient balance",
        )?;
        registry.register(Box::new(insufficient_balance.clone()))?;

        let lock_timeouts = IntCounter::new(
            "ledger_lock_timeouts_total",
            "Subject lock waits that exceeded the configured timeout",
        )?;
        registry.register(Box::new(lock_timeouts.clone()))?;

        let reservations = IntCounterVec::new(
            Opts::new("ledger_reservations_total", "Reservation lifecycle events"),
            &["outcome"],
        )?;
        registry.register(Box::new(reservations.clone()))?;

        let discrepancies_found = IntCounter::new(
            "ledger_discrepancies_found_total",
            "Subjects whose cached balance drifted from the ledger",
        )?;
        registry.register(Box::new(discrepancies_found.clone()))?;

        let cache_rows_rewritten = IntCounter::new(
            "ledger_cache_rows_rewritten_total",
            "Balance cache rows overwritten by reconciliation",
        )?;
        registry.register(Box::new(cache_rows_rewritten.clone()))?;

        let post_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_post_duration_seconds",
                "Histogram of mutation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(post_duration.clone()))?;

        Ok(Self {
            entries_posted,
            replays,
            insufficient_balance,
            lock_timeouts,
            reservations,
            discrepancies_found,
            cache_rows_rewritten,
            post_duration,
            registry,
        })
    }

    /// Record committed entries
    pub fn record_entries_posted(&self, count: usize) {
        self.entries_posted.inc_by(count as u64);
    }

    /// Record idempotent replay
    pub fn record_replay(&self) {
        self.replays.inc();
    }

    /// Record rejected depletion
    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance.inc();
    }

    /// Record lock timeout
    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.inc();
    }

    /// Record reservation lifecycle event (`created`, `consumed`, `released`)
    pub fn record_reservation(&self, outcome: &str) {
        self.reservations.with_label_values(&[outcome]).inc();
    }

    /// Record drifted subjects found
    pub fn record_discrepancies(&self, count: usize) {
        self.discrepancies_found.inc_by(count as u64);
    }

    /// Record cache rows rewritten
    pub fn record_cache_rewrites(&self, count: usize) {
        self.cache_rows_rewritten.inc_by(count as u64);
    }

    /// Record mutation duration
    pub fn record_post_duration(&self, duration_seconds: f64) {
        self.post_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_posted", &self.entries_posted.get())
            .field("replays", &self.replays.get())
            .field("insufficient_balance", &self.insufficient_balance.get())
            .field("lock_timeouts", &self.lock_timeouts.get())
            .finish_non_exhaustive()
    }
}
