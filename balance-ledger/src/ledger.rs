//! Mutation service
//!
//! [`Ledger`] is the only writer of entries and cached balances. Every
//! operation runs as one SQLite transaction while holding the locks of the
//! subjects it touches, and drops those subjects from the read cache before
//! releasing the locks.
//!
//! # Example
//!
//! ```no_run
//! use balance_ledger::{Config, EntryKind, Ledger, PostRequest, Reference, SubjectId, TenantId};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> balance_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::from_env()?).await?;
//!
//!     let posted = ledger
//!         .post(
//!             PostRequest::new(
//!                 TenantId::new("acme"),
//!                 SubjectId::stock("WH1", "ITEM42"),
//!                 EntryKind::Receipt,
//!                 Decimal::from(100),
//!                 Reference::PurchaseReceipt { receipt_id: "RCV-1".into() },
//!             )
//!             .with_source_event("rcv-1-line-1"),
//!         )
//!         .await?;
//!     assert!(!posted.replayed);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    cache::{BalanceReadCache, CacheStats, CachedBalance},
    locks::{SubjectGuard, SubjectLocks},
    metrics::Metrics,
    storage::{
        balances,
        entries::{self, NewEntry},
        reservations,
    },
    types::{
        EntryId, EntryKind, LedgerEntry, PostRequest, Posted, Reference, Reservation,
        ReservationStatus, ReserveRequest, ReturnShipment, Side, SubjectId, TenantId, Transfer,
        TransferRequest,
    },
    validation::validate_return_lines,
    error::out_of_range,
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::slice;
use tokio::time::Duration;
use uuid::Uuid;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// SQLite store
    storage: Storage,

    /// Per-subject serialization
    pub(crate) locks: SubjectLocks,

    /// Balance read cache
    cache: BalanceReadCache,

    /// Prometheus metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

/// Insufficiency check applied to a leg
#[derive(Debug, Clone, Copy)]
enum Floor {
    /// No check (credits, corrective flows)
    Unchecked,
    /// Balance after the leg must cover ACTIVE reservations, optionally ignoring one
    Reservations { excluding: Option<Uuid> },
}

/// One entry to write inside an open transaction
#[derive(Debug)]
struct Leg<'a> {
    subject: &'a SubjectId,
    kind: EntryKind,
    debit: Decimal,
    credit: Decimal,
    source_event_id: Option<String>,
    reference: Reference,
    reverses_entry_id: Option<EntryId>,
    void_reason: Option<String>,
    floor: Floor,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(&config).await?;
        Self::with_storage(storage, config)
    }

    /// Build a ledger over an already opened store
    pub fn with_storage(storage: Storage, config: Config) -> Result<Self> {
        Ok(Self {
            storage,
            locks: SubjectLocks::new(),
            cache: BalanceReadCache::new(&config.cache),
            metrics: Metrics::new()?,
            config,
        })
    }

    /// Underlying store
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Metrics of this instance
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read cache counters
    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.config.locking.lock_timeout_ms)
    }

    pub(crate) async fn lock(
        &self,
        tenant: &TenantId,
        subjects: &[SubjectId],
    ) -> Result<SubjectGuard<'_>> {
        for subject in subjects {
            subject.validate()?;
        }
        let result = self
            .locks
            .acquire_many(tenant, subjects, self.lock_wait())
            .await;
        if matches!(result, Err(Error::SubjectLockTimeout { .. })) {
            self.metrics.record_lock_timeout();
        }
        result
    }

    pub(crate) fn invalidate(&self, tenant: &TenantId, subject: &SubjectId) {
        self.cache.invalidate(tenant, subject);
    }

    /// Drop read-cache entries past their TTL
    pub fn purge_expired_cache(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Expired read cache entries dropped");
        }
        purged
    }

    // =========================================================================
    // POSTING
    // =========================================================================

    /// Post one entry.
    ///
    /// Replaying a `source_event_id` already posted for the same subject and
    /// kind returns the original entry with `replayed = true`.
    pub async fn post(&self, req: PostRequest) -> Result<Posted> {
        let (debit, credit) = sides(req.kind, req.amount)?;
        if !req.kind.applies_to(&req.subject) {
            return Err(Error::InvalidRequest(format!(
                "{} cannot be posted against {}",
                req.kind, req.subject
            )));
        }
        if !req.kind.accepts(&req.reference) {
            return Err(Error::InvalidRequest(format!(
                "{} cannot reference a {} document",
                req.kind,
                req.reference.reference_type()
            )));
        }

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self.lock(&req.tenant, slice::from_ref(&req.subject)).await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, &req.tenant, &req.subject, now).await?;

        if let Some(event) = &req.source_event_id {
            if let Some(entry) =
                entries::find_by_source(&mut *tx, &req.tenant, &req.subject, req.kind, event)
                    .await?
            {
                tx.rollback().await?;
                return Ok(self.replayed(entry));
            }
        }

        let floor = if req.kind.is_depleting() && !req.allow_negative {
            Floor::Reservations { excluding: None }
        } else {
            Floor::Unchecked
        };

        let leg = Leg {
            subject: &req.subject,
            kind: req.kind,
            debit,
            credit,
            source_event_id: req.source_event_id.clone(),
            reference: req.reference.clone(),
            reverses_entry_id: None,
            void_reason: None,
            floor,
        };

        let entry = match self
            .apply_leg(&mut *tx, &req.tenant, leg, &req.actor, now)
            .await
        {
            Ok(entry) => entry,
            Err(Error::DuplicateEvent { .. }) => {
                // Written by another process between lookup and insert
                tx.rollback().await?;
                return self.replay_from_store(&req).await;
            }
            Err(e) => return Err(e),
        };

        tx.commit().await?;
        self.invalidate(&req.tenant, &req.subject);
        self.metrics.record_entries_posted(1);

        tracing::info!(
            tenant = %req.tenant,
            subject = %req.subject,
            kind = %req.kind,
            entry_id = %entry.id,
            balance = %entry.balance_after,
            "Entry posted"
        );

        Ok(Posted {
            entry,
            replayed: false,
        })
    }

    async fn replay_from_store(&self, req: &PostRequest) -> Result<Posted> {
        let event = req.source_event_id.as_deref().unwrap_or_default();
        let mut conn = self.storage.pool().acquire().await?;
        match entries::find_by_source(&mut *conn, &req.tenant, &req.subject, req.kind, event)
            .await?
        {
            Some(entry) => Ok(self.replayed(entry)),
            None => Err(Error::Corrupt(format!(
                "source event {} reported duplicate but not found",
                event
            ))),
        }
    }

    fn replayed(&self, entry: LedgerEntry) -> Posted {
        self.metrics.record_replay();
        tracing::debug!(
            tenant = %entry.tenant_id,
            subject = %entry.subject_id,
            kind = %entry.kind,
            entry_id = %entry.id,
            "Source event already applied, replaying"
        );
        Posted {
            entry,
            replayed: true,
        }
    }

    /// Move stock between two subjects: TRANSFER_OUT then TRANSFER_IN, both or neither
    pub async fn transfer(&self, req: TransferRequest) -> Result<Transfer> {
        positive(req.quantity)?;
        if req.from == req.to {
            return Err(Error::InvalidRequest(format!(
                "transfer source and destination are both {}",
                req.from
            )));
        }
        if req.transfer_id.is_empty() {
            return Err(Error::InvalidRequest("transfer_id is required".to_string()));
        }

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self
            .lock(&req.tenant, &[req.from.clone(), req.to.clone()])
            .await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, &req.tenant, &req.from, now).await?;
        balances::ensure(&mut *tx, &req.tenant, &req.to, now).await?;

        let existing_out = entries::find_by_source(
            &mut *tx,
            &req.tenant,
            &req.from,
            EntryKind::TransferOut,
            &req.transfer_id,
        )
        .await?;
        let existing_in = entries::find_by_source(
            &mut *tx,
            &req.tenant,
            &req.to,
            EntryKind::TransferIn,
            &req.transfer_id,
        )
        .await?;

        match (existing_out, existing_in) {
            (Some(outbound), Some(inbound)) => {
                tx.rollback().await?;
                self.metrics.record_replay();
                tracing::debug!(
                    tenant = %req.tenant,
                    transfer_id = %req.transfer_id,
                    "Transfer already applied, replaying"
                );
                return Ok(Transfer {
                    outbound,
                    inbound,
                    replayed: true,
                });
            }
            (None, None) => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "transfer {} was already applied between other subjects",
                    req.transfer_id
                )));
            }
        }

        let reference = Reference::StockTransfer {
            transfer_id: req.transfer_id.clone(),
        };

        let outbound = self
            .apply_leg(
                &mut *tx,
                &req.tenant,
                Leg {
                    subject: &req.from,
                    kind: EntryKind::TransferOut,
                    debit: Decimal::ZERO,
                    credit: req.quantity,
                    source_event_id: Some(req.transfer_id.clone()),
                    reference: reference.clone(),
                    reverses_entry_id: None,
                    void_reason: None,
                    floor: Floor::Reservations { excluding: None },
                },
                &req.actor,
                now,
            )
            .await?;

        let inbound = self
            .apply_leg(
                &mut *tx,
                &req.tenant,
                Leg {
                    subject: &req.to,
                    kind: EntryKind::TransferIn,
                    debit: req.quantity,
                    credit: Decimal::ZERO,
                    source_event_id: Some(req.transfer_id.clone()),
                    reference,
                    reverses_entry_id: None,
                    void_reason: None,
                    floor: Floor::Unchecked,
                },
                &req.actor,
                now,
            )
            .await?;

        tx.commit().await?;
        self.invalidate(&req.tenant, &req.from);
        self.invalidate(&req.tenant, &req.to);
        self.metrics.record_entries_posted(2);

        tracing::info!(
            tenant = %req.tenant,
            from = %req.from,
            to = %req.to,
            quantity = %req.quantity,
            transfer_id = %req.transfer_id,
            "Transfer posted"
        );

        Ok(Transfer {
            outbound,
            inbound,
            replayed: false,
        })
    }

    /// Ship a multi-line return to the supplier.
    ///
    /// Every line is validated against its receiving document first; any
    /// violation aborts the whole return and all violations are reported.
    /// Lines already posted under the same return are replayed.
    pub async fn post_return_shipment(&self, shipment: ReturnShipment) -> Result<Vec<Posted>> {
        if shipment.return_id.is_empty() {
            return Err(Error::InvalidRequest("return_id is required".to_string()));
        }
        if shipment.lines.is_empty() {
            return Err(Error::InvalidRequest("return has no lines".to_string()));
        }
        let mut seen = HashSet::new();
        for line in &shipment.lines {
            if !seen.insert(line.line_id.as_str()) {
                return Err(Error::InvalidRequest(format!(
                    "line {} appears twice",
                    line.line_id
                )));
            }
        }

        let subjects: Vec<SubjectId> = shipment.lines.iter().map(|l| l.subject.clone()).collect();
        let tenant = &shipment.tenant;

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self.lock(tenant, &subjects).await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        for subject in &subjects {
            balances::ensure(&mut *tx, tenant, subject, now).await?;
        }

        let mut results: Vec<Option<Posted>> = Vec::with_capacity(shipment.lines.len());
        let mut pending = Vec::new();
        for line in &shipment.lines {
            let event = return_event_id(&shipment.return_id, &line.line_id);
            match entries::find_by_source(
                &mut *tx,
                tenant,
                &line.subject,
                EntryKind::ReturnShipment,
                &event,
            )
            .await?
            {
                Some(entry) => results.push(Some(self.replayed(entry))),
                None => {
                    results.push(None);
                    pending.push(line);
                }
            }
        }

        if pending.is_empty() {
            tx.rollback().await?;
            return Ok(results.into_iter().flatten().collect());
        }

        let violations = validate_return_lines(&mut *tx, &shipment, &pending).await?;
        if !violations.is_empty() {
            tx.rollback().await?;
            tracing::warn!(
                tenant = %tenant,
                return_id = %shipment.return_id,
                violations = violations.len(),
                "Return shipment rejected"
            );
            return Err(Error::ValidationFailed(violations));
        }

        let mut posted = Vec::with_capacity(pending.len());
        for line in &pending {
            let entry = self
                .apply_leg(
                    &mut *tx,
                    tenant,
                    Leg {
                        subject: &line.subject,
                        kind: EntryKind::ReturnShipment,
                        debit: Decimal::ZERO,
                        credit: line.quantity,
                        source_event_id: Some(return_event_id(
                            &shipment.return_id,
                            &line.line_id,
                        )),
                        reference: Reference::PurchaseReturn {
                            return_id: shipment.return_id.clone(),
                            line_id: line.line_id.clone(),
                            original_receipt_id: line.original_receipt_id.clone(),
                        },
                        reverses_entry_id: None,
                        void_reason: None,
                        floor: Floor::Reservations { excluding: None },
                    },
                    &shipment.actor,
                    now,
                )
                .await?;
            posted.push(entry);
        }

        tx.commit().await?;
        for subject in &subjects {
            self.invalidate(tenant, subject);
        }
        self.metrics.record_entries_posted(posted.len());

        tracing::info!(
            tenant = %tenant,
            return_id = %shipment.return_id,
            lines = posted.len(),
            "Return shipment posted"
        );

        let mut posted = posted.into_iter();
        Ok(results
            .into_iter()
            .filter_map(|slot| {
                slot.or_else(|| {
                    posted.next().map(|entry| Posted {
                        entry,
                        replayed: false,
                    })
                })
            })
            .collect())
    }

    /// Void an entry by appending its reversal.
    ///
    /// Returns the REVERSAL entry. Voiding again returns the same reversal.
    pub async fn void_entry(
        &self,
        tenant: &TenantId,
        entry_id: EntryId,
        reason: &str,
        actor: &str,
        allow_negative: bool,
    ) -> Result<Posted> {
        let original = self.get_entry(tenant, entry_id).await?;
        if original.kind == EntryKind::Reversal {
            return Err(Error::InvalidRequest(format!(
                "entry {} is a reversal and cannot be voided",
                entry_id
            )));
        }

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self
            .lock(tenant, slice::from_ref(&original.subject_id))
            .await?;

        let now = Utc::now();
        let event = format!("void:{}", entry_id);
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, tenant, &original.subject_id, now).await?;

        if let Some(reversal) = entries::find_by_source(
            &mut *tx,
            tenant,
            &original.subject_id,
            EntryKind::Reversal,
            &event,
        )
        .await?
        {
            tx.rollback().await?;
            return Ok(self.replayed(reversal));
        }

        let leg = Leg {
            subject: &original.subject_id,
            kind: EntryKind::Reversal,
            debit: original.credit,
            credit: original.debit,
            source_event_id: Some(event),
            reference: Reference::Void {
                entry_id,
                reason: reason.to_string(),
            },
            reverses_entry_id: Some(entry_id),
            void_reason: Some(reason.to_string()),
            floor: if allow_negative {
                Floor::Unchecked
            } else {
                Floor::Reservations { excluding: None }
            },
        };
        let reversal = self.apply_leg(&mut *tx, tenant, leg, actor, now).await?;

        if !entries::mark_voided(&mut *tx, tenant, entry_id, reason, now).await? {
            tx.rollback().await?;
            return Err(Error::InvalidRequest(format!(
                "entry {} is already voided",
                entry_id
            )));
        }

        tx.commit().await?;
        self.invalidate(tenant, &original.subject_id);
        self.metrics.record_entries_posted(1);

        tracing::info!(
            tenant = %tenant,
            subject = %original.subject_id,
            entry_id = %entry_id,
            reversal_id = %reversal.id,
            reason = %reason,
            "Entry voided"
        );

        Ok(Posted {
            entry: reversal,
            replayed: false,
        })
    }

    /// Write one entry and move the cached balance by its delta
    async fn apply_leg(
        &self,
        conn: &mut SqliteConnection,
        tenant: &TenantId,
        leg: Leg<'_>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        balances::ensure(conn, tenant, leg.subject, now).await?;
        let before = balances::cached_balance(conn, tenant, leg.subject).await?;
        let delta = leg
            .debit
            .checked_sub(leg.credit)
            .ok_or_else(|| out_of_range(leg.subject))?;

        if let Floor::Reservations { excluding } = leg.floor {
            if delta < Decimal::ZERO {
                let reserved =
                    reservations::active_total_excluding(conn, tenant, leg.subject, excluding)
                        .await?;
                let available = before
                    .checked_sub(reserved)
                    .ok_or_else(|| out_of_range(leg.subject))?;
                let remaining = available
                    .checked_add(delta)
                    .ok_or_else(|| out_of_range(leg.subject))?;
                if remaining < Decimal::ZERO {
                    self.metrics.record_insufficient_balance();
                    tracing::warn!(
                        tenant = %tenant,
                        subject = %leg.subject,
                        kind = %leg.kind,
                        requested = %(-delta),
                        available = %available,
                        "Insufficient balance"
                    );
                    return Err(Error::InsufficientBalance {
                        subject: leg.subject.clone(),
                        requested: -delta,
                        available: available.max(Decimal::ZERO),
                    });
                }
            }
        }

        let after = before
            .checked_add(delta)
            .ok_or_else(|| out_of_range(leg.subject))?;
        let voided = leg.kind == EntryKind::Reversal;

        let entry = entries::insert(
            conn,
            NewEntry {
                tenant_id: tenant.clone(),
                subject_id: leg.subject.clone(),
                kind: leg.kind,
                debit: leg.debit,
                credit: leg.credit,
                balance_before: before,
                balance_after: after,
                source_event_id: leg.source_event_id,
                reference: leg.reference,
                reverses_entry_id: leg.reverses_entry_id,
                voided,
                void_reason: leg.void_reason,
                created_at: now,
                created_by: actor.to_string(),
            },
        )
        .await?;

        balances::set(conn, tenant, leg.subject, after, now).await?;
        Ok(entry)
    }

    // =========================================================================
    // RESERVATIONS
    // =========================================================================

    /// Hold stock for a document.
    ///
    /// One reservation per (subject, document): asking again returns the
    /// existing one, whatever its status.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Reservation> {
        positive(req.quantity)?;
        if req.subject.item().is_none() {
            return Err(Error::InvalidRequest(format!(
                "reservations apply to stock subjects, not {}",
                req.subject
            )));
        }

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self.lock(&req.tenant, slice::from_ref(&req.subject)).await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, &req.tenant, &req.subject, now).await?;

        if let Some(existing) = reservations::find_by_document(
            &mut *tx,
            &req.tenant,
            &req.subject,
            &req.source_document_id,
        )
        .await?
        {
            tx.rollback().await?;
            self.metrics.record_replay();
            tracing::debug!(
                tenant = %req.tenant,
                reservation_id = %existing.id,
                "Reservation already exists for document"
            );
            return Ok(existing);
        }

        let balance = balances::cached_balance(&mut *tx, &req.tenant, &req.subject).await?;
        let reserved = reservations::active_total(&mut *tx, &req.tenant, &req.subject).await?;
        let available = balance
            .checked_sub(reserved)
            .ok_or_else(|| out_of_range(&req.subject))?;
        if req.quantity > available {
            tx.rollback().await?;
            self.metrics.record_insufficient_balance();
            tracing::warn!(
                tenant = %req.tenant,
                subject = %req.subject,
                requested = %req.quantity,
                available = %available,
                "Reservation exceeds available quantity"
            );
            return Err(Error::InsufficientBalance {
                subject: req.subject,
                requested: req.quantity,
                available: available.max(Decimal::ZERO),
            });
        }

        let reservation = Reservation {
            id: Uuid::now_v7(),
            tenant_id: req.tenant.clone(),
            subject_id: req.subject.clone(),
            reserved_quantity: req.quantity,
            source_document_id: req.source_document_id,
            status: ReservationStatus::Active,
            created_at: now,
            resolved_at: None,
            fulfilled_quantity: None,
            consumption_entry_id: None,
            release_reason: None,
        };
        reservations::insert(&mut *tx, &reservation).await?;

        tx.commit().await?;
        self.invalidate(&req.tenant, &req.subject);
        self.metrics.record_reservation("created");

        tracing::info!(
            tenant = %req.tenant,
            subject = %req.subject,
            reservation_id = %reservation.id,
            quantity = %req.quantity,
            "Reservation created"
        );

        Ok(reservation)
    }

    /// Consume a reservation: post a CONSUMPTION for `actual` and mark it CONSUMED.
    ///
    /// `actual` may differ from the reserved quantity; the unused remainder
    /// is released with the hold. Fulfilling a consumed reservation again
    /// replays its consumption entry.
    pub async fn fulfill_reservation(
        &self,
        tenant: &TenantId,
        reservation_id: Uuid,
        actual: Decimal,
    ) -> Result<Posted> {
        positive(actual)?;
        let reservation = self.get_reservation(tenant, reservation_id).await?;

        let _timer = self.metrics.post_duration.start_timer();
        let _guard = self
            .lock(tenant, slice::from_ref(&reservation.subject_id))
            .await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, tenant, &reservation.subject_id, now).await?;

        let reservation = reservations::get(&mut *tx, tenant, reservation_id)
            .await?
            .ok_or(Error::ReservationNotFound(reservation_id))?;

        match reservation.status {
            ReservationStatus::Active => {}
            ReservationStatus::Consumed => {
                let entry_id = reservation.consumption_entry_id.ok_or_else(|| {
                    Error::Corrupt(format!(
                        "reservation {} consumed without an entry",
                        reservation_id
                    ))
                })?;
                let entry = entries::get(&mut *tx, tenant, entry_id)
                    .await?
                    .ok_or(Error::EntryNotFound(entry_id))?;
                tx.rollback().await?;
                return Ok(self.replayed(entry));
            }
            status @ ReservationStatus::Released => {
                return Err(Error::InvalidTransition {
                    reservation_id,
                    status,
                    action: "fulfill",
                });
            }
        }

        let leg = Leg {
            subject: &reservation.subject_id,
            kind: EntryKind::Consumption,
            debit: Decimal::ZERO,
            credit: actual,
            source_event_id: Some(format!("reservation:{}", reservation_id)),
            reference: Reference::Reservation {
                reservation_id,
                source_document_id: reservation.source_document_id.clone(),
            },
            reverses_entry_id: None,
            void_reason: None,
            floor: Floor::Reservations {
                excluding: Some(reservation_id),
            },
        };
        let entry = self.apply_leg(&mut *tx, tenant, leg, "system", now).await?;

        if !reservations::mark_consumed(&mut *tx, tenant, reservation_id, actual, entry.id, now)
            .await?
        {
            return Err(Error::Corrupt(format!(
                "reservation {} left ACTIVE while locked",
                reservation_id
            )));
        }

        tx.commit().await?;
        self.invalidate(tenant, &reservation.subject_id);
        self.metrics.record_entries_posted(1);
        self.metrics.record_reservation("consumed");

        tracing::info!(
            tenant = %tenant,
            subject = %reservation.subject_id,
            reservation_id = %reservation_id,
            reserved = %reservation.reserved_quantity,
            fulfilled = %actual,
            entry_id = %entry.id,
            "Reservation fulfilled"
        );

        Ok(Posted {
            entry,
            replayed: false,
        })
    }

    /// Release a reservation without touching the ledger. Idempotent.
    pub async fn release_reservation(
        &self,
        tenant: &TenantId,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<Reservation> {
        let reservation = self.get_reservation(tenant, reservation_id).await?;
        let _guard = self
            .lock(tenant, slice::from_ref(&reservation.subject_id))
            .await?;

        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        balances::ensure(&mut *tx, tenant, &reservation.subject_id, now).await?;

        let reservation = reservations::get(&mut *tx, tenant, reservation_id)
            .await?
            .ok_or(Error::ReservationNotFound(reservation_id))?;

        match reservation.status {
            ReservationStatus::Active => {}
            ReservationStatus::Released => {
                tx.rollback().await?;
                tracing::debug!(reservation_id = %reservation_id, "Reservation already released");
                return Ok(reservation);
            }
            status @ ReservationStatus::Consumed => {
                return Err(Error::InvalidTransition {
                    reservation_id,
                    status,
                    action: "release",
                });
            }
        }

        reservations::mark_released(&mut *tx, tenant, reservation_id, reason, now).await?;
        let released = reservations::get(&mut *tx, tenant, reservation_id)
            .await?
            .ok_or(Error::ReservationNotFound(reservation_id))?;

        tx.commit().await?;
        self.invalidate(tenant, &released.subject_id);
        self.metrics.record_reservation("released");

        tracing::info!(
            tenant = %tenant,
            subject = %released.subject_id,
            reservation_id = %reservation_id,
            reason = %reason,
            "Reservation released"
        );

        Ok(released)
    }

    /// ACTIVE reservations created more than `older_than` ago
    pub async fn list_stale_reservations(
        &self,
        tenant: &TenantId,
        subject: Option<&SubjectId>,
        older_than: chrono::Duration,
    ) -> Result<Vec<Reservation>> {
        let cutoff = Utc::now() - older_than;
        let mut conn = self.storage.pool().acquire().await?;
        reservations::list_stale(&mut *conn, tenant, subject, cutoff).await
    }

    /// Release every stale reservation of a tenant.
    ///
    /// Reservations resolved concurrently, or whose subject stays locked
    /// past the lock timeout, are skipped and left for the next sweep.
    pub async fn release_stale_reservations(
        &self,
        tenant: &TenantId,
        older_than: chrono::Duration,
        reason: &str,
    ) -> Result<Vec<Reservation>> {
        self.purge_expired_cache();
        let stale = self.list_stale_reservations(tenant, None, older_than).await?;
        let mut released = Vec::with_capacity(stale.len());

        for reservation in stale {
            match self.release_reservation(tenant, reservation.id, reason).await {
                Ok(r) if r.status == ReservationStatus::Released => released.push(r),
                Ok(_) => {}
                Err(e @ Error::InvalidTransition { .. })
                | Err(e @ Error::SubjectLockTimeout { .. }) => {
                    tracing::warn!(
                        tenant = %tenant,
                        reservation_id = %reservation.id,
                        error = %e,
                        "Skipping stale reservation"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(tenant = %tenant, released = released.len(), "Stale reservations swept");
        Ok(released)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Cached balance of a subject (zero if never posted)
    pub async fn get_balance(&self, tenant: &TenantId, subject: &SubjectId) -> Result<Decimal> {
        Ok(self.load(tenant, subject).await?.balance)
    }

    /// Balance minus ACTIVE reservations
    pub async fn get_available(&self, tenant: &TenantId, subject: &SubjectId) -> Result<Decimal> {
        Ok(self.load(tenant, subject).await?.available())
    }

    async fn load(&self, tenant: &TenantId, subject: &SubjectId) -> Result<CachedBalance> {
        if let Some(cached) = self.cache.get(tenant, subject) {
            return Ok(cached);
        }

        // Loaded under the subject lock so a concurrent write cannot slip
        // between the read and the cache fill.
        let _guard = self.lock(tenant, slice::from_ref(subject)).await?;
        let mut conn = self.storage.pool().acquire().await?;
        let value = CachedBalance {
            balance: balances::cached_balance(&mut *conn, tenant, subject).await?,
            reserved: reservations::active_total(&mut *conn, tenant, subject).await?,
        };
        self.cache.insert(tenant, subject, value);
        Ok(value)
    }

    /// Get entry by ID
    pub async fn get_entry(&self, tenant: &TenantId, id: EntryId) -> Result<LedgerEntry> {
        let mut conn = self.storage.pool().acquire().await?;
        entries::get(&mut *conn, tenant, id)
            .await?
            .ok_or(Error::EntryNotFound(id))
    }

    /// Get reservation by ID
    pub async fn get_reservation(&self, tenant: &TenantId, id: Uuid) -> Result<Reservation> {
        let mut conn = self.storage.pool().acquire().await?;
        reservations::get(&mut *conn, tenant, id)
            .await?
            .ok_or(Error::ReservationNotFound(id))
    }

    /// Audit trail of a subject, oldest first, voided entries included
    pub async fn entries_for_subject(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
    ) -> Result<Vec<LedgerEntry>> {
        let mut conn = self.storage.pool().acquire().await?;
        entries::list_for_subject(&mut *conn, tenant, subject).await
    }
}

/// Split a posted amount into (debit, credit) for its kind
fn sides(kind: EntryKind, amount: Decimal) -> Result<(Decimal, Decimal)> {
    if amount.is_zero() {
        return Err(Error::InvalidAmount("amount must be non-zero".to_string()));
    }
    match kind.side() {
        Side::Debit => positive(amount).map(|_| (amount, Decimal::ZERO)),
        Side::Credit => positive(amount).map(|_| (Decimal::ZERO, amount)),
        Side::Signed if kind == EntryKind::Reversal => Err(Error::InvalidRequest(
            "reversals are written by void_entry".to_string(),
        )),
        Side::Signed if amount > Decimal::ZERO => Ok((amount, Decimal::ZERO)),
        Side::Signed => Ok((Decimal::ZERO, -amount)),
    }
}

fn positive(quantity: Decimal) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

fn return_event_id(return_id: &str, line_id: &str) -> String {
    format!("return-{}-line-{}", return_id, line_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::test_config;
    use crate::types::ReturnLine;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    async fn create_test_ledger() -> (Ledger, TempDir) {
        let (config, temp_dir) = test_config();
        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn item42() -> SubjectId {
        SubjectId::stock("WH1", "ITEM42")
    }

    async fn receive(ledger: &Ledger, subject: &SubjectId, qty: Decimal, receipt: &str) -> Posted {
        ledger
            .post(
                PostRequest::new(
                    tenant(),
                    subject.clone(),
                    EntryKind::Receipt,
                    qty,
                    Reference::PurchaseReceipt {
                        receipt_id: receipt.to_string(),
                    },
                )
                .with_source_event(format!("{}-{}", receipt, subject)),
            )
            .await
            .unwrap()
    }

    fn consume(subject: &SubjectId, qty: Decimal) -> PostRequest {
        PostRequest::new(
            tenant(),
            subject.clone(),
            EntryKind::Consumption,
            qty,
            Reference::SalesShipment {
                order_id: "SO-1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_post_updates_balance_and_snapshots() {
        let (ledger, _temp) = create_test_ledger().await;

        let first = receive(&ledger, &item42(), dec!(100), "RCV-1").await;
        assert!(!first.replayed);
        assert_eq!(first.entry.balance_before, dec!(0));
        assert_eq!(first.entry.balance_after, dec!(100));

        let second = ledger.post(consume(&item42(), dec!(40))).await.unwrap();
        assert_eq!(second.entry.credit, dec!(40));
        assert_eq!(second.entry.balance_after, dec!(60));
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(60));
    }

    #[tokio::test]
    async fn test_post_replays_same_source_event() {
        let (ledger, _temp) = create_test_ledger().await;

        let first = receive(&ledger, &item42(), dec!(10), "RCV-1").await;
        let again = receive(&ledger, &item42(), dec!(10), "RCV-1").await;

        assert!(again.replayed);
        assert_eq!(again.entry.id, first.entry.id);
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(10));
        assert_eq!(ledger.metrics().replays.get(), 1);
        assert_eq!(
            ledger
                .entries_for_subject(&tenant(), &item42())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejects_zero_and_mismatched_reference() {
        let (ledger, _temp) = create_test_ledger().await;

        let zero = ledger.post(consume(&item42(), dec!(0))).await.unwrap_err();
        assert!(matches!(zero, Error::InvalidAmount(_)));

        let negative = ledger.post(consume(&item42(), dec!(-1))).await.unwrap_err();
        assert!(matches!(negative, Error::InvalidAmount(_)));

        let mismatched = ledger
            .post(PostRequest::new(
                tenant(),
                SubjectId::account("CUST7"),
                EntryKind::Payment,
                dec!(5),
                Reference::SalesShipment {
                    order_id: "SO-1".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(mismatched, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_depletion_checks_available_quantity() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(10), "RCV-1").await;

        let err = ledger.post(consume(&item42(), dec!(11))).await.unwrap_err();
        match err {
            Error::InsufficientBalance {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, dec!(11));
                assert_eq!(available, dec!(10));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(10));

        let forced = ledger
            .post(consume(&item42(), dec!(11)).allowing_negative())
            .await
            .unwrap();
        assert_eq!(forced.entry.balance_after, dec!(-1));
        assert_eq!(ledger.metrics().insufficient_balance.get(), 1);
    }

    #[tokio::test]
    async fn test_adjustment_is_signed_and_unchecked() {
        let (ledger, _temp) = create_test_ledger().await;
        let adjust = |amount| {
            PostRequest::new(
                tenant(),
                item42(),
                EntryKind::Adjustment,
                amount,
                Reference::Manual {
                    note: "cycle count".to_string(),
                },
            )
        };

        let up = ledger.post(adjust(dec!(5))).await.unwrap();
        assert_eq!((up.entry.debit, up.entry.credit), (dec!(5), dec!(0)));

        let down = ledger.post(adjust(dec!(-7))).await.unwrap();
        assert_eq!((down.entry.debit, down.entry.credit), (dec!(0), dec!(7)));
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(-2));
    }

    #[tokio::test]
    async fn test_account_invoice_and_payment() {
        let (ledger, _temp) = create_test_ledger().await;
        let account = SubjectId::account("CUST7");

        ledger
            .post(PostRequest::new(
                tenant(),
                account.clone(),
                EntryKind::Invoice,
                dec!(250.00),
                Reference::CustomerInvoice {
                    invoice_id: "INV-1".to_string(),
                },
            ))
            .await
            .unwrap();
        ledger
            .post(PostRequest::new(
                tenant(),
                account.clone(),
                EntryKind::Payment,
                dec!(100.50),
                Reference::CustomerPayment {
                    payment_id: "PAY-1".to_string(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(ledger.get_balance(&tenant(), &account).await.unwrap(), dec!(149.50));
    }

    #[tokio::test]
    async fn test_kind_must_match_subject() {
        let (ledger, _temp) = create_test_ledger().await;

        let invoice_on_stock = ledger
            .post(PostRequest::new(
                tenant(),
                item42(),
                EntryKind::Invoice,
                dec!(10),
                Reference::CustomerInvoice {
                    invoice_id: "INV-1".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(invoice_on_stock, Error::InvalidRequest(_)));

        let receipt_on_account = ledger
            .post(PostRequest::new(
                tenant(),
                SubjectId::account("CUST7"),
                EntryKind::Receipt,
                dec!(10),
                Reference::PurchaseReceipt {
                    receipt_id: "RCV-1".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(receipt_on_account, Error::InvalidRequest(_)));
        assert!(ledger
            .entries_for_subject(&tenant(), &SubjectId::account("CUST7"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_subjects_rejected_before_write() {
        let (ledger, _temp) = create_test_ledger().await;

        let empty_account = ledger
            .post(PostRequest::new(
                tenant(),
                SubjectId::account(""),
                EntryKind::Invoice,
                dec!(10),
                Reference::CustomerInvoice {
                    invoice_id: "INV-1".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(empty_account, Error::InvalidRequest(_)));
        assert!(empty_account.is_client_error());

        let zone = SubjectId::stock("ZONE/A", "ITEM");
        let slash = ledger
            .post(PostRequest::new(
                tenant(),
                zone.clone(),
                EntryKind::Receipt,
                dec!(10),
                Reference::PurchaseReceipt {
                    receipt_id: "R1".to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(slash, Error::InvalidRequest(_)));

        let reserve = ledger
            .reserve(ReserveRequest {
                tenant: tenant(),
                subject: zone.clone(),
                quantity: dec!(1),
                source_document_id: "SO-1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(reserve, Error::InvalidRequest(_)));

        let stats = ledger.storage().get_stats(&tenant()).await.unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_subjects, 0);
    }

    #[tokio::test]
    async fn test_balance_overflow_is_rejected() {
        let (ledger, _temp) = create_test_ledger().await;
        let huge = Decimal::MAX - Decimal::ONE;
        let receipt = |event: &str| {
            PostRequest::new(
                tenant(),
                item42(),
                EntryKind::Receipt,
                huge,
                Reference::PurchaseReceipt {
                    receipt_id: event.to_string(),
                },
            )
            .with_source_event(event)
        };

        ledger.post(receipt("rcv-1")).await.unwrap();
        let err = ledger.post(receipt("rcv-2")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
        assert!(err.is_client_error());

        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), huge);
        assert_eq!(
            ledger.compute_true_balance(&tenant(), &item42()).await.unwrap(),
            (huge, 1)
        );
    }

    #[tokio::test]
    async fn test_transfer_moves_stock_atomically() {
        let (ledger, _temp) = create_test_ledger().await;
        let wh2 = SubjectId::stock("WH2", "ITEM42");
        receive(&ledger, &item42(), dec!(10), "RCV-1").await;

        let transfer = |qty| TransferRequest {
            tenant: tenant(),
            from: item42(),
            to: wh2.clone(),
            quantity: qty,
            transfer_id: "TR-1".to_string(),
            actor: "clerk".to_string(),
        };

        let err = ledger.transfer(transfer(dec!(15))).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(ledger
            .entries_for_subject(&tenant(), &wh2)
            .await
            .unwrap()
            .is_empty());

        let done = ledger.transfer(transfer(dec!(4))).await.unwrap();
        assert_eq!(done.outbound.kind, EntryKind::TransferOut);
        assert_eq!(done.inbound.kind, EntryKind::TransferIn);
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(6));
        assert_eq!(ledger.get_balance(&tenant(), &wh2).await.unwrap(), dec!(4));

        let again = ledger.transfer(transfer(dec!(4))).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.outbound.id, done.outbound.id);
        assert_eq!(ledger.get_balance(&tenant(), &wh2).await.unwrap(), dec!(4));
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(100), "RCV-1").await;

        let reserve = |doc: &str, qty| ReserveRequest {
            tenant: tenant(),
            subject: item42(),
            quantity: qty,
            source_document_id: doc.to_string(),
        };

        let held = ledger.reserve(reserve("SO-1", dec!(30))).await.unwrap();
        assert_eq!(held.status, ReservationStatus::Active);
        assert_eq!(ledger.get_available(&tenant(), &item42()).await.unwrap(), dec!(70));

        let same = ledger.reserve(reserve("SO-1", dec!(30))).await.unwrap();
        assert_eq!(same.id, held.id);

        let too_much = ledger.reserve(reserve("SO-2", dec!(71))).await.unwrap_err();
        assert!(matches!(too_much, Error::InsufficientBalance { .. }));

        let other = ledger.reserve(reserve("SO-3", dec!(20))).await.unwrap();
        let released = ledger
            .release_reservation(&tenant(), other.id, "order cancelled")
            .await
            .unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        let twice = ledger
            .release_reservation(&tenant(), other.id, "again")
            .await
            .unwrap();
        assert_eq!(twice.release_reason.as_deref(), Some("order cancelled"));

        let fulfilled = ledger
            .fulfill_reservation(&tenant(), held.id, dec!(25))
            .await
            .unwrap();
        assert_eq!(fulfilled.entry.credit, dec!(25));
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(75));
        assert_eq!(ledger.get_available(&tenant(), &item42()).await.unwrap(), dec!(75));

        let consumed = ledger.get_reservation(&tenant(), held.id).await.unwrap();
        assert_eq!(consumed.status, ReservationStatus::Consumed);
        assert_eq!(consumed.fulfilled_quantity, Some(dec!(25)));
        assert_eq!(consumed.consumption_entry_id, Some(fulfilled.entry.id));

        let replay = ledger
            .fulfill_reservation(&tenant(), held.id, dec!(25))
            .await
            .unwrap();
        assert!(replay.replayed);

        let err = ledger
            .release_reservation(&tenant(), held.id, "late")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let err = ledger
            .fulfill_reservation(&tenant(), other.id, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_fulfilment_may_exceed_reserved_quantity() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(50), "RCV-1").await;

        let a = ledger
            .reserve(ReserveRequest {
                tenant: tenant(),
                subject: item42(),
                quantity: dec!(10),
                source_document_id: "SO-A".to_string(),
            })
            .await
            .unwrap();
        ledger
            .reserve(ReserveRequest {
                tenant: tenant(),
                subject: item42(),
                quantity: dec!(30),
                source_document_id: "SO-B".to_string(),
            })
            .await
            .unwrap();

        // 50 on hand, 30 held by SO-B: A can take at most 20
        let err = ledger
            .fulfill_reservation(&tenant(), a.id, dec!(21))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));

        ledger
            .fulfill_reservation(&tenant(), a.id, dec!(20))
            .await
            .unwrap();
        assert_eq!(ledger.get_available(&tenant(), &item42()).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_void_appends_reversal_pair() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(100), "RCV-1").await;
        let consumed = ledger.post(consume(&item42(), dec!(30))).await.unwrap();

        let reversal = ledger
            .void_entry(&tenant(), consumed.entry.id, "wrong item", "supervisor", false)
            .await
            .unwrap();
        assert_eq!(reversal.entry.kind, EntryKind::Reversal);
        assert_eq!(reversal.entry.debit, dec!(30));
        assert_eq!(reversal.entry.reverses_entry_id, Some(consumed.entry.id));
        assert!(reversal.entry.voided);
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(100));

        let original = ledger.get_entry(&tenant(), consumed.entry.id).await.unwrap();
        assert!(original.voided);
        assert_eq!(original.void_reason.as_deref(), Some("wrong item"));

        let again = ledger
            .void_entry(&tenant(), consumed.entry.id, "twice", "supervisor", false)
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.entry.id, reversal.entry.id);
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(100));

        let err = ledger
            .void_entry(&tenant(), reversal.entry.id, "nope", "supervisor", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let trail = ledger.entries_for_subject(&tenant(), &item42()).await.unwrap();
        let full: Decimal = trail.iter().map(|e| e.delta()).sum();
        assert_eq!(full, dec!(100));
    }

    #[tokio::test]
    async fn test_void_receipt_respects_reservations() {
        let (ledger, _temp) = create_test_ledger().await;
        let receipt = receive(&ledger, &item42(), dec!(10), "RCV-1").await;
        ledger
            .reserve(ReserveRequest {
                tenant: tenant(),
                subject: item42(),
                quantity: dec!(5),
                source_document_id: "SO-1".to_string(),
            })
            .await
            .unwrap();

        let err = ledger
            .void_entry(&tenant(), receipt.entry.id, "duplicate", "clerk", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(!ledger.get_entry(&tenant(), receipt.entry.id).await.unwrap().voided);

        ledger
            .void_entry(&tenant(), receipt.entry.id, "duplicate", "clerk", true)
            .await
            .unwrap();
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_void_unknown_entry() {
        let (ledger, _temp) = create_test_ledger().await;
        let err = ledger
            .void_entry(&tenant(), EntryId(999), "x", "clerk", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntryNotFound(EntryId(999))));
    }

    #[tokio::test]
    async fn test_return_shipment_collects_every_violation() {
        let (ledger, _temp) = create_test_ledger().await;
        let wh2 = SubjectId::stock("WH2", "ITEM42");
        receive(&ledger, &item42(), dec!(10), "RCV-9").await;
        receive(&ledger, &wh2, dec!(50), "RCV-OTHER").await;

        let line = |id: &str, subject: &SubjectId, qty, receipt: Option<&str>| ReturnLine {
            line_id: id.to_string(),
            subject: subject.clone(),
            quantity: qty,
            original_receipt_id: receipt.map(str::to_string),
        };

        let err = ledger
            .post_return_shipment(ReturnShipment {
                tenant: tenant(),
                return_id: "RET-123".to_string(),
                lines: vec![
                    line("1", &item42(), dec!(6), Some("RCV-9")),
                    line("2", &item42(), dec!(6), Some("RCV-9")),
                    line("3", &wh2, dec!(1), Some("RCV-9")),
                    line("4", &item42(), dec!(1), Some("RCV-NONE")),
                ],
                actor: "buyer".to_string(),
            })
            .await
            .unwrap_err();

        match err {
            Error::ValidationFailed(violations) => {
                let lines: Vec<&str> = violations.iter().map(|v| v.line_id.as_str()).collect();
                assert!(lines.contains(&"2"));
                assert!(lines.contains(&"3"));
                assert!(lines.contains(&"4"));
                assert!(!lines.contains(&"1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(10));

        let posted = ledger
            .post_return_shipment(ReturnShipment {
                tenant: tenant(),
                return_id: "RET-123".to_string(),
                lines: vec![
                    line("1", &item42(), dec!(6), Some("RCV-9")),
                    line("2", &item42(), dec!(4), Some("RCV-9")),
                ],
                actor: "buyer".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(
            posted[0].entry.reference.origin_document_id(),
            Some("RCV-9")
        );
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(0));

        // Same return again replays; a new return against the exhausted receipt fails
        let replay = ledger
            .post_return_shipment(ReturnShipment {
                tenant: tenant(),
                return_id: "RET-123".to_string(),
                lines: vec![line("1", &item42(), dec!(6), Some("RCV-9"))],
                actor: "buyer".to_string(),
            })
            .await
            .unwrap();
        assert!(replay[0].replayed);

        receive(&ledger, &item42(), dec!(5), "RCV-10").await;
        let err = ledger
            .post_return_shipment(ReturnShipment {
                tenant: tenant(),
                return_id: "RET-124".to_string(),
                lines: vec![line("1", &item42(), dec!(1), Some("RCV-9"))],
                actor: "buyer".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_stale_reservation_sweep() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(10), "RCV-1").await;
        let held = ledger
            .reserve(ReserveRequest {
                tenant: tenant(),
                subject: item42(),
                quantity: dec!(4),
                source_document_id: "SO-1".to_string(),
            })
            .await
            .unwrap();

        let none = ledger
            .list_stale_reservations(&tenant(), Some(&item42()), chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());

        let stale = ledger
            .list_stale_reservations(&tenant(), Some(&item42()), chrono::Duration::zero())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        let released = ledger
            .release_stale_reservations(&tenant(), chrono::Duration::zero(), "expired")
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, held.id);
        assert_eq!(ledger.get_available(&tenant(), &item42()).await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn test_lock_timeout_is_reported() {
        let (mut config, _temp) = test_config();
        config.locking.lock_timeout_ms = 50;
        let ledger = Ledger::open(config).await.unwrap();

        let _held = ledger
            .locks
            .acquire(&tenant(), &item42(), Duration::from_secs(1))
            .await
            .unwrap();

        let err = ledger
            .post(consume(&item42(), dec!(1)).allowing_negative())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubjectLockTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(ledger.metrics().lock_timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_read_cache_hits_and_invalidates() {
        let (ledger, _temp) = create_test_ledger().await;
        receive(&ledger, &item42(), dec!(3), "RCV-1").await;

        ledger.get_balance(&tenant(), &item42()).await.unwrap();
        ledger.get_balance(&tenant(), &item42()).await.unwrap();
        assert_eq!(ledger.cache_stats().hits(), 1);

        ledger.post(consume(&item42(), dec!(1))).await.unwrap();
        assert_eq!(ledger.get_balance(&tenant(), &item42()).await.unwrap(), dec!(2));
    }

    #[tokio::test]
    async fn test_many_subjects_leave_bounded_state() {
        let (mut config, _temp) = test_config();
        config.cache.max_entries = 4;
        let ledger = Ledger::open(config).await.unwrap();

        for i in 0..20 {
            let subject = SubjectId::stock("WH1", format!("ITEM{}", i));
            receive(&ledger, &subject, Decimal::from(i + 1), "RCV-1").await;
            assert_eq!(
                ledger.get_balance(&tenant(), &subject).await.unwrap(),
                Decimal::from(i + 1)
            );
        }

        assert!(ledger.cache.len() <= 4);
        assert!(ledger.cache_stats().rejected() > 0);
        assert!(ledger.locks.is_empty());
    }

    #[tokio::test]
    async fn test_expired_cache_sees_other_instance_writes() {
        let (mut config, _temp) = test_config();
        config.cache.ttl_secs = 0;
        let writer = Ledger::open(config.clone()).await.unwrap();
        let reader = Ledger::open(config).await.unwrap();

        receive(&writer, &item42(), dec!(5), "RCV-1").await;
        assert_eq!(reader.get_balance(&tenant(), &item42()).await.unwrap(), dec!(5));

        receive(&writer, &item42(), dec!(7), "RCV-2").await;
        assert_eq!(reader.get_balance(&tenant(), &item42()).await.unwrap(), dec!(12));
        assert_eq!(reader.purge_expired_cache(), 1);
    }

    #[test]
    fn test_sides() {
        assert_eq!(
            sides(EntryKind::Receipt, dec!(3)).unwrap(),
            (dec!(3), dec!(0))
        );
        assert_eq!(
            sides(EntryKind::Payment, dec!(3)).unwrap(),
            (dec!(0), dec!(3))
        );
        assert_eq!(
            sides(EntryKind::Adjustment, dec!(-3)).unwrap(),
            (dec!(0), dec!(3))
        );
        assert!(sides(EntryKind::Reversal, dec!(3)).is_err());
        assert!(sides(EntryKind::Adjustment, dec!(0)).is_err());
    }
}
