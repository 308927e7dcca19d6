mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::{BLOCK_MINUTES, aggregate_blocks, slot_block_start};
pub use conflict::overlaps;
pub use error::{BookingError, ConflictInfo, ErrorKind};
pub use ledger::{
    add_hours, has_quota, is_exhausted, is_valid_for, minutes_to_hours, remaining_hours,
    remaining_minutes,
};
pub use mutations::ExtendOutcome;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::time::Clock;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedMembership = Arc<RwLock<Membership>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop the writer; later appends fail.
    #[cfg(test)]
    Shutdown,
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                if handle_non_append(&mut wal, other) {
                    continue;
                }
                break;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred
            && !handle_non_append(&mut wal, cmd)
        {
            break;
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    if result.is_ok() {
        result = wal.flush_sync();
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
        // Every event in the batch is reported failed, so none may survive
        // on disk either.
        if let Err(e) = wal.rollback() {
            error!("WAL rollback failed: {e}");
        }
    }

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns `false` once the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::Shutdown => return false,
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
    true
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    pub(super) users: DashMap<Ulid, UserProfile>,
    pub(super) memberships: DashMap<Ulid, SharedMembership>,
    /// Reverse lookup: booking id → slot id, for bookings still attached to a slot.
    pub(super) booking_to_slot: DashMap<Ulid, Ulid>,
    /// Bookings whose slot was deleted.
    pub(super) detached: DashMap<Ulid, Booking>,
    /// Keyed by the booking holder (`None` for guests) and the client key.
    pub(super) idempotency: DashMap<(Option<Ulid>, String), Ulid>,
    pub(super) audit: DashMap<Ulid, Vec<AuditEntry>>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes can't miss an in-flight append.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            users: DashMap::new(),
            memberships: DashMap::new(),
            booking_to_slot: DashMap::new(),
            detached: DashMap::new(),
            idempotency: DashMap::new(),
            audit: DashMap::new(),
            compaction_gate: RwLock::new(()),
            wal_tx,
            notify,
            clock,
            config,
        };

        // Nothing else can see these Arcs yet, so try_write always succeeds.
        // blocking_write would panic inside a runtime.
        for event in &events {
            let slot = event_slot_id(event).and_then(|id| engine.slot_state(&id));
            let member = event_member_id(event).and_then(|id| engine.membership_state(&id));
            let mut slot_guard = slot
                .as_ref()
                .map(|s| s.try_write().expect("replay: uncontended write"));
            let mut member_guard = member
                .as_ref()
                .map(|m| m.try_write().expect("replay: uncontended write"));
            engine.apply(slot_guard.as_deref_mut(), member_guard.as_deref_mut(), event);
        }

        Ok(engine)
    }

    #[cfg(test)]
    pub(super) async fn stop_wal_writer(&self) {
        let _ = self.wal_tx.send(WalCommand::Shutdown).await;
        self.wal_tx.closed().await;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn membership_state(&self, user_id: &Ulid) -> Option<SharedMembership> {
        self.memberships.get(user_id).map(|e| e.value().clone())
    }

    /// Slots in listing order (ascending id, i.e. creation order).
    pub(super) fn slots_in_order(&self) -> Vec<SharedSlotState> {
        let mut ids: Vec<(Ulid, SharedSlotState)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ids.sort_by_key(|(id, _)| *id);
        ids.into_iter().map(|(_, s)| s).collect()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::WalError(e.to_string()))
    }

    /// WAL-append, apply, notify. Callers hold the locks for every piece of
    /// state the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        slot: Option<&mut SlotState>,
        member: Option<&mut Membership>,
        event: &Event,
    ) -> Result<(), BookingError> {
        self.wal_append(event).await?;
        self.apply(slot, member, event);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup booking → slot, acquire the slot's write lock, and confirm the
    /// booking is still there once the lock is held.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, BookingError> {
        let slot_id = self
            .booking_to_slot
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(*booking_id))?;
        let ss = self
            .slot_state(&slot_id)
            .ok_or(BookingError::NotFound(slot_id))?;
        let guard = ss.write_owned().await;
        if guard.booking(*booking_id).is_none() {
            return Err(BookingError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// Apply an event to in-memory state. No locking: the caller holds the
    /// slot and membership guards it passes in.
    fn apply(&self, slot: Option<&mut SlotState>, member: Option<&mut Membership>, event: &Event) {
        match event {
            Event::SlotCreated { slot } => {
                self.slots
                    .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot.clone()))));
            }
            Event::SlotUpdated { slot: updated } => {
                if let Some(ss) = slot {
                    ss.slot = updated.clone();
                }
            }
            Event::SlotDeleted { id, .. } => {
                if let Some(ss) = slot {
                    for mut booking in ss.bookings.drain(..) {
                        self.booking_to_slot.remove(&booking.id);
                        booking.slot_id = None;
                        self.detached.insert(booking.id, booking);
                    }
                }
                self.slots.remove(id);
            }
            Event::UserRegistered { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::MembershipSet { user_id, membership } => match member {
                Some(m) => *m = membership.clone(),
                None => {
                    self.memberships
                        .insert(*user_id, Arc::new(RwLock::new(membership.clone())));
                }
            },
            Event::HoursDeducted { deduction } => {
                if let Some(m) = member {
                    m.utilized_hours = add_hours(m.utilized_hours, deduction.hours);
                }
            }
            Event::BookingCreated { booking, deduction } => {
                if let Some(key) = &booking.idempotency_key {
                    self.idempotency
                        .insert((booking.user_id, key.clone()), booking.id);
                }
                match (slot, booking.slot_id) {
                    (Some(ss), Some(slot_id)) => {
                        self.booking_to_slot.insert(booking.id, slot_id);
                        ss.insert_booking(booking.clone());
                    }
                    _ => {
                        let mut detached = booking.clone();
                        detached.slot_id = None;
                        self.detached.insert(booking.id, detached);
                    }
                }
                if let (Some(m), Some(d)) = (member, deduction) {
                    m.utilized_hours = add_hours(m.utilized_hours, d.hours);
                }
            }
            Event::BookingExtended {
                id,
                duration,
                reason,
                admin_id,
                payment_method,
                deduction,
                audit,
                ..
            } => {
                if let Some(b) = slot.and_then(|ss| ss.booking_mut(*id)) {
                    b.duration = *duration;
                    b.is_admin_extended = true;
                    b.extension_reason = reason.clone();
                    b.extension_admin_id = Some(*admin_id);
                    b.extension_payment_method = Some(*payment_method);
                }
                if let (Some(m), Some(d)) = (member, deduction) {
                    m.utilized_hours = add_hours(m.utilized_hours, d.hours);
                }
                self.audit.entry(*id).or_default().push(audit.clone());
            }
            Event::BookingStatusChanged {
                id,
                status,
                total_price,
                payment_method,
                ..
            } => {
                let update = |b: &mut Booking| {
                    b.status = *status;
                    if total_price.is_some() {
                        b.total_price = *total_price;
                    }
                    if payment_method.is_some() {
                        b.payment_method = *payment_method;
                    }
                };
                match slot.and_then(|ss| ss.booking_mut(*id)) {
                    Some(b) => update(b),
                    None => {
                        if let Some(mut b) = self.detached.get_mut(id) {
                            update(b.value_mut());
                        }
                    }
                }
            }
            Event::BookingDeleted { id, .. } => {
                let removed = match slot {
                    Some(ss) => ss.remove_booking(*id),
                    None => self.detached.remove(id).map(|(_, b)| b),
                };
                self.booking_to_slot.remove(id);
                if let Some(b) = removed
                    && let Some(key) = b.idempotency_key
                {
                    self.idempotency.remove(&(b.user_id, key));
                }
            }
            Event::AuditRecorded { entry } => {
                self.audit.entry(entry.booking_id).or_default().push(entry.clone());
            }
        }
    }
}

/// Slot whose lock an event needs (Create is handled at the map level).
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotUpdated { slot } => Some(slot.id),
        Event::SlotDeleted { id, .. } => Some(*id),
        Event::BookingCreated { booking, .. } => booking.slot_id,
        Event::BookingExtended { slot_id, .. } => Some(*slot_id),
        Event::BookingStatusChanged { slot_id, .. } | Event::BookingDeleted { slot_id, .. } => {
            *slot_id
        }
        Event::SlotCreated { .. }
        | Event::UserRegistered { .. }
        | Event::MembershipSet { .. }
        | Event::HoursDeducted { .. }
        | Event::AuditRecorded { .. } => None,
    }
}

/// User whose membership an event changes.
fn event_member_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::MembershipSet { user_id, .. } => Some(*user_id),
        Event::HoursDeducted { deduction } => Some(deduction.user_id),
        Event::BookingCreated { deduction, .. } | Event::BookingExtended { deduction, .. } => {
            deduction.map(|d| d.user_id)
        }
        _ => None,
    }
}
