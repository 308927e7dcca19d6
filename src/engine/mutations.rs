use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::{TimeOfDay, anchor, resolve_start};

use super::availability::{BLOCK_MINUTES, slot_block_start};
use super::conflict::{
    check_within_window, conflict_info, find_conflict, occupancy, validate_duration,
    validate_offset,
};
use super::ledger::{has_quota, is_exhausted, is_valid_for, minutes_to_hours, remaining_hours};
use super::{BookingError, ConflictInfo, Engine, ErrorKind, WalCommand};

/// Result of an extension attempt. Conflicts and quota shortfalls come back
/// as `Rejected` so the caller can offer a forced retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtendOutcome {
    Extended {
        booking: Booking,
    },
    Rejected {
        kind: ErrorKind,
        error: String,
        conflict: Option<ConflictInfo>,
    },
}

impl ExtendOutcome {
    fn rejected(err: BookingError) -> Self {
        debug!("extension rejected: {err}");
        ExtendOutcome::Rejected {
            kind: err.kind(),
            conflict: err.conflict().cloned(),
            error: err.to_string(),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, ExtendOutcome::Extended { .. })
    }
}

fn validate_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), BookingError> {
    match value {
        Some(v) if v.len() > max => Err(BookingError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_price(price: f64) -> Result<(), BookingError> {
    if !price.is_finite() || price < 0.0 {
        return Err(BookingError::Validation("price must be a non-negative number".into()));
    }
    if price > MAX_PRICE {
        return Err(BookingError::LimitExceeded("price too large"));
    }
    Ok(())
}

fn validate_slot(slot: &Slot) -> Result<(), BookingError> {
    validate_text(slot.title.as_deref(), MAX_TITLE_LEN, "slot title too long")?;
    validate_price(slot.price)?;
    if slot.max_players == 0 {
        return Err(BookingError::Validation("max_players must be at least 1".into()));
    }
    if slot.max_players > MAX_PLAYERS {
        return Err(BookingError::LimitExceeded("too many players"));
    }
    Ok(())
}

impl Engine {
    // ── Slots ────────────────────────────────────────────────

    pub async fn create_slot(&self, new: NewSlot) -> Result<Slot, BookingError> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(BookingError::LimitExceeded("too many slots"));
        }
        let mode = self.config.parse_mode();
        let slot = Slot {
            id: Ulid::new(),
            platform: new.platform,
            title: new.title,
            start_time: TimeOfDay::parse_with(&new.start_time, mode)?,
            end_time: TimeOfDay::parse_with(&new.end_time, mode)?,
            price: new.price,
            max_players: new.max_players,
            status: new.status,
            is_public: new.is_public,
        };
        validate_slot(&slot)?;

        let _gate = self.compaction_gate.read().await;
        let event = Event::SlotCreated { slot: slot.clone() };
        self.persist_and_apply(None, None, &event).await?;
        info!(
            slot_id = %slot.id,
            platform = slot.platform.label(),
            "slot created {}-{}",
            slot.start_time,
            slot.end_time
        );
        Ok(slot)
    }

    pub async fn update_slot(&self, update: SlotUpdate) -> Result<Slot, BookingError> {
        let mode = self.config.parse_mode();
        let start_time = update
            .start_time
            .as_deref()
            .map(|s| TimeOfDay::parse_with(s, mode))
            .transpose()?;
        let end_time = update
            .end_time
            .as_deref()
            .map(|s| TimeOfDay::parse_with(s, mode))
            .transpose()?;

        let _gate = self.compaction_gate.read().await;
        let ss = self
            .slot_state(&update.id)
            .ok_or(BookingError::NotFound(update.id))?;
        let mut guard = ss.write_owned().await;

        let mut slot = guard.slot.clone();
        if let Some(title) = update.title {
            slot.title = Some(title).filter(|t| !t.is_empty());
        }
        if let Some(t) = start_time {
            slot.start_time = t;
        }
        if let Some(t) = end_time {
            slot.end_time = t;
        }
        if let Some(price) = update.price {
            slot.price = price;
        }
        if let Some(max) = update.max_players {
            slot.max_players = max;
        }
        if let Some(public) = update.is_public {
            slot.is_public = public;
        }
        validate_slot(&slot)?;

        let event = Event::SlotUpdated { slot: slot.clone() };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        info!(slot_id = %slot.id, "slot updated");
        Ok(slot)
    }

    pub async fn set_slot_status(&self, id: Ulid, status: SlotStatus) -> Result<Slot, BookingError> {
        let _gate = self.compaction_gate.read().await;
        let ss = self.slot_state(&id).ok_or(BookingError::NotFound(id))?;
        let mut guard = ss.write_owned().await;
        let slot = Slot {
            status,
            ..guard.slot.clone()
        };
        let event = Event::SlotUpdated { slot: slot.clone() };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        info!(slot_id = %id, ?status, "slot status changed");
        Ok(slot)
    }

    /// Refused while upcoming bookings remain. Past bookings stay queryable
    /// with no slot attached.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), BookingError> {
        let _gate = self.compaction_gate.read().await;
        let ss = self.slot_state(&id).ok_or(BookingError::NotFound(id))?;
        let mut guard = ss.write_owned().await;
        if !self.slots.contains_key(&id) {
            return Err(BookingError::NotFound(id));
        }
        if guard.has_upcoming() {
            return Err(BookingError::HasBookings(id));
        }
        let event = Event::SlotDeleted {
            id,
            platform: guard.slot.platform,
        };
        let detached = guard.bookings.len();
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        info!(slot_id = %id, detached, "slot deleted");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────

    /// Create or rename a user profile.
    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        phone: Option<String>,
    ) -> Result<UserProfile, BookingError> {
        if name.trim().is_empty() {
            return Err(BookingError::Validation("name must not be empty".into()));
        }
        validate_text(Some(&name), MAX_NAME_LEN, "name too long")?;
        validate_text(phone.as_deref(), MAX_PHONE_LEN, "phone too long")?;
        if !self.users.contains_key(&id) && self.users.len() >= MAX_USERS {
            return Err(BookingError::LimitExceeded("too many users"));
        }

        let _gate = self.compaction_gate.read().await;
        let user = UserProfile { id, name, phone };
        let event = Event::UserRegistered { user: user.clone() };
        self.persist_and_apply(None, None, &event).await?;
        debug!(user_id = %id, "user registered");
        Ok(user)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Front-desk booking against one slot. Without `force` the interval
    /// must sit inside the slot window and overlap no other upcoming booking.
    pub async fn create_offline_booking(
        &self,
        req: CreateOfflineBooking,
    ) -> Result<BookingDetails, BookingError> {
        if let Some(d) = req.duration {
            validate_duration(d, MAX_BOOKING_MINUTES)?;
        }
        validate_offset(req.timezone_offset_minutes)?;
        validate_text(
            req.idempotency_key.as_deref(),
            MAX_IDEMPOTENCY_KEY_LEN,
            "idempotency key too long",
        )?;

        let _gate = self.compaction_gate.read().await;
        let ss = self
            .slot_state(&req.slot_id)
            .ok_or(BookingError::NotFound(req.slot_id))?;
        let mut guard = ss.write_owned().await;
        if !self.slots.contains_key(&req.slot_id) {
            return Err(BookingError::NotFound(req.slot_id));
        }

        if let Some(existing) =
            self.idempotent_booking(req.user_id, req.idempotency_key.as_deref())
        {
            let Some(booking) = guard.booking(existing).cloned() else {
                return Err(BookingError::Validation(
                    "idempotency key already used for a booking on another slot".into(),
                ));
            };
            let slot = guard.slot.clone();
            drop(guard);
            return Ok(self.join_details(booking, Some(slot)).await);
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(BookingError::LimitExceeded("too many bookings on slot"));
        }
        let slot = guard.slot.clone();

        let user = match req.user_id {
            Some(uid) => Some(
                self.users
                    .get(&uid)
                    .map(|u| u.value().clone())
                    .ok_or(BookingError::NotFound(uid))?,
            ),
            None => None,
        };
        let membership = match req.user_id {
            Some(uid) => self.get_membership(&uid).await,
            None => None,
        };
        if let Some(m) = &membership
            && is_exhausted(m)
        {
            metrics::counter!(crate::observability::QUOTA_REJECTIONS_TOTAL).increment(1);
            return Err(BookingError::QuotaExceeded {
                available: remaining_hours(m).max(0.0),
                required: minutes_to_hours(req.duration.unwrap_or(slot.duration())),
            });
        }

        let duration = req.duration.unwrap_or(slot.duration());
        validate_duration(duration, MAX_BOOKING_MINUTES)?;

        let now = self.now();
        let offset = req.timezone_offset_minutes;
        let start = resolve_start(
            req.start_time.as_deref(),
            slot.start_time,
            req.source.is_immediate(),
            now,
            offset,
            self.config.parse_mode(),
        )?;
        if !req.force {
            check_within_window(&slot, start, duration)?;
        }

        let date = anchor(start, now, offset);
        let span = Span::starting_at(date, duration);
        if !req.force
            && let Some(existing) = find_conflict(&guard, &span, None)
        {
            let info = conflict_info(existing, &self.users);
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "op" => "create")
                .increment(1);
            debug!(slot_id = %slot.id, holder = info.holder_name(), "booking conflict");
            return Err(BookingError::Conflict(info));
        }

        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            slot_id: Some(slot.id),
            date,
            start_time: start,
            duration,
            platform: slot.platform,
            status: BookingStatus::Upcoming,
            source: req.source,
            payment_method: None,
            total_price: None,
            is_admin_extended: false,
            extension_reason: None,
            extension_admin_id: None,
            extension_payment_method: None,
            idempotency_key: req.idempotency_key,
            created_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            deduction: None,
        };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        metrics::counter!(
            crate::observability::BOOKINGS_CREATED_TOTAL,
            "source" => booking.source.label(),
            "forced" => if req.force { "true" } else { "false" }
        )
        .increment(1);
        info!(
            booking_id = %booking.id,
            slot_id = %slot.id,
            start = %booking.date,
            duration,
            forced = req.force,
            "booking created"
        );

        Ok(BookingDetails {
            booking,
            user,
            membership,
            slot: Some(slot),
        })
    }

    /// Self-service one-hour booking. Slots are tried in listing order and the
    /// first with a free seat for the hour wins.
    pub async fn create_online_booking(
        &self,
        caller: &Caller,
        req: CreateOnlineBooking,
    ) -> Result<BookingDetails, BookingError> {
        let start = TimeOfDay::parse_with(&req.start_time, self.config.parse_mode())?;
        validate_text(
            req.idempotency_key.as_deref(),
            MAX_IDEMPOTENCY_KEY_LEN,
            "idempotency key too long",
        )?;
        let user = self
            .users
            .get(&caller.user_id)
            .map(|u| u.value().clone())
            .ok_or(BookingError::NotFound(caller.user_id))?;

        let _gate = self.compaction_gate.read().await;
        if let Some(existing) =
            self.idempotent_booking(Some(caller.user_id), req.idempotency_key.as_deref())
        {
            return self.get_booking_details(&existing).await;
        }

        let now = self.now();
        let offset = self.config.venue_utc_offset_minutes;
        let mut covered = false;
        let mut passed = false;

        for ss in self.slots_in_order() {
            let mut guard = ss.write_owned().await;
            if !guard.slot.is_bookable_for(req.platform) {
                continue;
            }
            let Some(starts_at) = slot_block_start(&guard.slot, req.date, start, offset) else {
                continue;
            };
            if starts_at < now {
                passed = true;
                continue;
            }
            covered = true;
            let span = Span::starting_at(starts_at, BLOCK_MINUTES);
            if occupancy(&guard, &span) >= guard.slot.max_players {
                continue;
            }
            if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
                continue;
            }

            let member = self.membership_state(&caller.user_id);
            let mut member_guard = match member {
                Some(m) => Some(m.write_owned().await),
                None => None,
            };
            let funded = member_guard
                .as_deref()
                .is_some_and(|m| has_quota(m, BLOCK_MINUTES) && is_valid_for(m, starts_at));
            let (payment_method, deduction) = if funded {
                let d = Deduction {
                    user_id: caller.user_id,
                    hours: minutes_to_hours(BLOCK_MINUTES),
                };
                (PaymentMethod::Subscription, Some(d))
            } else {
                (PaymentMethod::PayAtVenue, None)
            };

            let booking = Booking {
                id: Ulid::new(),
                user_id: Some(caller.user_id),
                slot_id: Some(guard.slot.id),
                date: starts_at,
                start_time: start,
                duration: BLOCK_MINUTES,
                platform: req.platform,
                status: BookingStatus::Upcoming,
                source: BookingSource::Online,
                payment_method: Some(payment_method),
                total_price: None,
                is_admin_extended: false,
                extension_reason: None,
                extension_admin_id: None,
                extension_payment_method: None,
                idempotency_key: req.idempotency_key,
                created_at: now,
            };
            let event = Event::BookingCreated {
                booking: booking.clone(),
                deduction,
            };
            let member_ref = if funded { member_guard.as_deref_mut() } else { None };
            self.persist_and_apply(Some(&mut *guard), member_ref, &event).await?;

            metrics::counter!(
                crate::observability::BOOKINGS_CREATED_TOTAL,
                "source" => BookingSource::Online.label(),
                "forced" => "false"
            )
            .increment(1);
            info!(
                booking_id = %booking.id,
                slot_id = %guard.slot.id,
                start = %starts_at,
                ?payment_method,
                "online booking created"
            );
            return Ok(BookingDetails {
                booking,
                user: Some(user),
                membership: member_guard.as_deref().cloned(),
                slot: Some(guard.slot.clone()),
            });
        }

        if covered {
            Err(BookingError::SlotsFull)
        } else if passed {
            Err(BookingError::Validation("requested time has already passed".into()))
        } else {
            Err(BookingError::NoSlotAvailable)
        }
    }

    /// Admin-only. Everything except authorization and malformed input comes
    /// back as `ExtendOutcome::Rejected`.
    pub async fn extend_booking(
        &self,
        caller: &Caller,
        req: ExtendBooking,
    ) -> Result<ExtendOutcome, BookingError> {
        if !caller.is_admin() {
            return Err(BookingError::Unauthorized("only admins can extend bookings"));
        }
        if req.minutes == 0 {
            return Err(BookingError::Validation("extension must be positive".into()));
        }
        if req.minutes > MAX_EXTENSION_MINUTES {
            return Err(BookingError::LimitExceeded("extension too long"));
        }
        validate_text(req.reason.as_deref(), MAX_REASON_LEN, "reason too long")?;

        let _gate = self.compaction_gate.read().await;
        if self.detached.contains_key(&req.booking_id) {
            return Err(BookingError::Validation("booking is no longer attached to a slot".into()));
        }
        let mut guard = self.resolve_booking_write(&req.booking_id).await?;
        let booking = guard
            .booking(req.booking_id)
            .cloned()
            .ok_or(BookingError::NotFound(req.booking_id))?;
        if booking.status != BookingStatus::Upcoming {
            return Err(BookingError::Validation(format!(
                "only upcoming bookings can be extended (status {:?})",
                booking.status
            )));
        }
        let duration = booking.duration + req.minutes;
        validate_duration(duration, MAX_BOOKING_MINUTES)?;

        if !req.force {
            let span = Span::starting_at(booking.date, duration);
            if let Some(other) = find_conflict(&guard, &span, Some(booking.id)) {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL, "op" => "extend")
                    .increment(1);
                let info = conflict_info(other, &self.users);
                return Ok(ExtendOutcome::rejected(BookingError::Conflict(info)));
            }
            if let Err(e) = check_within_window(&guard.slot, booking.start_time, duration) {
                return Ok(ExtendOutcome::rejected(e));
            }
        }

        let mut member_guard = None;
        let mut deduction = None;
        if req.payment_method.is_quota_funded() {
            let Some(user_id) = booking.user_id else {
                return Ok(ExtendOutcome::rejected(BookingError::Validation(
                    "guest bookings cannot use subscription hours".into(),
                )));
            };
            let Some(member) = self.membership_state(&user_id) else {
                return Ok(ExtendOutcome::rejected(BookingError::Validation(
                    "user has no subscription".into(),
                )));
            };
            let m = member.write_owned().await;
            if !m.is_subscriber {
                return Ok(ExtendOutcome::rejected(BookingError::Validation(
                    "user has no subscription".into(),
                )));
            }
            if !has_quota(&m, req.minutes) {
                metrics::counter!(crate::observability::QUOTA_REJECTIONS_TOTAL).increment(1);
                return Ok(ExtendOutcome::rejected(BookingError::QuotaExceeded {
                    available: remaining_hours(&m).max(0.0),
                    required: minutes_to_hours(req.minutes),
                }));
            }
            deduction = Some(Deduction {
                user_id,
                hours: minutes_to_hours(req.minutes),
            });
            member_guard = Some(m);
        }

        let audit = AuditEntry {
            id: Ulid::new(),
            booking_id: booking.id,
            admin_id: caller.user_id,
            action: AuditAction::Extended,
            minutes: req.minutes,
            reason: req.reason.clone(),
            payment_method: req.payment_method,
            forced: req.force,
            at: self.now(),
        };
        let event = Event::BookingExtended {
            id: booking.id,
            slot_id: guard.slot.id,
            platform: booking.platform,
            duration,
            reason: req.reason,
            admin_id: caller.user_id,
            payment_method: req.payment_method,
            deduction,
            audit,
        };
        self.persist_and_apply(Some(&mut *guard), member_guard.as_deref_mut(), &event)
            .await?;
        metrics::counter!(
            crate::observability::EXTENSIONS_TOTAL,
            "forced" => if req.force { "true" } else { "false" }
        )
        .increment(1);
        info!(
            booking_id = %booking.id,
            admin_id = %caller.user_id,
            minutes = req.minutes,
            forced = req.force,
            "booking extended"
        );

        let booking = guard
            .booking(booking.id)
            .cloned()
            .ok_or(BookingError::NotFound(booking.id))?;
        Ok(ExtendOutcome::Extended { booking })
    }

    /// Checkout and cancellation. Only status and the financial fields change.
    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        total_price: Option<f64>,
        payment_method: Option<PaymentMethod>,
    ) -> Result<Booking, BookingError> {
        if let Some(p) = total_price {
            validate_price(p)?;
        }
        let _gate = self.compaction_gate.read().await;

        if let Some(detached) = self.detached.get(&id).map(|b| b.value().clone()) {
            let event = Event::BookingStatusChanged {
                id,
                slot_id: None,
                platform: detached.platform,
                status,
                total_price,
                payment_method,
            };
            self.persist_and_apply(None, None, &event).await?;
            info!(booking_id = %id, ?status, "booking status changed");
            return self
                .detached
                .get(&id)
                .map(|b| b.value().clone())
                .ok_or(BookingError::NotFound(id));
        }

        let mut guard = self.resolve_booking_write(&id).await?;
        let platform = guard.slot.platform;
        let event = Event::BookingStatusChanged {
            id,
            slot_id: Some(guard.slot.id),
            platform,
            status,
            total_price,
            payment_method,
        };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        info!(booking_id = %id, ?status, "booking status changed");
        guard.booking(id).cloned().ok_or(BookingError::NotFound(id))
    }

    /// Hard delete. The booking stops occupying its slot immediately.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, BookingError> {
        let _gate = self.compaction_gate.read().await;

        if let Some(detached) = self.detached.get(&id).map(|b| b.value().clone()) {
            let event = Event::BookingDeleted {
                id,
                slot_id: None,
                platform: detached.platform,
            };
            self.persist_and_apply(None, None, &event).await?;
            info!(booking_id = %id, "booking deleted");
            return Ok(detached);
        }

        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(BookingError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            slot_id: Some(guard.slot.id),
            platform: booking.platform,
        };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        info!(booking_id = %id, slot_id = %guard.slot.id, "booking deleted");
        Ok(booking)
    }

    /// Booking `holder` already made under `key`.
    fn idempotent_booking(&self, holder: Option<Ulid>, key: Option<&str>) -> Option<Ulid> {
        let key = key?;
        self.idempotency
            .get(&(holder, key.to_string()))
            .map(|e| *e.value())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<usize, BookingError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();

        for user in self.users.iter() {
            events.push(Event::UserRegistered {
                user: user.value().clone(),
            });
        }
        let members: Vec<_> = self
            .memberships
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (user_id, shared) in members {
            let membership = shared.read().await.clone();
            events.push(Event::MembershipSet { user_id, membership });
        }
        for ss in self.slots_in_order() {
            let guard = ss.read().await;
            events.push(Event::SlotCreated {
                slot: guard.slot.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    deduction: None,
                });
            }
        }
        for booking in self.detached.iter() {
            events.push(Event::BookingCreated {
                booking: booking.value().clone(),
                deduction: None,
            });
        }
        for entries in self.audit.iter() {
            for entry in entries.value() {
                events.push(Event::AuditRecorded {
                    entry: entry.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
