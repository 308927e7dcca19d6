use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time::caller_today;

use super::availability::aggregate_blocks;
use super::{BookingError, Engine};

impl Engine {
    pub async fn get_slot(&self, id: &Ulid) -> Option<Slot> {
        let ss = self.slot_state(id)?;
        let guard = ss.read().await;
        Some(guard.slot.clone())
    }

    /// All slots in listing order, optionally narrowed to one platform.
    pub async fn list_slots(&self, platform: Option<Platform>) -> Vec<Slot> {
        let mut out = Vec::new();
        for ss in self.slots_in_order() {
            let guard = ss.read().await;
            if platform.is_none_or(|p| guard.slot.platform == p) {
                out.push(guard.slot.clone());
            }
        }
        out
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserProfile> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        if let Some(b) = self.detached.get(id) {
            return Some(b.value().clone());
        }
        let slot_id = self.booking_to_slot.get(id).map(|e| *e.value())?;
        let ss = self.slot_state(&slot_id)?;
        let guard = ss.read().await;
        guard.booking(*id).cloned()
    }

    /// Booking joined with its holder, their membership and the slot.
    pub async fn get_booking_details(&self, id: &Ulid) -> Result<BookingDetails, BookingError> {
        if let Some(b) = self.detached.get(id).map(|b| b.value().clone()) {
            return Ok(self.join_details(b, None).await);
        }
        let slot_id = self
            .booking_to_slot
            .get(id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(*id))?;
        let ss = self.slot_state(&slot_id).ok_or(BookingError::NotFound(*id))?;
        let (booking, slot) = {
            let guard = ss.read().await;
            let booking = guard.booking(*id).cloned().ok_or(BookingError::NotFound(*id))?;
            (booking, guard.slot.clone())
        };
        Ok(self.join_details(booking, Some(slot)).await)
    }

    pub(super) async fn join_details(&self, booking: Booking, slot: Option<Slot>) -> BookingDetails {
        let user = booking.user_id.and_then(|uid| self.get_user(&uid));
        let membership = match booking.user_id {
            Some(uid) => self.get_membership(&uid).await,
            None => None,
        };
        BookingDetails {
            booking,
            user,
            membership,
            slot,
        }
    }

    /// Bookings matching every given filter, ordered by start. `date` is the
    /// venue-local calendar day the booking starts on.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let offset = self.config.venue_utc_offset_minutes;
        let matches = |b: &Booking| {
            filter.status.is_none_or(|s| b.status == s)
                && filter.date.is_none_or(|d| caller_today(b.date, offset) == d)
        };

        let mut out = Vec::new();
        for ss in self.slots_in_order() {
            let guard = ss.read().await;
            if filter.slot_id.is_some_and(|id| id != guard.slot.id) {
                continue;
            }
            out.extend(guard.bookings.iter().filter(|b| matches(*b)).cloned());
        }
        if filter.slot_id.is_none() {
            out.extend(
                self.detached
                    .iter()
                    .filter(|b| matches(b.value()))
                    .map(|b| b.value().clone()),
            );
        }
        out.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        out
    }

    /// Extension history for one booking, oldest first.
    pub fn audit_log(&self, booking_id: &Ulid) -> Vec<AuditEntry> {
        self.audit
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Bookable hourly blocks for a platform on a venue-local date. Full and
    /// already-started blocks are left out.
    pub async fn available_blocks(&self, date: NaiveDate, platform: Platform) -> Vec<AvailableBlock> {
        let mut blocks = self.all_blocks(date, platform).await;
        blocks.retain(|b| !b.is_full);
        blocks
    }

    /// Every upcoming block for the platform, full ones included.
    pub async fn all_blocks(&self, date: NaiveDate, platform: Platform) -> Vec<AvailableBlock> {
        let started = Instant::now();
        let mut guards = Vec::new();
        for ss in self.slots_in_order() {
            let guard = ss.read_owned().await;
            if guard.slot.is_bookable_for(platform) {
                guards.push(guard);
            }
        }
        let blocks = aggregate_blocks(
            guards.iter().map(|g| &**g),
            date,
            self.config.venue_utc_offset_minutes,
            self.now(),
        );
        metrics::histogram!(
            crate::observability::AVAILABILITY_DURATION_SECONDS,
            "platform" => platform.label()
        )
        .record(started.elapsed().as_secs_f64());
        blocks
    }

    /// Upcoming bookings split by where they stand relative to now.
    pub async fn session_counts(&self) -> SessionCounts {
        let now = self.now();
        let mut counts = SessionCounts::default();
        for ss in self.slots_in_order() {
            let guard = ss.read().await;
            for b in &guard.bookings {
                match b.phase(now) {
                    BookingPhase::Scheduled => counts.scheduled += 1,
                    BookingPhase::Active => counts.active += 1,
                    BookingPhase::AwaitingCheckout => counts.awaiting_checkout += 1,
                    BookingPhase::Completed | BookingPhase::Cancelled => {}
                }
            }
        }
        counts
    }
}
