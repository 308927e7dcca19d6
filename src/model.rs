use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::TimeOfDay;

/// Unix milliseconds. Spans are compared in this unit.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn starting_at(start: DateTime<Utc>, minutes: u32) -> Self {
        let start = start.timestamp_millis();
        Self::new(start, start + minutes as Ms * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Console,
    Vr,
    RacingSim,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Console, Platform::Vr, Platform::RacingSim];

    pub fn label(self) -> &'static str {
        match self {
            Platform::Console => "CONSOLE",
            Platform::Vr => "VR",
            Platform::RacingSim => "RACING_SIM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Booked,
    Blocked,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Upcoming,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Statuses that hold a seat for availability purposes.
    pub fn occupies(self) -> bool {
        matches!(self, BookingStatus::Upcoming | BookingStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingSource {
    Online,
    Offline,
}

impl BookingSource {
    /// Walk-in bookings start "now" when no explicit start time is given.
    pub fn is_immediate(self) -> bool {
        matches!(self, BookingSource::Offline)
    }

    pub fn label(self) -> &'static str {
        match self {
            BookingSource::Online => "online",
            BookingSource::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Upi,
    Card,
    /// Online booking funded from the subscription ledger.
    Subscription,
    /// Admin extension funded from the subscription ledger.
    SubscriptionHours,
    PayAtVenue,
}

impl PaymentMethod {
    pub fn is_quota_funded(self) -> bool {
        matches!(self, PaymentMethod::Subscription | PaymentMethod::SubscriptionHours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Customer,
}

/// Authenticated identity as handed to us by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn customer(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Customer }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// A physical station and its daily operating window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub platform: Platform,
    pub title: Option<String>,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    /// Price per hour.
    pub price: f64,
    pub max_players: u32,
    pub status: SlotStatus,
    pub is_public: bool,
}

impl Slot {
    /// Window length in minutes; wraps past midnight when `end_time <= start_time`.
    pub fn duration(&self) -> u32 {
        self.start_time.minutes_until(self.end_time)
    }

    pub fn is_bookable_for(&self, platform: Platform) -> bool {
        self.platform == platform && self.status == SlotStatus::Available && self.is_public
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// `None` for guests.
    pub user_id: Option<Ulid>,
    /// `None` once the slot has been deleted.
    pub slot_id: Option<Ulid>,
    /// Absolute start of the session.
    pub date: DateTime<Utc>,
    /// Wall-clock start as entered by the caller.
    pub start_time: TimeOfDay,
    /// Minutes.
    pub duration: u32,
    pub platform: Platform,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub payment_method: Option<PaymentMethod>,
    pub total_price: Option<f64>,
    pub is_admin_extended: bool,
    pub extension_reason: Option<String>,
    pub extension_admin_id: Option<Ulid>,
    pub extension_payment_method: Option<PaymentMethod>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::starting_at(self.date, self.duration)
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.date + chrono::Duration::minutes(self.duration as i64)
    }

    /// Derived view of where the session stands at `now`. Storage keeps
    /// `Upcoming` until checkout, so active/elapsed are computed here.
    pub fn phase(&self, now: DateTime<Utc>) -> BookingPhase {
        match self.status {
            BookingStatus::Completed => BookingPhase::Completed,
            BookingStatus::Cancelled => BookingPhase::Cancelled,
            BookingStatus::Upcoming => {
                let t = now.timestamp_millis();
                let span = self.span();
                if t < span.start {
                    BookingPhase::Scheduled
                } else if span.contains_instant(t) {
                    BookingPhase::Active
                } else {
                    BookingPhase::AwaitingCheckout
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPhase {
    Scheduled,
    Active,
    AwaitingCheckout,
    Completed,
    Cancelled,
}

/// Subscription hour ledger, one per user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Membership {
    pub is_subscriber: bool,
    pub tier: Option<String>,
    pub total_hours: f64,
    pub utilized_hours: f64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Extended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub admin_id: Ulid,
    pub action: AuditAction,
    pub minutes: u32,
    pub reason: Option<String>,
    pub payment_method: PaymentMethod,
    pub forced: bool,
    pub at: DateTime<Utc>,
}

/// Hours taken off a user's ledger as part of a booking write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deduction {
    pub user_id: Ulid,
    pub hours: f64,
}

// ── Per-slot state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    /// Every booking attached to this slot, sorted by start.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start. Extensions only move the end,
    /// so the order never needs repairing afterwards.
    pub fn insert_booking(&mut self, booking: Booking) {
        let start = booking.date;
        let pos = self
            .bookings
            .binary_search_by_key(&start, |b| b.date)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window, whatever their status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.date.timestamp_millis() < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }

    pub fn has_upcoming(&self) -> bool {
        self.bookings
            .iter()
            .any(|b| b.status == BookingStatus::Upcoming)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Every committed change. This is the WAL record format and the payload
/// broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        slot: Slot,
    },
    SlotUpdated {
        slot: Slot,
    },
    SlotDeleted {
        id: Ulid,
        platform: Platform,
    },
    UserRegistered {
        user: UserProfile,
    },
    MembershipSet {
        user_id: Ulid,
        membership: Membership,
    },
    HoursDeducted {
        deduction: Deduction,
    },
    BookingCreated {
        booking: Booking,
        deduction: Option<Deduction>,
    },
    BookingExtended {
        id: Ulid,
        slot_id: Ulid,
        platform: Platform,
        duration: u32,
        reason: Option<String>,
        admin_id: Ulid,
        payment_method: PaymentMethod,
        deduction: Option<Deduction>,
        audit: AuditEntry,
    },
    BookingStatusChanged {
        id: Ulid,
        slot_id: Option<Ulid>,
        platform: Platform,
        status: BookingStatus,
        total_price: Option<f64>,
        payment_method: Option<PaymentMethod>,
    },
    BookingDeleted {
        id: Ulid,
        slot_id: Option<Ulid>,
        platform: Platform,
    },
    /// Only written by compaction, to carry audit history forward.
    AuditRecorded {
        entry: AuditEntry,
    },
}

impl Event {
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking, .. } => Some(booking.id),
            Event::BookingExtended { id, .. }
            | Event::BookingStatusChanged { id, .. }
            | Event::BookingDeleted { id, .. } => Some(*id),
            Event::AuditRecorded { entry } => Some(entry.booking_id),
            _ => None,
        }
    }

    pub fn platform(&self) -> Option<Platform> {
        match self {
            Event::SlotCreated { slot } | Event::SlotUpdated { slot } => Some(slot.platform),
            Event::BookingCreated { booking, .. } => Some(booking.platform),
            Event::SlotDeleted { platform, .. }
            | Event::BookingExtended { platform, .. }
            | Event::BookingStatusChanged { platform, .. }
            | Event::BookingDeleted { platform, .. } => Some(*platform),
            Event::UserRegistered { .. }
            | Event::MembershipSet { .. }
            | Event::HoursDeducted { .. }
            | Event::AuditRecorded { .. } => None,
        }
    }
}

// ── Commands and results ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSlot {
    pub platform: Platform,
    #[serde(default)]
    pub title: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub price: f64,
    pub max_players: u32,
    #[serde(default = "default_slot_status")]
    pub status: SlotStatus,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

fn default_slot_status() -> SlotStatus {
    SlotStatus::Available
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotUpdate {
    pub id: Ulid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOfflineBooking {
    #[serde(default)]
    pub user_id: Option<Ulid>,
    pub slot_id: Ulid,
    /// Minutes; defaults to the slot's whole window.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default = "default_offline")]
    pub source: BookingSource,
    #[serde(default)]
    pub force: bool,
    /// Minutes such that `UTC = local + offset`.
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_offline() -> BookingSource {
    BookingSource::Offline
}

impl CreateOfflineBooking {
    pub fn new(slot_id: Ulid) -> Self {
        Self {
            user_id: None,
            slot_id,
            duration: None,
            start_time: None,
            source: BookingSource::Offline,
            force: false,
            timezone_offset_minutes: 0,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOnlineBooking {
    pub platform: Platform,
    /// Venue-local calendar date.
    pub date: NaiveDate,
    pub start_time: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendBooking {
    pub booking_id: Ulid,
    pub minutes: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingFilter {
    #[serde(default)]
    pub slot_id: Option<Ulid>,
    /// Venue-local calendar date of the booking start.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
}

/// Booking joined with the records a front desk needs to render it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub user: Option<UserProfile>,
    pub membership: Option<Membership>,
    pub slot: Option<Slot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableBlock {
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub starts_at: DateTime<Utc>,
    pub price: f64,
    pub max_players: u32,
    pub booked_count: u32,
    pub is_full: bool,
    pub available_spots: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub scheduled: usize,
    pub active: usize,
    pub awaiting_checkout: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    fn tod(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    fn booking(start: DateTime<Utc>, minutes: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: None,
            slot_id: None,
            date: start,
            start_time: TimeOfDay::from_minutes(0),
            duration: minutes,
            platform: Platform::Console,
            status: BookingStatus::Upcoming,
            source: BookingSource::Offline,
            payment_method: None,
            total_price: None,
            is_admin_extended: false,
            extension_reason: None,
            extension_admin_id: None,
            extension_payment_method: None,
            idempotency_key: None,
            created_at: start,
        }
    }

    fn slot(start: &str, end: &str) -> Slot {
        Slot {
            id: Ulid::new(),
            platform: Platform::Vr,
            title: None,
            start_time: tod(start),
            end_time: tod(end),
            price: 100.0,
            max_players: 1,
            status: SlotStatus::Available,
            is_public: true,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching
        assert!(a.contains_instant(100));
        assert!(!a.contains_instant(200));
    }

    #[test]
    fn slot_duration_wraps_midnight() {
        assert_eq!(slot("17:00", "22:00").duration(), 300);
        assert_eq!(slot("18:00", "02:00").duration(), 480);
    }

    #[test]
    fn slot_bookable_requires_available_public_platform() {
        let mut s = slot("10:00", "12:00");
        assert!(s.is_bookable_for(Platform::Vr));
        assert!(!s.is_bookable_for(Platform::Console));
        s.is_public = false;
        assert!(!s.is_bookable_for(Platform::Vr));
        s.is_public = true;
        s.status = SlotStatus::Maintenance;
        assert!(!s.is_bookable_for(Platform::Vr));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut ss = SlotState::new(slot("10:00", "22:00"));
        ss.insert_booking(booking(at(15, 0), 60));
        ss.insert_booking(booking(at(11, 0), 60));
        ss.insert_booking(booking(at(13, 0), 60));
        let starts: Vec<_> = ss.bookings.iter().map(|b| b.date).collect();
        assert_eq!(starts, vec![at(11, 0), at(13, 0), at(15, 0)]);
    }

    #[test]
    fn overlapping_skips_adjacent_and_distant() {
        let mut ss = SlotState::new(slot("10:00", "22:00"));
        ss.insert_booking(booking(at(10, 0), 60)); // ends at 11:00
        let hit = booking(at(11, 30), 60);
        let hit_id = hit.id;
        ss.insert_booking(hit);
        ss.insert_booking(booking(at(14, 0), 60));

        let query = Span::starting_at(at(11, 0), 60);
        let hits: Vec<_> = ss.overlapping(&query).map(|b| b.id).collect();
        assert_eq!(hits, vec![hit_id]);
    }

    #[test]
    fn overlapping_finds_long_booking_started_earlier() {
        let mut ss = SlotState::new(slot("10:00", "22:00"));
        ss.insert_booking(booking(at(10, 0), 300));
        let query = Span::starting_at(at(13, 0), 60);
        assert_eq!(ss.overlapping(&query).count(), 1);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut ss = SlotState::new(slot("10:00", "22:00"));
        ss.insert_booking(booking(at(10, 0), 60));
        assert!(ss.remove_booking(Ulid::new()).is_none());
        assert_eq!(ss.bookings.len(), 1);
    }

    #[test]
    fn phase_is_derived_from_now() {
        let b = booking(at(18, 0), 60);
        assert_eq!(b.phase(at(17, 59)), BookingPhase::Scheduled);
        assert_eq!(b.phase(at(18, 0)), BookingPhase::Active);
        assert_eq!(b.phase(at(18, 59)), BookingPhase::Active);
        assert_eq!(b.phase(at(19, 0)), BookingPhase::AwaitingCheckout);

        let mut done = b.clone();
        done.status = BookingStatus::Completed;
        assert_eq!(done.phase(at(18, 30)), BookingPhase::Completed);
    }

    #[test]
    fn event_bincode_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(at(18, 0), 90),
            deduction: Some(Deduction {
                user_id: Ulid::new(),
                hours: 1.5,
            }),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn enums_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&Platform::RacingSim).unwrap(),
            "\"RACING_SIM\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::SubscriptionHours).unwrap(),
            "\"SUBSCRIPTION_HOURS\""
        );
        assert_eq!(
            serde_json::to_string(&BookingStatus::Upcoming).unwrap(),
            "\"Upcoming\""
        );
    }
}
