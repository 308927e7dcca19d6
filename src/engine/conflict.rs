use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;
use crate::time::{MINUTES_PER_DAY, TimeOfDay};

use super::{BookingError, ConflictInfo};

/// `[a_start, a_end)` and `[b_start, b_end)` share at least one instant.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// First `Upcoming` booking on the slot that overlaps `span`, skipping `exclude`.
/// Completed and cancelled bookings never block a new interval.
pub(crate) fn find_conflict<'a>(
    ss: &'a SlotState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    ss.overlapping(span).find(|b| {
        b.status == BookingStatus::Upcoming
            && Some(b.id) != exclude
            && overlaps(span.start, span.end, b.span().start, b.span().end)
    })
}

/// Bookings that hold a seat somewhere inside `span`.
pub(crate) fn occupancy(ss: &SlotState, span: &Span) -> u32 {
    ss.overlapping(span)
        .filter(|b| b.status.occupies())
        .count() as u32
}

pub(crate) fn conflict_info(booking: &Booking, users: &DashMap<Ulid, UserProfile>) -> ConflictInfo {
    ConflictInfo {
        booking_id: booking.id,
        user: booking
            .user_id
            .and_then(|uid| users.get(&uid).map(|u| u.value().clone())),
    }
}

/// Wall-clock bound check. The interval must start inside the slot window and
/// end no later than its close; windows that cross midnight are measured from
/// their opening time so `01:00` inside an `18:00-02:00` window counts as 7h in.
pub(crate) fn check_within_window(
    slot: &Slot,
    start: TimeOfDay,
    duration: u32,
) -> Result<(), BookingError> {
    let open = slot.start_time.minutes();
    let mut s = start.minutes();
    if s < open {
        s += MINUTES_PER_DAY;
    }
    if s + duration > open + slot.duration() {
        return Err(BookingError::OutOfBounds {
            start,
            duration,
            window_start: slot.start_time,
            window_end: slot.end_time,
        });
    }
    Ok(())
}

pub(crate) fn validate_duration(minutes: u32, max: u32) -> Result<(), BookingError> {
    if minutes == 0 {
        return Err(BookingError::Validation("duration must be positive".into()));
    }
    if minutes > max {
        return Err(BookingError::LimitExceeded("duration too long"));
    }
    Ok(())
}

pub(crate) fn validate_offset(offset_minutes: i32) -> Result<(), BookingError> {
    if offset_minutes.abs() > crate::limits::MAX_UTC_OFFSET_MINUTES {
        return Err(BookingError::LimitExceeded("timezone offset out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    fn slot(start: &str, end: &str) -> Slot {
        Slot {
            id: Ulid::new(),
            platform: Platform::Console,
            title: None,
            start_time: TimeOfDay::parse(start).unwrap(),
            end_time: TimeOfDay::parse(end).unwrap(),
            price: 100.0,
            max_players: 1,
            status: SlotStatus::Available,
            is_public: true,
        }
    }

    fn booking(start: DateTime<Utc>, minutes: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: None,
            slot_id: None,
            date: start,
            start_time: TimeOfDay::of(start.naive_utc()),
            duration: minutes,
            platform: Platform::Console,
            status,
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

    #[test]
    fn overlap_is_exclusive_at_endpoints() {
        assert!(overlaps(0, 10, 5, 15));
        assert!(overlaps(0, 10, 2, 3));
        assert!(!overlaps(0, 10, 10, 20));
        assert!(!overlaps(10, 20, 0, 10));
    }

    #[test]
    fn conflict_only_with_upcoming() {
        let mut ss = SlotState::new(slot("17:00", "22:00"));
        ss.insert_booking(booking(at(18, 0), 60, BookingStatus::Completed));
        ss.insert_booking(booking(at(18, 0), 60, BookingStatus::Cancelled));
        let span = Span::starting_at(at(18, 30), 60);
        assert!(find_conflict(&ss, &span, None).is_none());

        let live = booking(at(18, 0), 60, BookingStatus::Upcoming);
        let live_id = live.id;
        ss.insert_booking(live);
        assert_eq!(find_conflict(&ss, &span, None).map(|b| b.id), Some(live_id));
        assert!(find_conflict(&ss, &span, Some(live_id)).is_none());
    }

    #[test]
    fn adjacent_booking_is_not_a_conflict() {
        let mut ss = SlotState::new(slot("17:00", "22:00"));
        ss.insert_booking(booking(at(18, 0), 60, BookingStatus::Upcoming));
        let span = Span::starting_at(at(19, 0), 60);
        assert!(find_conflict(&ss, &span, None).is_none());
    }

    #[test]
    fn occupancy_counts_completed_not_cancelled() {
        let mut ss = SlotState::new(slot("17:00", "22:00"));
        ss.insert_booking(booking(at(18, 0), 60, BookingStatus::Upcoming));
        ss.insert_booking(booking(at(18, 30), 60, BookingStatus::Completed));
        ss.insert_booking(booking(at(18, 0), 60, BookingStatus::Cancelled));
        assert_eq!(occupancy(&ss, &Span::starting_at(at(18, 0), 60)), 2);
        assert_eq!(occupancy(&ss, &Span::starting_at(at(20, 0), 60)), 0);
    }

    #[test]
    fn window_check_same_day() {
        let s = slot("17:00", "22:00");
        let t = |x: &str| TimeOfDay::parse(x).unwrap();
        assert!(check_within_window(&s, t("17:00"), 300).is_ok());
        assert!(check_within_window(&s, t("21:00"), 60).is_ok());
        assert!(matches!(
            check_within_window(&s, t("21:30"), 60),
            Err(BookingError::OutOfBounds { .. })
        ));
        assert!(check_within_window(&s, t("16:00"), 60).is_err());
    }

    #[test]
    fn window_check_crosses_midnight() {
        let s = slot("18:00", "02:00");
        let t = |x: &str| TimeOfDay::parse(x).unwrap();
        assert!(check_within_window(&s, t("23:30"), 60).is_ok());
        assert!(check_within_window(&s, t("00:10"), 60).is_ok());
        assert!(check_within_window(&s, t("01:00"), 60).is_ok());
        assert!(check_within_window(&s, t("01:30"), 60).is_err());
        assert!(check_within_window(&s, t("03:00"), 30).is_err());
    }

    #[test]
    fn duration_validation() {
        assert!(validate_duration(0, 1440).is_err());
        assert!(validate_duration(60, 1440).is_ok());
        assert!(matches!(
            validate_duration(2000, 1440),
            Err(BookingError::LimitExceeded(_))
        ));
        assert!(validate_offset(-330).is_ok());
        assert!(validate_offset(900).is_err());
    }
}
