use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::model::*;
use crate::time::{TimeOfDay, to_absolute};

use super::conflict::{check_within_window, occupancy};

/// Self-service bookings and availability blocks are one hour long.
pub const BLOCK_MINUTES: u32 = 60;

// ── Hourly block aggregation ─────────────────────────────────────

/// Walk every slot's window on `date` in one-hour blocks and fold blocks that
/// start at the same instant into one entry.
///
/// `slots` must already be filtered to the bookable slots of one platform and
/// given in listing order: the first slot to produce a block sets its price.
/// Capacity and occupancy add up across slots. Blocks that have already
/// started are dropped. Full blocks are kept; callers decide whether to show them.
pub fn aggregate_blocks<'a>(
    slots: impl IntoIterator<Item = &'a SlotState>,
    date: NaiveDate,
    offset_minutes: i32,
    now: DateTime<Utc>,
) -> Vec<AvailableBlock> {
    let mut blocks: BTreeMap<DateTime<Utc>, AvailableBlock> = BTreeMap::new();

    for ss in slots {
        let slot = &ss.slot;
        let opens_at = to_absolute(slot.start_time, date, offset_minutes);
        let window = slot.duration();

        let mut offset = 0;
        while offset + BLOCK_MINUTES <= window {
            let starts_at = opens_at + Duration::minutes(offset as i64);
            offset += BLOCK_MINUTES;
            if starts_at < now {
                continue;
            }
            let span = Span::starting_at(starts_at, BLOCK_MINUTES);
            let start_time = slot.start_time.add_minutes(offset - BLOCK_MINUTES);
            let block = blocks.entry(starts_at).or_insert_with(|| AvailableBlock {
                start_time,
                end_time: start_time.add_minutes(BLOCK_MINUTES),
                starts_at,
                price: slot.price,
                max_players: 0,
                booked_count: 0,
                is_full: false,
                available_spots: 0,
            });
            block.max_players += slot.max_players;
            block.booked_count += occupancy(ss, &span);
        }
    }

    blocks
        .into_values()
        .map(|mut b| {
            b.is_full = b.booked_count >= b.max_players;
            b.available_spots = b.max_players.saturating_sub(b.booked_count);
            b
        })
        .collect()
}

/// Absolute start of the hour at `start` inside `slot`'s window opening on
/// `date`, or `None` when the hour doesn't fit the window.
pub fn slot_block_start(
    slot: &Slot,
    date: NaiveDate,
    start: TimeOfDay,
    offset_minutes: i32,
) -> Option<DateTime<Utc>> {
    check_within_window(slot, start, BLOCK_MINUTES).ok()?;
    let into_window = slot.start_time.minutes_until(start) % crate::time::MINUTES_PER_DAY;
    Some(to_absolute(slot.start_time, date, offset_minutes) + Duration::minutes(into_window as i64))
}
