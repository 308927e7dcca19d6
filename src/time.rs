//! Wall-clock parsing and anchoring of wall-clock times to absolute instants.
//!
//! Offsets follow the browser convention: minutes such that
//! `UTC = local + offset`, so UTC+05:30 is `-330`.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// A naively-anchored start more than this far behind "now" is taken to mean
/// tomorrow. Callers rely on the exact value.
pub const ROLLOVER_THRESHOLD_HOURS: i64 = 12;

/// Minutes since midnight, always `< 1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized time of day: {input:?} (expected HH:MM or hh:mm AM/PM)")]
pub struct TimeParseError {
    pub input: String,
}

/// How incoming time strings are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Reject anything that is not `HH:MM` or `hh:mm AM/PM`.
    #[default]
    Strict,
    /// Legacy behaviour: strip to digits and colons, never fail, fall back to midnight.
    Lenient,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| TimeOfDay((hour * 60 + minute) as u16))
    }

    /// Wraps modulo one day.
    pub fn from_minutes(minutes: u32) -> Self {
        TimeOfDay((minutes % MINUTES_PER_DAY) as u16)
    }

    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    pub fn add_minutes(self, minutes: u32) -> Self {
        Self::from_minutes(self.minutes() + minutes % MINUTES_PER_DAY)
    }

    /// Forward distance to `end`, wrapping past midnight. Equal times mean a full day.
    pub fn minutes_until(self, end: TimeOfDay) -> u32 {
        if end > self {
            end.minutes() - self.minutes()
        } else {
            end.minutes() + MINUTES_PER_DAY - self.minutes()
        }
    }

    pub fn of(dt: NaiveDateTime) -> Self {
        TimeOfDay((dt.hour() * 60 + dt.minute()) as u16)
    }

    pub fn parse_with(input: &str, mode: ParseMode) -> Result<Self, TimeParseError> {
        match mode {
            ParseMode::Strict => Self::parse(input),
            ParseMode::Lenient => Ok(Self::parse_lenient(input)),
        }
    }

    /// Accepts `HH:MM` (24h) and `hh:mm AM/PM` (12h, any case, optional space).
    pub fn parse(input: &str) -> Result<Self, TimeParseError> {
        let err = || TimeParseError {
            input: input.to_string(),
        };
        let (clock, meridiem) = split_meridiem(input.trim());
        let (h, m) = clock.split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        if !h.bytes().all(|b| b.is_ascii_digit()) || !m.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let hour: u32 = h.parse().map_err(|_| err())?;
        let minute: u32 = m.parse().map_err(|_| err())?;
        let hour = match meridiem {
            None => hour,
            Some(_) if hour == 0 || hour > 12 => return Err(err()),
            Some(Meridiem::Am) => hour % 12,
            Some(Meridiem::Pm) => hour % 12 + 12,
        };
        Self::new(hour, minute).ok_or_else(err)
    }

    /// Never fails. Unrecognized characters are dropped and the remainder
    /// reparsed; with no usable digits the result is midnight.
    pub fn parse_lenient(input: &str) -> Self {
        if let Ok(t) = Self::parse(input) {
            return t;
        }
        let (_, meridiem) = split_meridiem(input.trim());
        let cleaned: String = input
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == ':')
            .collect();
        let number = |s: &str| s.parse::<u32>().unwrap_or(0);
        let (mut hour, minute) = match cleaned.split_once(':') {
            Some((h, rest)) => {
                let m: String = rest.chars().filter(|c| c.is_ascii_digit()).take(2).collect();
                (number(h), number(&m))
            }
            None if cleaned.len() > 2 => {
                let split = cleaned.len() - 2;
                (number(&cleaned[..split]), number(&cleaned[split..]))
            }
            None => (number(&cleaned), 0),
        };
        match meridiem {
            Some(Meridiem::Pm) if hour < 12 => hour += 12,
            Some(Meridiem::Am) if hour == 12 => hour = 0,
            _ => {}
        }
        Self::from_minutes(hour.saturating_mul(60).saturating_add(minute))
    }
}

fn split_meridiem(s: &str) -> (&str, Option<Meridiem>) {
    let upper = s.to_ascii_uppercase();
    if upper.ends_with("AM") {
        (s[..s.len() - 2].trim_end(), Some(Meridiem::Am))
    } else if upper.ends_with("PM") {
        (s[..s.len() - 2].trim_end(), Some(Meridiem::Pm))
    } else {
        (s, None)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

// ── Clock ────────────────────────────────────────────────────────

/// Source of "now" for the engine.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Anchoring ────────────────────────────────────────────────────

/// Wall clock at `offset_minutes` for the absolute instant `now`.
pub fn local_datetime(now: DateTime<Utc>, offset_minutes: i32) -> NaiveDateTime {
    (now - Duration::minutes(offset_minutes as i64)).naive_utc()
}

/// "Today" in the caller's locale, not the server's.
pub fn caller_today(now: DateTime<Utc>, offset_minutes: i32) -> NaiveDate {
    local_datetime(now, offset_minutes).date()
}

/// Picks the start time of a new booking: an explicit string wins, then the
/// current wall clock for walk-ins, then the slot's own opening time.
pub fn resolve_start(
    explicit: Option<&str>,
    fallback: TimeOfDay,
    immediate: bool,
    now: DateTime<Utc>,
    offset_minutes: i32,
    mode: ParseMode,
) -> Result<TimeOfDay, TimeParseError> {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => TimeOfDay::parse_with(s, mode),
        None if immediate => Ok(TimeOfDay::of(local_datetime(now, offset_minutes))),
        None => Ok(fallback),
    }
}

/// `UTC = local + offset` applied to `time` on `date`.
pub fn to_absolute(time: TimeOfDay, date: NaiveDate, offset_minutes: i32) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::default()) + Duration::minutes(time.minutes() as i64);
    (local + Duration::minutes(offset_minutes as i64)).and_utc()
}

/// Moves `instant` to the next day when it lies more than
/// [`ROLLOVER_THRESHOLD_HOURS`] behind `now`.
pub fn apply_rollover(instant: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now - instant > Duration::hours(ROLLOVER_THRESHOLD_HOURS) {
        instant + Duration::days(1)
    } else {
        instant
    }
}

/// Anchors a wall-clock start to the caller's today, rolling past midnight
/// when the naive reading lands too far in the past.
pub fn anchor(time: TimeOfDay, now: DateTime<Utc>, offset_minutes: i32) -> DateTime<Utc> {
    let naive = to_absolute(time, caller_today(now, offset_minutes), offset_minutes);
    apply_rollover(naive, now)
}
