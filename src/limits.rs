//! Hard caps on engine input. Anything past these is rejected with
//! `BookingError::LimitExceeded` before touching state.

pub const MAX_SLOTS: usize = 10_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 100_000;
pub const MAX_USERS: usize = 1_000_000;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_TIER_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// One booking never outlasts a day.
pub const MAX_BOOKING_MINUTES: u32 = 24 * 60;
pub const MAX_EXTENSION_MINUTES: u32 = 12 * 60;

/// UTC-14:00 .. UTC+14:00.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

pub const MAX_PLAYERS: u32 = 64;
pub const MAX_PRICE: f64 = 1_000_000.0;
pub const MAX_SUBSCRIPTION_HOURS: f64 = 10_000.0;

/// Longest request line accepted by the server, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
