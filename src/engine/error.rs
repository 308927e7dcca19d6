use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::UserProfile;
use crate::time::{TimeOfDay, TimeParseError};

/// The booking a proposed interval collided with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub booking_id: Ulid,
    /// `None` when the holder is a guest.
    pub user: Option<UserProfile>,
}

impl ConflictInfo {
    pub fn holder_name(&self) -> &str {
        self.user.as_ref().map_or("guest", |u| u.name.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(
        "{start} + {duration}min falls outside the slot window {window_start}-{window_end}"
    )]
    OutOfBounds {
        start: TimeOfDay,
        duration: u32,
        window_start: TimeOfDay,
        window_end: TimeOfDay,
    },
    #[error("time already booked by {}", .0.holder_name())]
    Conflict(ConflictInfo),
    #[error("insufficient subscription hours: {available:.2}h left, {required:.2}h needed")]
    QuotaExceeded { available: f64, required: f64 },
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("No available slots found for this time.")]
    NoSlotAvailable,
    #[error("all slots for this time are full")]
    SlotsFull,
    #[error("slot {0} still has upcoming bookings")]
    HasBookings(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    QuotaExceeded,
    Authorization,
    Persistence,
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::NotFound(_)
            | BookingError::Validation(_)
            | BookingError::OutOfBounds { .. }
            | BookingError::NoSlotAvailable
            | BookingError::SlotsFull
            | BookingError::HasBookings(_)
            | BookingError::LimitExceeded(_) => ErrorKind::Validation,
            BookingError::Conflict(_) => ErrorKind::Conflict,
            BookingError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            BookingError::Unauthorized(_) => ErrorKind::Authorization,
            BookingError::WalError(_) => ErrorKind::Persistence,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            BookingError::Conflict(info) => Some(info),
            _ => None,
        }
    }
}

impl From<TimeParseError> for BookingError {
    fn from(e: TimeParseError) -> Self {
        BookingError::Validation(e.to_string())
    }
}
