//! Newline-delimited JSON request/response shapes.
//!
//! A request line is one JSON object with an `op` field, an optional
//! `caller`, and the op's own fields at the top level:
//!
//! ```text
//! {"op":"create_online_booking","caller":{"user_id":"01H...","role":"customer"},
//!  "platform":"VR","date":"2026-03-10","start_time":"18:00"}
//! ```
//!
//! Every response line is `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":...,"message":...},"conflict":...}`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{BookingError, ConflictInfo, ErrorKind, ExtendOutcome};
use crate::model::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub caller: Option<Caller>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,

    CreateSlot(NewSlot),
    UpdateSlot(SlotUpdate),
    SetSlotStatus {
        id: Ulid,
        status: SlotStatus,
    },
    DeleteSlot {
        id: Ulid,
    },
    ListSlots {
        #[serde(default)]
        platform: Option<Platform>,
    },
    GetSlot {
        id: Ulid,
    },

    RegisterUser {
        id: Ulid,
        name: String,
        #[serde(default)]
        phone: Option<String>,
    },
    SetMembership {
        user_id: Ulid,
        membership: Membership,
    },
    GetMembership {
        user_id: Ulid,
    },
    DeductHours {
        user_id: Ulid,
        minutes: u32,
    },

    AvailableBlocks {
        date: NaiveDate,
        platform: Platform,
    },
    CreateOfflineBooking(CreateOfflineBooking),
    CreateOnlineBooking(CreateOnlineBooking),
    ExtendBooking(ExtendBooking),
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        #[serde(default)]
        total_price: Option<f64>,
        #[serde(default)]
        payment_method: Option<PaymentMethod>,
    },
    DeleteBooking {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    ListBookings(BookingFilter),
    AuditLog {
        booking_id: Ulid,
    },
    SessionCounts,

    /// Turns the connection into a stream of availability snapshots until
    /// the client sends another line or disconnects.
    WatchAvailability {
        date: NaiveDate,
        platform: Platform,
    },
}

/// Who may issue a request, checked before it reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    /// Any identified caller; the engine or server narrows further.
    Caller,
    Admin,
}

impl Request {
    pub fn access(&self) -> Access {
        match self {
            Request::Ping
            | Request::ListSlots { .. }
            | Request::GetSlot { .. }
            | Request::AvailableBlocks { .. }
            | Request::WatchAvailability { .. } => Access::Public,
            Request::CreateOnlineBooking(_)
            | Request::ExtendBooking(_)
            | Request::GetMembership { .. }
            | Request::GetBooking { .. } => Access::Caller,
            Request::CreateSlot(_)
            | Request::UpdateSlot(_)
            | Request::SetSlotStatus { .. }
            | Request::DeleteSlot { .. }
            | Request::RegisterUser { .. }
            | Request::SetMembership { .. }
            | Request::DeductHours { .. }
            | Request::CreateOfflineBooking(_)
            | Request::UpdateBookingStatus { .. }
            | Request::DeleteBooking { .. }
            | Request::ListBookings(_)
            | Request::AuditLog { .. }
            | Request::SessionCounts => Access::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            ok: true,
            data: Some(serde_json::to_value(data)?),
            error: None,
            conflict: None,
        })
    }

    pub fn empty() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
            conflict: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, conflict: Option<ConflictInfo>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
            conflict,
        }
    }

    pub fn from_error(err: &BookingError) -> Self {
        Self::failure(err.kind(), err.to_string(), err.conflict().cloned())
    }

    pub fn from_extend(outcome: ExtendOutcome) -> Result<Self, ProtocolError> {
        match outcome {
            ExtendOutcome::Extended { booking } => Self::ok(booking),
            ExtendOutcome::Rejected {
                kind,
                error,
                conflict,
            } => Ok(Self::failure(kind, error, conflict)),
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn parse_request(line: &str) -> Result<RequestEnvelope, serde_json::Error> {
    serde_json::from_str(line)
}
