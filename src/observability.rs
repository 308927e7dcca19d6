use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "rigtime_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "rigtime_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings committed. Labels: source, forced.
pub const BOOKINGS_CREATED_TOTAL: &str = "rigtime_bookings_created_total";

/// Counter: proposals refused for overlapping an upcoming booking. Labels: op.
pub const CONFLICTS_TOTAL: &str = "rigtime_conflicts_total";

/// Counter: extensions committed. Labels: forced.
pub const EXTENSIONS_TOTAL: &str = "rigtime_extensions_total";

/// Counter: writes refused for lack of subscription hours.
pub const QUOTA_REJECTIONS_TOTAL: &str = "rigtime_quota_rejections_total";

/// Histogram: availability aggregation time in seconds. Labels: platform.
pub const AVAILABILITY_DURATION_SECONDS: &str = "rigtime_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rigtime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rigtime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rigtime_connections_rejected_total";

/// Gauge: availability watches currently streaming.
pub const WATCHES_ACTIVE: &str = "rigtime_watches_active";

/// Gauge: upcoming bookings by phase. Labels: phase.
pub const SESSIONS: &str = "rigtime_sessions";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rigtime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rigtime_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "rigtime_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used on every request metric.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Ping => "ping",
        Request::CreateSlot(_) => "create_slot",
        Request::UpdateSlot(_) => "update_slot",
        Request::SetSlotStatus { .. } => "set_slot_status",
        Request::DeleteSlot { .. } => "delete_slot",
        Request::ListSlots { .. } => "list_slots",
        Request::GetSlot { .. } => "get_slot",
        Request::RegisterUser { .. } => "register_user",
        Request::SetMembership { .. } => "set_membership",
        Request::GetMembership { .. } => "get_membership",
        Request::DeductHours { .. } => "deduct_hours",
        Request::AvailableBlocks { .. } => "available_blocks",
        Request::CreateOfflineBooking(_) => "create_offline_booking",
        Request::CreateOnlineBooking(_) => "create_online_booking",
        Request::ExtendBooking(_) => "extend_booking",
        Request::UpdateBookingStatus { .. } => "update_booking_status",
        Request::DeleteBooking { .. } => "delete_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings(_) => "list_bookings",
        Request::AuditLog { .. } => "audit_log",
        Request::SessionCounts => "session_counts",
        Request::WatchAvailability { .. } => "watch_availability",
    }
}
