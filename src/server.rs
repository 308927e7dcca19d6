//! JSON-lines connection handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::BookingCache;
use crate::engine::{BookingError, Engine, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::{Caller, Platform};
use crate::observability::request_label;
use crate::protocol::{Access, ProtocolError, Request, RequestEnvelope, Response, parse_request};
use crate::watch::watch_availability;

type Lines = Framed<TcpStream, LinesCodec>;

/// Everything a connection needs, shared across connections.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub cache: Arc<BookingCache>,
    pub watch_reconcile: Duration,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(engine: Arc<Engine>, watch_reconcile: Duration, shutdown: CancellationToken) -> Self {
        let cache = Arc::new(BookingCache::new(engine.clone()));
        Self {
            engine,
            cache,
            watch_reconcile,
            shutdown,
        }
    }
}

enum WatchEnd {
    /// The client sent another request while streaming.
    Next(String),
    Closed,
}

pub async fn process_connection(socket: TcpStream, ctx: Arc<ServerContext>) -> Result<(), ProtocolError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut pending: Option<String> = None;

    loop {
        let line = match pending.take() {
            Some(line) => line,
            None => {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    next = lines.next() => match next {
                        None => break,
                        Some(Ok(line)) => line,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            let resp = Response::failure(
                                ErrorKind::Validation,
                                "request line too long",
                                None,
                            );
                            lines.send(resp.to_line()?).await?;
                            continue;
                        }
                        Some(Err(e)) => return Err(e.into()),
                    },
                }
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match parse_request(&line) {
            Ok(env) => env,
            Err(e) => {
                debug!("malformed request: {e}");
                let resp = Response::failure(ErrorKind::Validation, format!("malformed request: {e}"), None);
                lines.send(resp.to_line()?).await?;
                continue;
            }
        };

        if let Request::WatchAvailability { date, platform } = envelope.request {
            metrics::counter!(
                crate::observability::REQUESTS_TOTAL,
                "op" => "watch_availability",
                "status" => "ok"
            )
            .increment(1);
            match stream_availability(&mut lines, &ctx, date, platform).await? {
                WatchEnd::Next(line) => pending = Some(line),
                WatchEnd::Closed => break,
            }
            continue;
        }

        let resp = handle_request(&ctx, envelope).await?;
        lines.send(resp.to_line()?).await?;
    }
    Ok(())
}

/// Push a snapshot now and after every change until the client speaks or
/// goes away.
async fn stream_availability(
    lines: &mut Lines,
    ctx: &ServerContext,
    date: NaiveDate,
    platform: Platform,
) -> Result<WatchEnd, ProtocolError> {
    let watch = watch_availability(
        ctx.engine.clone(),
        date,
        platform,
        ctx.watch_reconcile,
        ctx.shutdown.child_token(),
    )
    .await;
    let mut rx = watch.rx.clone();

    let first = {
        let blocks = rx.borrow_and_update();
        Response::ok(&*blocks)?.to_line()?
    };
    lines.send(first).await?;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(WatchEnd::Closed);
                }
                let line = {
                    let blocks = rx.borrow_and_update();
                    Response::ok(&*blocks)?.to_line()?
                };
                lines.send(line).await?;
            }
            next = lines.next() => match next {
                None => return Ok(WatchEnd::Closed),
                Some(Ok(line)) => return Ok(WatchEnd::Next(line)),
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

/// Authorize, dispatch and record one request.
pub async fn handle_request(ctx: &ServerContext, envelope: RequestEnvelope) -> Result<Response, ProtocolError> {
    let op = request_label(&envelope.request);
    let started = Instant::now();

    let resp = match authorize(&envelope.request, envelope.caller.as_ref()) {
        Ok(()) => dispatch(ctx, envelope.caller, envelope.request).await?,
        Err(e) => Response::from_error(&e),
    };

    let status = match &resp.error {
        None => "ok",
        Some(err) => kind_label(err.kind),
    };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    Ok(resp)
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Conflict => "conflict",
        ErrorKind::QuotaExceeded => "quota_exceeded",
        ErrorKind::Authorization => "authorization",
        ErrorKind::Persistence => "persistence",
    }
}

fn authorize(request: &Request, caller: Option<&Caller>) -> Result<(), BookingError> {
    match (request.access(), caller) {
        (Access::Public, _) => Ok(()),
        (Access::Caller, Some(_)) => Ok(()),
        (Access::Admin, Some(c)) if c.is_admin() => Ok(()),
        (Access::Admin, Some(_)) => Err(BookingError::Unauthorized("admin only")),
        (_, None) => Err(BookingError::Unauthorized("caller identity required")),
    }
}

fn no_caller() -> Response {
    Response::from_error(&BookingError::Unauthorized("caller identity required"))
}

fn reply<T: Serialize>(result: Result<T, BookingError>) -> Result<Response, ProtocolError> {
    match result {
        Ok(value) => Response::ok(value),
        Err(e) => Ok(Response::from_error(&e)),
    }
}

async fn dispatch(
    ctx: &ServerContext,
    caller: Option<Caller>,
    request: Request,
) -> Result<Response, ProtocolError> {
    let engine = &ctx.engine;

    match request {
        Request::Ping => Response::ok("pong"),

        Request::CreateSlot(new) => reply(engine.create_slot(new).await),
        Request::UpdateSlot(update) => reply(engine.update_slot(update).await),
        Request::SetSlotStatus { id, status } => reply(engine.set_slot_status(id, status).await),
        Request::DeleteSlot { id } => match engine.delete_slot(id).await {
            Ok(()) => Ok(Response::empty()),
            Err(e) => Ok(Response::from_error(&e)),
        },
        Request::ListSlots { platform } => Response::ok(engine.list_slots(platform).await),
        Request::GetSlot { id } => reply(engine.get_slot(&id).await.ok_or(BookingError::NotFound(id))),

        Request::RegisterUser { id, name, phone } => reply(engine.register_user(id, name, phone).await),
        Request::SetMembership { user_id, membership } => {
            reply(engine.set_membership(user_id, membership).await)
        }
        Request::GetMembership { user_id } => {
            let Some(caller) = caller else {
                return Ok(no_caller());
            };
            if !caller.is_admin() && caller.user_id != user_id {
                return Ok(Response::from_error(&BookingError::Unauthorized(
                    "cannot read another user's membership",
                )));
            }
            reply(
                engine
                    .get_membership(&user_id)
                    .await
                    .ok_or(BookingError::NotFound(user_id)),
            )
        }
        Request::DeductHours { user_id, minutes } => reply(engine.deduct_hours(user_id, minutes).await),

        Request::AvailableBlocks { date, platform } => {
            Response::ok(engine.available_blocks(date, platform).await)
        }
        Request::CreateOfflineBooking(req) => reply(engine.create_offline_booking(req).await),
        Request::CreateOnlineBooking(req) => {
            let Some(caller) = caller else {
                return Ok(no_caller());
            };
            reply(engine.create_online_booking(&caller, req).await)
        }
        Request::ExtendBooking(req) => {
            let Some(caller) = caller else {
                return Ok(no_caller());
            };
            let id = req.booking_id;
            match engine.extend_booking(&caller, req).await {
                Ok(outcome) => {
                    if outcome.is_extended() {
                        ctx.cache.forget(&id);
                    }
                    Response::from_extend(outcome)
                }
                Err(e) => Ok(Response::from_error(&e)),
            }
        }
        Request::UpdateBookingStatus {
            id,
            status,
            total_price,
            payment_method,
        } => {
            let result = engine
                .update_booking_status(id, status, total_price, payment_method)
                .await;
            ctx.cache.forget(&id);
            reply(result)
        }
        Request::DeleteBooking { id } => {
            let result = engine.delete_booking(id).await;
            ctx.cache.forget(&id);
            reply(result)
        }
        Request::GetBooking { id } => {
            let Some(caller) = caller else {
                return Ok(no_caller());
            };
            match ctx.cache.get(id).await {
                Ok(details)
                    if caller.is_admin() || details.booking.user_id == Some(caller.user_id) =>
                {
                    Response::ok(details)
                }
                Ok(_) => Ok(Response::from_error(&BookingError::Unauthorized(
                    "cannot read another user's booking",
                ))),
                Err(e) => Ok(Response::from_error(&e)),
            }
        }
        Request::ListBookings(filter) => Response::ok(engine.list_bookings(&filter).await),
        Request::AuditLog { booking_id } => Response::ok(engine.audit_log(&booking_id)),
        Request::SessionCounts => Response::ok(engine.session_counts().await),

        Request::WatchAvailability { .. } => Ok(Response::failure(
            ErrorKind::Validation,
            "watch_availability is only available as a streaming request",
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notify::NotifyHub;
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rigtime_test_server");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn context(name: &str) -> ServerContext {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
        ));
        let engine = Engine::new(
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            clock,
            EngineConfig::default(),
        )
        .unwrap();
        ServerContext::new(Arc::new(engine), Duration::from_secs(300), CancellationToken::new())
    }

    async fn call(ctx: &ServerContext, line: &str) -> Response {
        handle_request(ctx, parse_request(line).unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn public_requests_need_no_caller() {
        let ctx = context("public.wal");
        let resp = call(&ctx, r#"{"op":"ping"}"#).await;
        assert!(resp.ok);
        assert_eq!(resp.data, Some(serde_json::json!("pong")));

        let resp = call(&ctx, r#"{"op":"list_slots","platform":"VR"}"#).await;
        assert_eq!(resp.data, Some(serde_json::json!([])));
    }

    #[tokio::test]
    async fn admin_requests_reject_customers() {
        let ctx = context("admin_only.wal");
        let customer = Ulid::new();
        let line = format!(
            r#"{{"op":"create_slot","caller":{{"user_id":"{customer}","role":"customer"}},"platform":"VR","start_time":"10:00","end_time":"12:00","price":100,"max_players":1}}"#
        );
        let resp = call(&ctx, &line).await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().kind, ErrorKind::Authorization);

        let anonymous = call(&ctx, r#"{"op":"session_counts"}"#).await;
        assert_eq!(anonymous.error.unwrap().kind, ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn membership_is_private_to_its_holder() {
        let ctx = context("membership_private.wal");
        let owner = Ulid::new();
        let other = Ulid::new();
        ctx.engine.register_user(owner, "Kiran".into(), None).await.unwrap();
        ctx.engine
            .set_membership(
                owner,
                crate::model::Membership {
                    is_subscriber: true,
                    tier: Some("gold".into()),
                    total_hours: 10.0,
                    utilized_hours: 2.0,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        let own = format!(
            r#"{{"op":"get_membership","caller":{{"user_id":"{owner}","role":"customer"}},"user_id":"{owner}"}}"#
        );
        let resp = call(&ctx, &own).await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["utilized_hours"], 2.0);

        let foreign = format!(
            r#"{{"op":"get_membership","caller":{{"user_id":"{other}","role":"customer"}},"user_id":"{owner}"}}"#
        );
        let resp = call(&ctx, &foreign).await;
        assert_eq!(resp.error.unwrap().kind, ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn booking_errors_map_to_kinds() {
        let ctx = context("error_kinds.wal");
        let admin = Ulid::new();
        let missing = Ulid::new();
        let line = format!(
            r#"{{"op":"delete_booking","caller":{{"user_id":"{admin}","role":"admin"}},"id":"{missing}"}}"#
        );
        let resp = call(&ctx, &line).await;
        assert!(!resp.ok);
        let err = resp.error.unwrap();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains(&missing.to_string()));
    }
}
