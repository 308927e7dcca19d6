use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use rigtime::config::EngineConfig;
use rigtime::engine::Engine;
use rigtime::notify::NotifyHub;
use rigtime::server::{self, ServerContext};
use rigtime::time::ManualClock;

// ── Test infrastructure ──────────────────────────────────────

const DATE: &str = "2026-03-10";

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rigtime_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
    ));
    let engine = Engine::new(
        dir.join("rigtime.wal"),
        Arc::new(NotifyHub::new()),
        clock,
        EngineConfig::default(),
    )
    .unwrap();
    let ctx = Arc::new(ServerContext::new(
        Arc::new(engine),
        Duration::from_secs(300),
        CancellationToken::new(),
    ));
    ctx.cache.spawn_invalidator(ctx.shutdown.child_token());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = server::process_connection(socket, ctx).await;
            });
        }
    });

    addr
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
    caller: Option<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr, caller: Option<Value>) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            lines: Framed::new(socket, LinesCodec::new()),
            caller,
        }
    }

    async fn admin(addr: SocketAddr) -> Self {
        Self::connect(addr, Some(json!({"user_id": Ulid::new(), "role": "admin"}))).await
    }

    async fn customer(addr: SocketAddr, user_id: Ulid) -> Self {
        Self::connect(addr, Some(json!({"user_id": user_id, "role": "customer"}))).await
    }

    async fn send_raw(&mut self, line: &str) {
        self.lines.send(line).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next())
            .await
            .expect("response within timeout")
            .expect("connection open")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, mut request: Value) -> Value {
        if let Some(caller) = &self.caller {
            request["caller"] = caller.clone();
        }
        self.send_raw(&request.to_string()).await;
        self.recv().await
    }
}

/// `data` of a successful response, or the error as `Err`.
fn data(resp: Value) -> Result<Value, Value> {
    if resp["ok"] == true {
        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    } else {
        Err(resp)
    }
}

async fn create_slot(admin: &mut Client, platform: &str, max_players: u32) -> Value {
    assert_ok!(data(
        admin
            .call(json!({
                "op": "create_slot",
                "platform": platform,
                "start_time": "17:00",
                "end_time": "22:00",
                "price": 300.0,
                "max_players": max_players,
            }))
            .await
    ))
}

async fn register(admin: &mut Client, name: &str) -> Ulid {
    let id = Ulid::new();
    assert_ok!(data(
        admin
            .call(json!({"op": "register_user", "id": id, "name": name}))
            .await
    ));
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn ping_and_malformed_lines() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr, None).await;

    let pong = assert_ok!(data(client.call(json!({"op": "ping"})).await));
    assert_eq!(pong, json!("pong"));

    client.send_raw("{not json").await;
    let err = assert_err!(data(client.recv().await));
    assert_eq!(err["error"]["kind"], "validation");

    // The connection survives a bad line.
    assert_ok!(data(client.call(json!({"op": "ping"})).await));
}

#[tokio::test]
async fn admin_books_and_conflicts_name_the_holder() {
    let addr = start_test_server().await;
    let mut admin = Client::admin(addr).await;
    let slot = create_slot(&mut admin, "CONSOLE", 1).await;
    let holder = register(&mut admin, "Zoya").await;

    let booked = assert_ok!(data(
        admin
            .call(json!({
                "op": "create_offline_booking",
                "slot_id": slot["id"],
                "user_id": holder,
                "start_time": "18:00",
                "duration": 60,
            }))
            .await
    ));
    assert_eq!(booked["booking"]["start_time"], "18:00");
    assert_eq!(booked["booking"]["status"], "Upcoming");
    assert_eq!(booked["user"]["name"], "Zoya");

    let resp = admin
        .call(json!({
            "op": "create_offline_booking",
            "slot_id": slot["id"],
            "start_time": "18:30",
            "duration": 60,
        }))
        .await;
    let err = assert_err!(data(resp));
    assert_eq!(err["error"]["kind"], "conflict");
    assert_eq!(err["error"]["message"], "time already booked by Zoya");
    assert_eq!(err["conflict"]["booking_id"], booked["booking"]["id"]);
}

#[tokio::test]
async fn customer_booking_flow_and_quota_rejection() {
    let addr = start_test_server().await;
    let mut admin = Client::admin(addr).await;
    create_slot(&mut admin, "VR", 1).await;
    let member = register(&mut admin, "Ishan").await;
    assert_ok!(data(
        admin
            .call(json!({
                "op": "set_membership",
                "user_id": member,
                "membership": {
                    "is_subscriber": true,
                    "tier": "weekend",
                    "total_hours": 2.0,
                    "utilized_hours": 0.5,
                    "expires_at": null,
                },
            }))
            .await
    ));

    let mut customer = Client::customer(addr, member).await;
    let booked = assert_ok!(data(
        customer
            .call(json!({
                "op": "create_online_booking",
                "platform": "VR",
                "date": DATE,
                "start_time": "6:00 PM",
            }))
            .await
    ));
    assert_eq!(booked["booking"]["payment_method"], "SUBSCRIPTION");
    assert_eq!(booked["membership"]["utilized_hours"], 1.5);
    let booking_id = booked["booking"]["id"].clone();

    let mine = assert_ok!(data(
        customer
            .call(json!({"op": "get_booking", "id": booking_id}))
            .await
    ));
    assert_eq!(mine["booking"]["id"], booking_id);

    let mut stranger = Client::customer(addr, Ulid::new()).await;
    let err = assert_err!(data(
        stranger
            .call(json!({"op": "get_booking", "id": booking_id}))
            .await
    ));
    assert_eq!(err["error"]["kind"], "authorization");

    // Customers cannot extend; admins get a quota rejection as a value.
    let extend = json!({
        "op": "extend_booking",
        "booking_id": booking_id,
        "minutes": 60,
        "payment_method": "SUBSCRIPTION_HOURS",
    });
    let err = assert_err!(data(customer.call(extend.clone()).await));
    assert_eq!(err["error"]["kind"], "authorization");
    let err = assert_err!(data(admin.call(extend).await));
    assert_eq!(err["error"]["kind"], "quota_exceeded");

    let membership = assert_ok!(data(
        customer
            .call(json!({"op": "get_membership", "user_id": member}))
            .await
    ));
    assert_eq!(membership["utilized_hours"], 1.5);

    let extended = assert_ok!(data(
        admin
            .call(json!({
                "op": "extend_booking",
                "booking_id": booking_id,
                "minutes": 30,
                "payment_method": "SUBSCRIPTION_HOURS",
                "reason": "late start",
            }))
            .await
    ));
    assert_eq!(extended["duration"], 90);
    assert_eq!(extended["is_admin_extended"], true);

    // The cached view follows the extension.
    let mine = assert_ok!(data(
        customer
            .call(json!({"op": "get_booking", "id": booking_id}))
            .await
    ));
    assert_eq!(mine["booking"]["duration"], 90);

    let log = assert_ok!(data(
        admin
            .call(json!({"op": "audit_log", "booking_id": booking_id}))
            .await
    ));
    assert_eq!(log.as_array().unwrap().len(), 1);
    assert_eq!(log[0]["reason"], "late start");
}

#[tokio::test]
async fn uncovered_time_reports_no_slot() {
    let addr = start_test_server().await;
    let mut admin = Client::admin(addr).await;
    create_slot(&mut admin, "RACING_SIM", 2).await;
    let who = register(&mut admin, "Farah").await;

    let mut customer = Client::customer(addr, who).await;
    let err = assert_err!(data(
        customer
            .call(json!({
                "op": "create_online_booking",
                "platform": "RACING_SIM",
                "date": DATE,
                "start_time": "10:00",
            }))
            .await
    ));
    assert_eq!(err["error"]["message"], "No available slots found for this time.");

    let blocks = assert_ok!(data(
        customer
            .call(json!({"op": "available_blocks", "platform": "RACING_SIM", "date": DATE}))
            .await
    ));
    assert_eq!(blocks.as_array().unwrap().len(), 5);
    assert_eq!(blocks[0]["start_time"], "17:00");
    assert_eq!(blocks[0]["available_spots"], 2);
}

#[tokio::test]
async fn admin_ops_need_an_admin() {
    let addr = start_test_server().await;
    let mut anonymous = Client::connect(addr, None).await;
    let err = assert_err!(data(
        anonymous
            .call(json!({"op": "list_bookings"}))
            .await
    ));
    assert_eq!(err["error"]["kind"], "authorization");

    let mut customer = Client::customer(addr, Ulid::new()).await;
    let err = assert_err!(data(
        customer
            .call(json!({"op": "delete_slot", "id": Ulid::new()}))
            .await
    ));
    assert_eq!(err["error"]["kind"], "authorization");

    let slots = assert_ok!(data(anonymous.call(json!({"op": "list_slots"})).await));
    assert_eq!(slots, json!([]));
}

#[tokio::test]
async fn watch_streams_snapshots_until_next_request() {
    let addr = start_test_server().await;
    let mut admin = Client::admin(addr).await;
    let slot = create_slot(&mut admin, "VR", 1).await;

    let mut watcher = Client::connect(addr, None).await;
    let first = assert_ok!(data(
        watcher
            .call(json!({"op": "watch_availability", "platform": "VR", "date": DATE}))
            .await
    ));
    assert_eq!(first.as_array().unwrap().len(), 5);

    assert_ok!(data(
        admin
            .call(json!({
                "op": "create_offline_booking",
                "slot_id": slot["id"],
                "start_time": "19:00",
                "duration": 60,
            }))
            .await
    ));

    let update = assert_ok!(data(watcher.recv().await));
    let starts: Vec<_> = update
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["start_time"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(starts, vec!["17:00", "18:00", "20:00", "21:00"]);

    // Any new line ends the stream and is answered normally.
    watcher.send_raw(r#"{"op":"ping"}"#).await;
    loop {
        let resp = watcher.recv().await;
        if resp["data"] == "pong" {
            break;
        }
        assert!(resp["data"].is_array(), "unexpected response {resp}");
    }
}
