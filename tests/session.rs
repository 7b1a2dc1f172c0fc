//! End-to-end sessions against a scripted DDP server on localhost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rocket_bot::auth::password_digest;
use rocket_bot::responder::{EchoResponder, Responder};
use rocket_bot::{Connection, ConnectionState, RocketChatConfig, RocketError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

type Handler = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

struct MockServer {
    port: u16,
    seen: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<WsMessage>,
}

impl MockServer {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            let socket = loop {
                let (tcp, _) = listener.accept().await.unwrap();
                if let Ok(socket) = tokio_tungstenite::accept_async(tcp).await {
                    break socket;
                }
            };
            // REST lookups land on the same port; refuse them.
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    drop(tcp);
                }
            });

            let (mut sink, mut stream) = socket.split();
            loop {
                tokio::select! {
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                            for reply in handler(&frame) {
                                if sink.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                                    return;
                                }
                            }
                            let _ = seen_tx.send(frame);
                        }
                        Some(Ok(_)) => {}
                        _ => return,
                    },
                    out = push_rx.recv() => match out {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });

        MockServer { port, seen, push }
    }

    fn push(&self, frame: Value) {
        self.push.send(WsMessage::Text(frame.to_string().into())).unwrap();
    }

    fn settings(&self) -> RocketChatConfig {
        RocketChatConfig {
            host_name: "127.0.0.1".into(),
            port: self.port,
            ssl: false,
            user: "bot".into(),
            password: "hunter2".into(),
            ..RocketChatConfig::default()
        }
    }

    /// Waits for the first client frame matching `pred`.
    async fn expect(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.seen.recv().await.expect("server still running");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("frame arrived in time")
    }
}

fn result(frame: &Value, result: Value) -> Vec<Value> {
    vec![json!({ "msg": "result", "id": frame["id"], "result": result })]
}

/// A small Rocket.Chat: two rooms, one method that fails and one that never answers.
fn rocket_chat() -> Handler {
    rocket_chat_with(json!([
        { "rid": "GENERAL", "name": "general" },
        { "rid": "dm-alice", "name": "alice" },
    ]))
}

/// Same server, listing `subscriptions` from `subscriptions/get`.
fn rocket_chat_with(subscriptions: Value) -> Handler {
    Arc::new(move |frame| match frame["msg"].as_str() {
        Some("connect") => vec![json!({ "msg": "connected", "session": "session-1" })],
        Some("sub") => vec![json!({ "msg": "ready", "subs": [frame["id"]] })],
        Some("method") => match frame["method"].as_str().unwrap_or_default() {
            "login" => result(frame, json!({ "id": "bot-id", "token": "bot-token" })),
            "subscriptions/get" => result(frame, json!({ "update": subscriptions })),
            "rooms/get" => result(
                frame,
                json!([
                    { "_id": "GENERAL", "fname": "general" },
                    { "_id": "dm-alice", "fname": "alice" },
                ]),
            ),
            "sendMessage" => {
                let params = &frame["params"][0];
                result(
                    frame,
                    json!({
                        "_id": format!("sent-{}", frame["id"].as_str().unwrap_or_default()),
                        "rid": params["rid"],
                        "msg": params["msg"],
                        "u": { "_id": "bot-id", "username": "bot" },
                    }),
                )
            }
            "boom" => vec![json!({
                "msg": "result",
                "id": frame["id"],
                "error": { "error": 403, "errorType": "Meteor.Error", "reason": "not allowed" },
            })],
            "hang" => Vec::new(),
            _ => vec![json!({ "msg": "result", "id": frame["id"] })],
        },
        _ => Vec::new(),
    })
}

fn room_message(id: &str, rid: &str, author: (&str, &str), text: &str, ts_ms: i64) -> Value {
    json!({
        "msg": "changed",
        "collection": "stream-room-messages",
        "id": "id",
        "fields": {
            "eventName": rid,
            "args": [{
                "_id": id,
                "rid": rid,
                "msg": text,
                "ts": { "$date": ts_ms },
                "u": { "_id": author.0, "username": author.1 },
            }],
        },
    })
}

fn many_rooms(count: usize, padding: usize) -> Value {
    (0..count)
        .map(|n| json!({ "rid": format!("room-{n}"), "name": format!("room-{n}-{}", "x".repeat(padding)) }))
        .collect()
}

async fn connect(server: &MockServer) -> Connection {
    tokio::time::timeout(WAIT, Connection::connect(&server.settings()))
        .await
        .expect("connected in time")
        .expect("connect succeeds")
}

#[tokio::test]
async fn login_sends_hashed_password_and_goes_active() {
    let mut server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    let handshake = server.expect(|f| f["msg"] == "connect").await;
    assert_eq!(handshake["version"], "1");

    let login = server.expect(|f| f["method"] == "login").await;
    let params = &login["params"][0];
    assert_eq!(params["user"]["username"], "bot");
    assert_eq!(params["password"]["algorithm"], "sha-256");
    assert_eq!(params["password"]["digest"], password_digest("hunter2"));

    assert_eq!(connection.state(), ConnectionState::Active);
    assert_eq!(connection.session_id(), "session-1");
    assert_eq!(connection.user_id(), "bot-id");
    assert_eq!(connection.username(), "bot");
    assert_eq!(connection.auth_token(), "bot-token");
}

#[tokio::test]
async fn subscribes_to_user_feed_and_every_listed_room() {
    let mut server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    let feed = server.expect(|f| f["name"] == "stream-notify-user").await;
    assert_eq!(feed["params"][0], "bot-id/subscriptions-changed");

    let mut rooms = Vec::new();
    for _ in 0..2 {
        let sub = server.expect(|f| f["name"] == "stream-room-messages").await;
        rooms.push(sub["params"][0].as_str().unwrap().to_string());
    }
    rooms.sort();
    assert_eq!(rooms, ["GENERAL", "dm-alice"]);

    let directory = connection.rooms().await.unwrap();
    assert_eq!(directory.name_of("GENERAL"), Some("general"));
    assert_eq!(directory.id_of("alice"), Some("dm-alice"));

    server.push(json!({
        "msg": "changed",
        "collection": "stream-notify-user",
        "id": "id",
        "fields": {
            "eventName": "bot-id/subscriptions-changed",
            "args": ["inserted", { "rid": "RANDOM", "name": "random" }],
        },
    }));
    let sub = server
        .expect(|f| f["name"] == "stream-room-messages" && f["params"][0] == "RANDOM")
        .await;
    assert_eq!(sub["params"][1], false);
    assert_eq!(connection.rooms().await.unwrap().name_of("RANDOM"), Some("random"));
}

#[tokio::test]
async fn pushed_messages_are_classified_and_split_by_freshness() {
    let server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;
    let later = Utc::now().timestamp_millis() + 60_000;

    server.push(room_message("old", "GENERAL", ("alice-id", "alice"), "from before", 1_000));
    server.push(room_message("m1", "GENERAL", ("alice-id", "alice"), "@bot hello there", later));
    server.push(room_message("m2", "dm-alice", ("alice-id", "alice"), "psst", later + 1));
    server.push(room_message("mine", "GENERAL", ("bot-id", "bot"), "talking", later + 2));

    let pinged = tokio::time::timeout(WAIT, connection.next_fresh_message()).await.unwrap().unwrap();
    assert_eq!(pinged.id, "m1");
    assert_eq!(pinged.room_name, "general");
    assert!(pinged.is_new && pinged.am_i_pinged && pinged.is_mentioned);
    assert_eq!(pinged.text_without_ping(), "hello there");

    let direct = tokio::time::timeout(WAIT, connection.next_fresh_message()).await.unwrap().unwrap();
    assert_eq!(direct.id, "m2");
    assert!(direct.is_direct);

    let old = tokio::time::timeout(WAIT, connection.next_message()).await.unwrap().unwrap();
    assert_eq!(old.id, "old");
    assert!(!old.is_new);

    let mine = tokio::time::timeout(WAIT, connection.next_message()).await.unwrap().unwrap();
    assert_eq!(mine.id, "mine");
    assert!(mine.is_self);

    let stats = connection.stats().await;
    assert_eq!(stats.fresh_dropped + stats.general_dropped, 0);
    assert_eq!(stats.fresh_queued + stats.general_queued, 0);
}

#[tokio::test]
async fn method_errors_surface_with_their_code() {
    let server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    match connection.call("boom", Vec::new()).await {
        Err(RocketError::Method { code, error_type, reason }) => {
            assert_eq!(code, "403");
            assert_eq!(error_type, "Meteor.Error");
            assert_eq!(reason.as_deref(), Some("not allowed"));
        }
        other => panic!("expected a method error, got {other:?}"),
    }
    // The connection survives a failed call.
    assert!(connection.call("ping", Vec::new()).await.is_ok());
}

#[tokio::test]
async fn server_ping_is_answered_with_pong() {
    let mut server = MockServer::start(rocket_chat()).await;
    let _connection = connect(&server).await;

    server.push(json!({ "msg": "ping", "id": "keepalive-7" }));
    let pong = server.expect(|f| f["msg"] == "pong").await;
    assert_eq!(pong["id"], "keepalive-7");
}

#[tokio::test]
async fn unanswered_call_times_out_and_is_forgotten() {
    let server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    let outcome = connection
        .call_with_timeout("hang", Vec::new(), Duration::from_millis(100))
        .await;
    assert!(matches!(outcome, Err(RocketError::Timeout(_))));
    assert_eq!(connection.stats().await.pending_calls, 0);
}

#[tokio::test]
async fn server_close_wakes_every_pending_call() {
    let server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    let pending: Vec<_> = (0..8)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("hang", Vec::new()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.push.send(WsMessage::Close(None)).unwrap();

    for call in pending {
        let outcome = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RocketError::Closed)));
    }
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(connection.next_message().await, Err(RocketError::Closed)));
    assert!(matches!(connection.call("ping", Vec::new()).await, Err(RocketError::Closed)));
}

#[tokio::test]
async fn echo_responder_replies_reacts_and_counts() {
    let mut server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;
    let later = Utc::now().timestamp_millis() + 60_000;
    server.push(room_message("m1", "GENERAL", ("alice-id", "alice"), "@bot hi", later));
    let message = tokio::time::timeout(WAIT, connection.next_fresh_message()).await.unwrap().unwrap();

    let responder = EchoResponder {
        step: Duration::from_millis(10),
        steps: 2,
        ..EchoResponder::default()
    };
    assert!(responder.wants(&message));
    responder.respond(&connection, &message).await.unwrap();

    let sent = server.expect(|f| f["method"] == "sendMessage").await;
    assert_eq!(sent["params"][0]["rid"], "GENERAL");
    assert_eq!(sent["params"][0]["msg"], "@alice hi 0");

    // The reaction and the counting task run concurrently; collect until both finished.
    let mut after = Vec::new();
    let typing_done = |frames: &[Value]| {
        frames
            .iter()
            .any(|f| f["method"] == "stream-notify-room" && f["params"][2] == false)
    };
    while !(typing_done(&after) && after.iter().any(|f| f["method"] == "setReaction")) {
        after.push(server.expect(|f| f["msg"] == "method").await);
    }

    let reaction = after.iter().find(|f| f["method"] == "setReaction").unwrap();
    assert_eq!(reaction["params"], json!([":grinning:", "m1"]));

    let edits: Vec<&str> = after
        .iter()
        .filter(|f| f["method"] == "updateMessage")
        .map(|f| f["params"][0]["msg"].as_str().unwrap())
        .collect();
    assert_eq!(edits, ["@alice hi 1", "@alice hi 2"]);

    let typing: Vec<&Value> = after
        .iter()
        .filter(|f| f["method"] == "stream-notify-room")
        .collect();
    assert_eq!(typing.len(), 2);
    assert_eq!(typing[0]["params"][0], "GENERAL/typing");
    assert_eq!(typing[0]["params"][2], true);
}

#[tokio::test]
async fn oversized_frame_closes_the_connection_instead_of_hanging() {
    let server = MockServer::start(rocket_chat_with(many_rooms(400, 200))).await;

    let outcome = tokio::time::timeout(WAIT, Connection::connect(&server.settings()))
        .await
        .expect("connect gave up in time");
    assert!(matches!(outcome, Err(RocketError::Closed)), "got {outcome:?}");
}

#[tokio::test]
async fn oversized_frame_within_a_raised_limit_is_read() {
    let server = MockServer::start(rocket_chat_with(many_rooms(400, 200))).await;
    let settings = RocketChatConfig {
        read_limit: 1 << 20,
        ..server.settings()
    };

    let connection = tokio::time::timeout(WAIT, Connection::connect(&settings))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.rooms().await.unwrap().len(), 400);
}

#[tokio::test]
async fn every_room_is_subscribed_through_a_tiny_writer_queue() {
    let mut server = MockServer::start(rocket_chat_with(many_rooms(6, 0))).await;
    let settings = RocketChatConfig {
        outbound_queue_capacity: 1,
        ..server.settings()
    };
    let connection = tokio::time::timeout(WAIT, Connection::connect(&settings))
        .await
        .unwrap()
        .unwrap();

    let mut rooms = Vec::new();
    for _ in 0..6 {
        let sub = server.expect(|f| f["name"] == "stream-room-messages").await;
        rooms.push(sub["params"][0].as_str().unwrap().to_string());
    }
    rooms.sort();
    assert_eq!(rooms, ["room-0", "room-1", "room-2", "room-3", "room-4", "room-5"]);
    assert_eq!(connection.rooms().await.unwrap().len(), 6);

    server.push(json!({
        "msg": "changed",
        "collection": "stream-notify-user",
        "id": "id",
        "fields": {
            "eventName": "bot-id/subscriptions-changed",
            "args": ["inserted", { "rid": "room-6", "name": "room-6-" }],
        },
    }));
    server
        .expect(|f| f["name"] == "stream-room-messages" && f["params"][0] == "room-6")
        .await;
}

#[tokio::test]
async fn general_reader_is_not_blocked_by_a_parked_fresh_reader() {
    let server = MockServer::start(rocket_chat()).await;
    let connection = connect(&server).await;

    let parked = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.next_fresh_message().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.push(room_message("old", "GENERAL", ("alice-id", "alice"), "from before", 1_000));
    let old = tokio::time::timeout(WAIT, connection.next_message()).await.unwrap().unwrap();
    assert_eq!(old.id, "old");

    let later = Utc::now().timestamp_millis() + 60_000;
    server.push(room_message("new", "GENERAL", ("alice-id", "alice"), "hello", later));
    let fresh = tokio::time::timeout(WAIT, parked).await.unwrap().unwrap().unwrap();
    assert_eq!(fresh.id, "new");
}
