//! One long-lived DDP connection to a Rocket.Chat server.
//!
//! [`Connection::connect`] dials the websocket, shakes hands, logs in and
//! subscribes to every room the account can see. Afterwards three tasks run:
//! the writer (socket write half, fed by a bounded queue), the reader
//! ([`Dispatcher`], socket read half plus room directory) and the call
//! registry. Everything else talks to them through channels.
//!
//! Inbound messages land in two bounded queues, fresh-addressed and general.
//! When a queue is full the reader drops the message instead of waiting; see
//! [`Connection::stats`] for the drop counters. The two queues are read
//! independently, so a task parked on one never holds up readers of the other.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::auth::LoginResult;
use crate::config::RocketChatConfig;
use crate::dispatcher::{Control, DispatchCounters, Dispatcher, MethodReply, Outlets};
use crate::error::{PayloadError, Result, RocketError};
use crate::frames::ClientFrame;
use crate::message::{self, Identity, Message, MessageParser, Watermark};
use crate::registry::{IdGenerator, Registry};
use crate::rest::{RestClient, UserInfo};
use crate::state::{ConnectionState, Lifecycle};
use crate::subscriptions::{self, RoomDirectory, SubscriptionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Online,
    Busy,
    Away,
    Offline,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Busy => "busy",
            Status::Away => "away",
            Status::Offline => "offline",
        }
    }
}

/// Snapshot of the reader's counters and the queue depths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames: u64,
    pub fresh_dropped: u64,
    pub general_dropped: u64,
    pub payload_errors: u64,
    pub fresh_queued: usize,
    pub general_queued: usize,
    pub pending_calls: usize,
}

/// Issues method calls and waits for their results.
#[derive(Clone)]
struct Calls {
    ids: Arc<IdGenerator>,
    registry: Registry<MethodReply>,
    outbound: mpsc::Sender<ClientFrame>,
    lifecycle: Lifecycle,
    timeout: Option<Duration>,
}

impl Calls {
    /// Waits for room in the outbound queue; this is the backpressure on our
    /// own call rate.
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        if self.lifecycle.is_closed() {
            return Err(RocketError::Closed);
        }
        self.outbound.send(frame).await.map_err(|_| RocketError::Closed)
    }

    async fn issue(&self, method: &str, params: Vec<Value>) -> Result<(String, oneshot::Receiver<MethodReply>)> {
        if self.lifecycle.is_closed() {
            return Err(RocketError::Closed);
        }
        let id = self.ids.next_id();
        let rx = self.registry.register(&id)?;
        trace!("Calling {} as #{}", method, id);
        let frame = ClientFrame::Method {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send(frame).await {
            self.registry.forget(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn wait(&self, rx: oneshot::Receiver<MethodReply>) -> Result<Value> {
        let reply = tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| RocketError::Closed)?,
            () = self.lifecycle.closed() => return Err(RocketError::Closed),
        };
        reply.into_result()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match self.timeout {
            Some(limit) => self.call_with_timeout(method, params, limit).await,
            None => {
                let (_, rx) = self.issue(method, params).await?;
                self.wait(rx).await
            }
        }
    }

    async fn call_with_timeout(&self, method: &str, params: Vec<Value>, limit: Duration) -> Result<Value> {
        let (id, rx) = self.issue(method, params).await?;
        if let Ok(outcome) = tokio::time::timeout(limit, self.wait(rx)).await {
            outcome
        } else {
            self.registry.forget(&id);
            warn!("Call #{} ({}) got no result within {:?}", id, method, limit);
            Err(RocketError::Timeout(limit))
        }
    }
}

struct Inner {
    settings: RocketChatConfig,
    session_id: String,
    user_id: String,
    username: String,
    display_name: String,
    auth_token: String,
    calls: Calls,
    control: mpsc::UnboundedSender<Control>,
    fresh: Mutex<mpsc::Receiver<Message>>,
    general: Mutex<mpsc::Receiver<Message>>,
    fresh_tx: mpsc::WeakSender<Message>,
    general_tx: mpsc::WeakSender<Message>,
    counters: Arc<DispatchCounters>,
    rest: RestClient,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.calls.lifecycle.close();
    }
}

/// Handle to the connection. Cheap to clone; all clones share one socket.
/// Dropping the last clone closes it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.settings.host_name)
            .field("user", &self.inner.username)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dials, logs in and subscribes. Any failure closes what was started.
    pub async fn connect(settings: &RocketChatConfig) -> Result<Self> {
        settings.validate()?;
        let lifecycle = Lifecycle::new();
        match Self::establish(settings.clone(), lifecycle.clone()).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                lifecycle.close();
                Err(e)
            }
        }
    }

    async fn establish(settings: RocketChatConfig, lifecycle: Lifecycle) -> Result<Self> {
        let url = settings.ws_url();
        if settings.ssl {
            // Fails only if a provider is already installed, which is fine.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
        info!("Connecting to {}", url);
        // Frames above the limit fail the read and take the connection down.
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(settings.read_limit))
            .max_frame_size(Some(settings.read_limit));
        let (socket, _) = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false)
            .await
            .map_err(|e| RocketError::connect(&url, e))?;
        let (sink, stream) = socket.split();

        let ids = Arc::new(IdGenerator::new());
        let registry = Registry::spawn(lifecycle.clone());
        let counters = Arc::new(DispatchCounters::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);
        let (fresh_tx, fresh_rx) = mpsc::channel(settings.event_queue_capacity);
        let (general_tx, general_rx) = mpsc::channel(settings.event_queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let parser = MessageParser::new(settings.http_url(), Watermark::now());
        let weak_fresh = fresh_tx.downgrade();
        let weak_general = general_tx.downgrade();
        let dispatcher = Dispatcher::new(
            parser,
            ids.clone(),
            registry.clone(),
            Outlets {
                outbound: outbound_tx.clone(),
                fresh: fresh_tx,
                general: general_tx,
            },
            counters.clone(),
            handshake_tx,
        );

        tokio::spawn(write_loop(sink, outbound_rx, lifecycle.clone(), settings.keepalive()));
        tokio::spawn(dispatcher.run(stream, control_rx, lifecycle.clone(), settings.read_timeout()));

        let calls = Calls {
            ids,
            registry,
            outbound: outbound_tx,
            lifecycle: lifecycle.clone(),
            timeout: settings.call_timeout(),
        };

        lifecycle.advance(ConnectionState::Authenticating);
        calls.send(ClientFrame::connect()).await?;
        let session_id = tokio::select! {
            session = handshake_rx => session.map_err(|_| RocketError::Closed)?,
            () = lifecycle.closed() => return Err(RocketError::Closed),
        };

        let credentials = settings.credentials();
        debug!("Logging in with {:?}", credentials);
        let result = calls.call("login", vec![credentials.login_params()]).await?;
        let login = LoginResult::from_result(&result)?;
        info!("Logged in as user {}", login.user_id);

        let rest = RestClient::new(settings.http_url(), &login.user_id, &login.token);
        let looked_up = match rest.user_info(&login.user_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Cannot look up user {}: {}", login.user_id, e);
                None
            }
        };
        let (username, display_name) = resolve_names(credentials.username(), looked_up);

        control_tx
            .send(Control::Identity(Identity {
                user_id: login.user_id.clone(),
                username: username.clone(),
            }))
            .map_err(|_| RocketError::Closed)?;
        lifecycle.advance(ConnectionState::Active);

        let connection = Connection {
            inner: Arc::new(Inner {
                settings,
                session_id,
                user_id: login.user_id,
                username,
                display_name,
                auth_token: login.token,
                calls,
                control: control_tx,
                fresh: Mutex::new(fresh_rx),
                general: Mutex::new(general_rx),
                fresh_tx: weak_fresh,
                general_tx: weak_general,
                counters,
                rest,
            }),
        };
        connection.subscribe_rooms().await?;
        Ok(connection)
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    /// Token usable for a later resume login.
    pub fn auth_token(&self) -> &str {
        &self.inner.auth_token
    }

    pub fn base_url(&self) -> String {
        self.inner.settings.http_url()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.calls.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.calls.lifecycle.is_closed()
    }

    pub async fn wait_closed(&self) {
        self.inner.calls.lifecycle.closed().await;
    }

    /// Closes the connection. Pending calls and blocked readers wake with
    /// [`RocketError::Closed`].
    pub fn close(&self) {
        info!("Closing connection to {}", self.inner.settings.host_name);
        self.inner.calls.lifecycle.close();
    }

    /// Calls a server method and waits for its result. Uses the configured
    /// call timeout when there is one.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.inner.calls.call(method, params).await
    }

    pub async fn call_with_timeout(&self, method: &str, params: Vec<Value>, limit: Duration) -> Result<Value> {
        self.inner.calls.call_with_timeout(method, params, limit).await
    }

    /// Starts a subscription and returns its id without waiting for `ready`.
    pub async fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<String> {
        let id = self.inner.calls.ids.next_id();
        self.inner
            .calls
            .send(ClientFrame::Sub {
                id: id.clone(),
                name: name.to_string(),
                params,
            })
            .await?;
        Ok(id)
    }

    /// Subscribes to the user's subscription feed, then to every room the
    /// server lists for us.
    pub async fn subscribe_rooms(&self) -> Result<()> {
        let feed = SubscriptionManager::user_feed(&self.inner.user_id, &self.inner.calls.ids)?;
        self.inner.calls.send(feed).await?;

        let result = self
            .call("subscriptions/get", vec![json!({ "$date": 0 })])
            .await?;
        let entries = subscriptions::parse_subscriptions(&result)?;
        info!("Subscribing to {} rooms", entries.len());
        self.control(Control::Learn(entries))
    }

    /// Re-reads room names with `rooms/get`.
    pub async fn refresh_rooms(&self) -> Result<()> {
        let result = self.call("rooms/get", Vec::new()).await?;
        let entries = subscriptions::parse_rooms(&result)?;
        self.control(Control::RecordNames(entries))
    }

    /// Copy of the room directory as the reader currently knows it.
    pub async fn rooms(&self) -> Result<RoomDirectory> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::Rooms(reply))?;
        tokio::select! {
            rooms = rx => rooms.map_err(|_| RocketError::Closed),
            () = self.wait_closed() => Err(RocketError::Closed),
        }
    }

    fn control(&self, request: Control) -> Result<()> {
        self.inner.control.send(request).map_err(|_| RocketError::Closed)
    }

    /// Next message that is new and not ours.
    pub async fn next_fresh_message(&self) -> Result<Message> {
        let mut fresh = self.inner.fresh.lock().await;
        tokio::select! {
            biased;
            Some(message) = fresh.recv() => Ok(message),
            () = self.wait_closed() => Err(RocketError::Closed),
        }
    }

    /// Next message from either queue, fresh first. While another task holds
    /// the fresh queue this only sees general messages.
    pub async fn next_message(&self) -> Result<Message> {
        let mut general = self.inner.general.lock().await;
        let fresh = async {
            let mut fresh = self.inner.fresh.lock().await;
            fresh.recv().await
        };
        tokio::select! {
            biased;
            Some(message) = fresh => Ok(message),
            Some(message) = general.recv() => Ok(message),
            () = self.wait_closed() => Err(RocketError::Closed),
        }
    }

    pub async fn stats(&self) -> DispatchStats {
        let counters = &self.inner.counters;
        DispatchStats {
            frames: counters.frames.load(Ordering::Relaxed),
            fresh_dropped: counters.fresh_dropped.load(Ordering::Relaxed),
            general_dropped: counters.general_dropped.load(Ordering::Relaxed),
            payload_errors: counters.payload_errors.load(Ordering::Relaxed),
            fresh_queued: queued(&self.inner.fresh_tx),
            general_queued: queued(&self.inner.general_tx),
            pending_calls: self.inner.calls.registry.pending().await,
        }
    }

    async fn classify(&self, raw: &Value) -> Result<Message> {
        let rooms = self.rooms().await?;
        let parser = MessageParser::new(self.base_url(), Watermark::now()).with_identity(Identity {
            user_id: self.inner.user_id.clone(),
            username: self.inner.username.clone(),
        });
        Ok(parser.classify(raw, &rooms)?)
    }

    pub async fn send_message(&self, room_id: &str, text: &str) -> Result<Message> {
        let result = self
            .call("sendMessage", vec![json!({ "rid": room_id, "msg": text })])
            .await?;
        let mut message = match self.classify(&result).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot read sendMessage result: {}", e);
                Message {
                    room_id: room_id.to_string(),
                    text: text.to_string(),
                    ..Message::default()
                }
            }
        };
        message.is_self = true;
        Ok(message)
    }

    pub async fn reply(&self, message: &Message, text: &str) -> Result<Message> {
        self.send_message(&message.room_id, text).await
    }

    /// Sends a direct message, opening the 1:1 room if needed.
    pub async fn dm(&self, username: &str, text: &str) -> Result<Message> {
        let result = self.call("createDirectMessage", vec![json!(username)]).await?;
        let room_id = result
            .get("rid")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingField("rid"))?
            .to_string();
        self.send_message(&room_id, text).await
    }

    /// Writes to the author privately; replies in place if already direct.
    pub async fn dm_author(&self, message: &Message, text: &str) -> Result<Message> {
        if message.is_direct {
            return self.reply(message, text).await;
        }
        self.dm(&message.username, text).await
    }

    pub async fn react(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.call("setReaction", vec![json!(emoji), json!(message_id)])
            .await
            .map(drop)
    }

    pub async fn edit_text(&self, message: &Message, text: &str) -> Result<()> {
        self.call(
            "updateMessage",
            vec![json!({ "_id": message.id, "rid": message.room_id, "msg": text })],
        )
        .await
        .map(drop)
    }

    pub async fn delete(&self, message: &Message) -> Result<()> {
        self.call("deleteMessage", vec![json!({ "_id": message.id })])
            .await
            .map(drop)
    }

    pub async fn set_typing(&self, message: &Message, typing: bool) -> Result<()> {
        self.call(
            "stream-notify-room",
            vec![
                json!(format!("{}/typing", message.room_id)),
                json!(self.inner.display_name),
                json!(typing),
            ],
        )
        .await
        .map(drop)
    }

    pub async fn kick_user(&self, message: &Message) -> Result<Message> {
        self.reply(message, &format!("/kick @{}", message.username)).await
    }

    pub async fn set_default_status(&self, status: Status) -> Result<()> {
        self.call("UserPresence:setDefaultStatus", vec![json!(status.as_str())])
            .await
            .map(drop)
    }

    pub async fn set_temporary_status(&self, status: Status) -> Result<()> {
        self.call(&format!("UserPresence:{}", status.as_str()), Vec::new())
            .await
            .map(drop)
    }

    /// Markdown link that quotes `message` when posted.
    pub fn quote_link(&self, message: &Message) -> String {
        message::quote_link(&self.base_url(), message)
    }

    pub async fn user_info(&self, user_id: &str) -> Result<UserInfo> {
        self.inner.rest.user_info(user_id).await
    }

    pub async fn list_custom_emojis(&self) -> Result<Vec<String>> {
        self.inner.rest.list_custom_emojis().await
    }

    pub async fn list_users_in_room_id(&self, room_id: &str) -> Result<Vec<String>> {
        self.inner.rest.list_users_in_room_id(room_id).await
    }

    pub async fn list_users_in_room(&self, room_name: &str) -> Result<Vec<String>> {
        let rooms = self.rooms().await?;
        let room_id = rooms
            .id_of(room_name)
            .ok_or_else(|| RocketError::NoSuchRoom(room_name.to_string()))?;
        self.list_users_in_room_id(room_id).await
    }

    /// Fetches a message over REST. The replay watermark is not touched.
    pub async fn request_message(&self, message_id: &str) -> Result<Message> {
        let raw = self.inner.rest.message(message_id).await?;
        self.classify(&raw).await
    }
}

fn queued(tx: &mpsc::WeakSender<Message>) -> usize {
    tx.upgrade()
        .map_or(0, |tx| tx.max_capacity() - tx.capacity())
}

/// Username comes from the credentials when we logged in by password,
/// otherwise from the REST lookup.
fn resolve_names(login_username: Option<&str>, looked_up: Option<UserInfo>) -> (String, String) {
    let display_name = looked_up.as_ref().map(|u| u.name.clone()).unwrap_or_default();
    let username = match login_username {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => looked_up.map(|u| u.username).unwrap_or_default(),
    };
    (username, display_name)
}

/// Drains the outbound queue into the socket and pings on a fixed tick.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ClientFrame>,
    lifecycle: Lifecycle,
    keepalive: Duration,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    let closed = lifecycle.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            () = &mut closed => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let packet = match frame.encode() {
                    Ok(packet) => packet,
                    Err(e) => {
                        error!("Cannot encode {:?}: {}", frame, e);
                        continue;
                    }
                };
                trace!("-> {}", packet);
                if let Err(e) = sink.send(WsMessage::Text(packet.into())).await {
                    error!("Cannot write to websocket: {}", e);
                    break;
                }
            }
            _ = tick.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!("Cannot ping websocket: {}", e);
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    lifecycle.close();
    debug!("Writer stopped");
}
