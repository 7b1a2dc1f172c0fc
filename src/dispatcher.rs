//! The reader side of the connection.
//!
//! One task owns the socket's read half, the room directory and the parser
//! watermark. It handles frames strictly in arrival order and only ever does
//! non-blocking sends, so a slow consumer can cost events but never stalls the
//! socket. Outbound frames that do not fit the writer queue wait in a backlog
//! and go out in order once there is room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::error::{PayloadError, RocketError};
use crate::frames::{self, ClientFrame, Decoded, ServerFrame};
use crate::message::{Identity, Message, MessageParser};
use crate::registry::{IdGenerator, Registry};
use crate::state::Lifecycle;
use crate::subscriptions::{RoomDirectory, RoomEntry, SubscriptionManager, ROOM_STREAM, USER_STREAM};

/// Payload of a `result` frame, handed to the waiting caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodReply {
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl MethodReply {
    /// Turns a protocol-level error object into [`RocketError::Method`].
    pub fn into_result(self) -> Result<Value, RocketError> {
        match self.error {
            Some(error) => {
                let code = match error.get("error") {
                    Some(Value::String(code)) => code.clone(),
                    Some(Value::Number(code)) => code.to_string(),
                    _ => "unknown".to_string(),
                };
                let error_type = error
                    .get("errorType")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let reason = error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                Err(RocketError::Method {
                    code,
                    error_type,
                    reason,
                })
            }
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Requests from the connection handle to the reader task.
#[derive(Debug)]
pub enum Control {
    Identity(Identity),
    /// Record rooms and subscribe to the ones not seen before.
    Learn(Vec<RoomEntry>),
    /// Record room names only.
    RecordNames(Vec<RoomEntry>),
    Rooms(oneshot::Sender<RoomDirectory>),
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub frames: AtomicU64,
    pub fresh_dropped: AtomicU64,
    pub general_dropped: AtomicU64,
    pub payload_errors: AtomicU64,
}

/// Where the dispatcher sends things.
pub struct Outlets {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub fresh: mpsc::Sender<Message>,
    pub general: mpsc::Sender<Message>,
}

pub struct Dispatcher {
    subscriptions: SubscriptionManager,
    parser: MessageParser,
    ids: Arc<IdGenerator>,
    registry: Registry<MethodReply>,
    outlets: Outlets,
    counters: Arc<DispatchCounters>,
    handshake: Option<oneshot::Sender<String>>,
    session: Option<String>,
    backlog: VecDeque<ClientFrame>,
}

impl Dispatcher {
    pub fn new(
        parser: MessageParser,
        ids: Arc<IdGenerator>,
        registry: Registry<MethodReply>,
        outlets: Outlets,
        counters: Arc<DispatchCounters>,
        handshake: oneshot::Sender<String>,
    ) -> Self {
        Dispatcher {
            subscriptions: SubscriptionManager::new(),
            parser,
            ids,
            registry,
            outlets,
            counters,
            handshake: Some(handshake),
            session: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn rooms(&self) -> &RoomDirectory {
        self.subscriptions.rooms()
    }

    /// Frames waiting for room in the writer queue.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Reads frames until the socket fails, the server goes quiet for longer
    /// than `read_timeout`, or the connection is closed. Closes `lifecycle`
    /// on the way out. Oversized frames surface as a read error from the
    /// socket and end the loop like any other.
    pub async fn run<S>(
        mut self,
        mut stream: S,
        mut control: mpsc::UnboundedReceiver<Control>,
        lifecycle: Lifecycle,
        read_timeout: Duration,
    ) where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        let deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(deadline);
        let closed = lifecycle.closed();
        tokio::pin!(closed);
        let outbound = self.outlets.outbound.clone();

        loop {
            tokio::select! {
                biased;
                () = &mut closed => break,
                Some(request) = control.recv() => self.handle_control(request),
                permit = outbound.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(frame) = self.backlog.pop_front() {
                            permit.send(frame);
                        }
                    }
                    Err(_) => {
                        trace!("Writer is gone, discarding {} queued frames", self.backlog.len());
                        self.backlog.clear();
                    }
                },
                () = &mut deadline => {
                    warn!("No frame received for {:?}, giving up on the connection", read_timeout);
                    break;
                }
                next = stream.next() => {
                    let frame = match next {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            error!("Cannot read websocket: {}", e);
                            break;
                        }
                        None => {
                            info!("Websocket closed by the server");
                            break;
                        }
                    };
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                    match frame {
                        WsMessage::Text(text) => {
                            if let Err(e) = self.handle_text(&text) {
                                error!("Cannot decode frame from websocket: {}", e);
                                break;
                            }
                        }
                        WsMessage::Close(reason) => {
                            info!("Server sent close: {:?}", reason);
                            break;
                        }
                        other => trace!("Ignoring websocket frame {:?}", other),
                    }
                }
            }
        }
        lifecycle.close();
        debug!("Reader stopped");
    }

    /// Handles one text frame. Only invalid JSON is an error.
    pub fn handle_text(&mut self, raw: &str) -> Result<(), serde_json::Error> {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        match frames::decode(raw)? {
            Ok(Decoded::Frame(frame)) => self.handle_frame(frame),
            Ok(Decoded::Untagged(value)) => trace!("Ignoring untagged frame {}", value),
            Err(e) => self.payload_error("frame", &e),
        }
        Ok(())
    }

    pub fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Connected { session } => {
                debug!("Handshake acknowledged, session {}", session);
                if let Some(handshake) = self.handshake.take() {
                    let _ = handshake.send(session.clone());
                }
                self.session = Some(session);
            }
            ServerFrame::Result { id, result, error } => {
                self.registry.resolve(&id, MethodReply { result, error });
            }
            ServerFrame::Added { collection, id } => match collection.as_str() {
                "users" => trace!("User {:?} added", id),
                _ => trace!("Ignored added msg for {}", collection),
            },
            ServerFrame::Changed { collection, fields } => match collection.as_str() {
                USER_STREAM => {
                    let relevant = fields
                        .event_name
                        .as_deref()
                        .map_or(true, |name| name.ends_with("subscriptions-changed"));
                    if !relevant {
                        trace!("Ignoring user notification {:?}", fields.event_name);
                        return;
                    }
                    match self.subscriptions.handle_user_event(&fields.args, &self.ids) {
                        Ok(Some(sub)) => self.enqueue(sub),
                        Ok(None) => {}
                        Err(e) => self.payload_error("subscription change", &e),
                    }
                }
                ROOM_STREAM => {
                    for raw in &fields.args {
                        match self.parser.parse(raw, self.subscriptions.rooms()) {
                            Ok(message) => self.route(message),
                            Err(e) => self.payload_error("room message", &e),
                        }
                    }
                }
                _ => trace!("Ignored change on {}", collection),
            },
            ServerFrame::Ping { id } => self.enqueue(ClientFrame::Pong { id }),
            ServerFrame::Ready { subs } => trace!("Subscriptions ready: {:?}", subs),
            ServerFrame::Updated { methods } => trace!("Methods updated: {:?}", methods),
            ServerFrame::Other => trace!("Ignored frame of unknown kind"),
        }
    }

    pub fn handle_control(&mut self, request: Control) {
        match request {
            Control::Identity(identity) => {
                debug!("Classifying messages as {}", identity.username);
                self.parser.set_identity(identity);
            }
            Control::Learn(entries) => {
                for entry in entries {
                    if let Some(sub) = self.subscriptions.learn(entry, &self.ids) {
                        self.enqueue(sub);
                    }
                }
            }
            Control::RecordNames(entries) => {
                for entry in entries {
                    if let Some(name) = entry.name {
                        self.subscriptions.record_name(entry.id, name);
                    }
                }
            }
            Control::Rooms(reply) => {
                let _ = reply.send(self.subscriptions.rooms().clone());
            }
        }
    }

    fn route(&self, message: Message) {
        let (queue, dropped, label) = if message.is_fresh() {
            (&self.outlets.fresh, &self.counters.fresh_dropped, "fresh")
        } else {
            (&self.outlets.general, &self.counters.general_dropped, "general")
        };
        match queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                warn!("The {} message queue is full, dropping message {}", label, message.id);
            }
            Err(TrySendError::Closed(_)) => trace!("Nobody reads the {} message queue", label),
        }
    }

    fn enqueue(&mut self, frame: ClientFrame) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(frame);
            return;
        }
        match self.outlets.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                debug!("Outbound queue is full, holding {:?}", frame);
                self.backlog.push_back(frame);
            }
            Err(TrySendError::Closed(_)) => trace!("Writer is gone"),
        }
    }

    fn payload_error(&self, what: &str, e: &PayloadError) {
        self.counters.payload_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping malformed {}: {}", what, e);
    }
}
