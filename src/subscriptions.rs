use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use serde_json::{json, Value};

use crate::error::{PayloadError, RocketError};
use crate::frames::ClientFrame;
use crate::registry::IdGenerator;

pub const USER_STREAM: &str = "stream-notify-user";
pub const ROOM_STREAM: &str = "stream-room-messages";

/// Room id → room name. Rooms are never removed during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomDirectory {
    names: HashMap<String, String>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.names.insert(id.into(), name.into());
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, room)| room.as_str() == name)
            .map(|(id, _)| id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEntry {
    pub id: String,
    pub name: Option<String>,
}

/// Keeps the directory and the set of rooms we already subscribed to.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    rooms: RoomDirectory,
    subscribed: HashSet<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.subscribed.contains(room_id)
    }

    /// Subscription to the current user's "subscriptions changed" feed.
    pub fn user_feed(user_id: &str, ids: &IdGenerator) -> Result<ClientFrame, RocketError> {
        if user_id.is_empty() {
            return Err(RocketError::NotAuthenticated);
        }
        Ok(ClientFrame::Sub {
            id: ids.next_id(),
            name: USER_STREAM.to_string(),
            params: vec![json!(format!("{user_id}/subscriptions-changed")), json!(false)],
        })
    }

    /// Records a room and returns the subscribe frame the first time it is seen.
    pub fn learn(&mut self, entry: RoomEntry, ids: &IdGenerator) -> Option<ClientFrame> {
        if let Some(name) = entry.name {
            self.rooms.insert(entry.id.clone(), name);
        }
        if !self.subscribed.insert(entry.id.clone()) {
            trace!("Already subscribed to room {}", entry.id);
            return None;
        }
        debug!("Subscribing to room {}", entry.id);
        Some(ClientFrame::Sub {
            id: ids.next_id(),
            name: ROOM_STREAM.to_string(),
            params: vec![json!(entry.id), json!(false)],
        })
    }

    /// Records a name without subscribing (directory refresh).
    pub fn record_name(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.rooms.insert(id, name);
    }

    /// Handles the args of a `subscriptions-changed` event. Only `inserted`
    /// yields a new subscription.
    pub fn handle_user_event(
        &mut self,
        args: &[Value],
        ids: &IdGenerator,
    ) -> Result<Option<ClientFrame>, PayloadError> {
        let kind = args
            .first()
            .ok_or(PayloadError::MissingField("args[0]"))?
            .as_str()
            .ok_or(PayloadError::WrongType {
                field: "args[0]",
                expected: "a string",
            })?;
        if kind != "inserted" {
            trace!("Ignoring subscription change `{}`", kind);
            return Ok(None);
        }
        let room = args.get(1).ok_or(PayloadError::MissingField("args[1]"))?;
        let id = str_field(room, "rid")?;
        let name = str_field(room, "name")?;
        Ok(self.learn(
            RoomEntry {
                id: id.to_string(),
                name: Some(name.to_string()),
            },
            ids,
        ))
    }
}

fn str_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, PayloadError> {
    value
        .get(field)
        .ok_or(PayloadError::MissingField(field))?
        .as_str()
        .ok_or(PayloadError::WrongType {
            field,
            expected: "a string",
        })
}

/// Reads the `subscriptions/get` result: `{ "update": [ { "rid", "name"? }, .. ] }`.
pub fn parse_subscriptions(result: &Value) -> Result<Vec<RoomEntry>, PayloadError> {
    let update = result
        .get("update")
        .ok_or(PayloadError::MissingField("update"))?
        .as_array()
        .ok_or(PayloadError::WrongType {
            field: "update",
            expected: "an array",
        })?;
    let mut entries = Vec::with_capacity(update.len());
    for item in update {
        match str_field(item, "rid") {
            Ok(id) => entries.push(RoomEntry {
                id: id.to_string(),
                name: item.get("name").and_then(Value::as_str).map(ToString::to_string),
            }),
            Err(e) => log::warn!("Skipping subscription entry: {}", e),
        }
    }
    Ok(entries)
}

/// Reads the `rooms/get` result; only rooms with an `fname` are kept.
pub fn parse_rooms(result: &Value) -> Result<Vec<RoomEntry>, PayloadError> {
    let rooms = result.as_array().ok_or(PayloadError::WrongType {
        field: "result",
        expected: "an array",
    })?;
    Ok(rooms
        .iter()
        .filter_map(|room| {
            let name = room.get("fname")?.as_str()?;
            let id = room.get("_id")?.as_str()?;
            Some(RoomEntry {
                id: id.to_string(),
                name: Some(name.to_string()),
            })
        })
        .collect())
}
