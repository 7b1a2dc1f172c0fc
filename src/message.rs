//! Turning raw `stream-room-messages` payloads into [`Message`] values.
//!
//! Required fields are checked strictly and reported as [`PayloadError`].
//! Optional fields (attachments, reactions, timestamps, url previews) are
//! read leniently: a malformed entry is skipped with a warning.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::warn;
use serde_json::{Map, Value};

use crate::error::PayloadError;
use crate::subscriptions::RoomDirectory;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub description: String,
    pub title: String,
    pub link: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub room_name: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    /// emoji → usernames that reacted with it
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    pub quoted_messages: Vec<String>,
    pub is_new: bool,
    pub is_edited: bool,
    pub is_mentioned: bool,
    pub am_i_pinged: bool,
    pub is_direct: bool,
    pub is_self: bool,
}

impl Message {
    /// Text with the leading `@username ` removed when the bot was pinged.
    pub fn text_without_ping(&self) -> &str {
        if !self.am_i_pinged {
            return &self.text;
        }
        self.text
            .split_once(' ')
            .map_or(self.text.as_str(), |(_, rest)| rest.trim_start())
    }

    /// Fresh-addressed messages go to the primary stream.
    pub fn is_fresh(&self) -> bool {
        self.is_new && !self.is_self
    }

    /// Time used for the replay gate: last update when known, else creation.
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.timestamp)
    }
}

/// Highest message time seen so far on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Watermark(at)
    }

    pub fn now() -> Self {
        Watermark(Utc::now())
    }

    pub fn current(&self) -> DateTime<Utc> {
        self.0
    }

    /// Advances past `at` and returns true, or returns false if `at` is not
    /// later than anything already seen.
    pub fn admit(&mut self, at: Option<DateTime<Utc>>) -> bool {
        match at {
            Some(at) if at > self.0 => {
                self.0 = at;
                true
            }
            _ => false,
        }
    }
}

/// Who "me" is when classifying messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug)]
pub struct MessageParser {
    identity: Identity,
    base_url: String,
    watermark: Watermark,
}

impl MessageParser {
    pub fn new(base_url: impl Into<String>, watermark: Watermark) -> Self {
        MessageParser {
            identity: Identity::default(),
            base_url: base_url.into(),
            watermark,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Classifies a pushed event and runs it through the replay gate.
    pub fn parse(&mut self, raw: &Value, rooms: &RoomDirectory) -> Result<Message, PayloadError> {
        let mut message = self.classify(raw, rooms)?;
        if !self.watermark.admit(message.effective_time()) {
            message.is_new = false;
        }
        Ok(message)
    }

    /// Classifies without consulting or moving the watermark.
    pub fn classify(&self, raw: &Value, rooms: &RoomDirectory) -> Result<Message, PayloadError> {
        let obj = raw.as_object().ok_or(PayloadError::WrongType {
            field: "message",
            expected: "an object",
        })?;
        let user = obj
            .get("u")
            .ok_or(PayloadError::MissingField("u"))?
            .as_object()
            .ok_or(PayloadError::WrongType {
                field: "u",
                expected: "an object",
            })?;

        let mut message = Message {
            id: required_str(obj, "_id", "_id")?,
            room_id: required_str(obj, "rid", "rid")?,
            text: required_str(obj, "msg", "msg")?,
            user_id: required_str(user, "_id", "u._id")?,
            username: required_str(user, "username", "u.username")?,
            is_new: true,
            ..Message::default()
        };

        message.attachments = obj.get("attachments").map(attachments).unwrap_or_default();
        message.timestamp = obj.get("ts").and_then(|v| timestamp(v, "ts"));
        message.updated_at = obj.get("_updatedAt").and_then(|v| timestamp(v, "_updatedAt"));

        message.is_edited = present(obj, "editedAt");
        if message.is_edited {
            message.is_new = false;
        }

        message.is_self = !self.identity.user_id.is_empty() && message.user_id == self.identity.user_id;
        message.is_mentioned = mentions(&message.text, &self.identity.username);
        message.am_i_pinged = pings(&message.text, &self.identity.username);

        if let Some(raw_reactions) = obj.get("reactions").filter(|v| !v.is_null()) {
            message.is_new = false;
            message.reactions = reactions(raw_reactions);
        }

        if has_url_preview(obj) {
            message.is_new = false;
        }

        if let Some(name) = rooms.name_of(&message.room_id) {
            message.room_name = name.to_string();
            message.is_direct = message.room_name == message.username;
        }

        message.quoted_messages = quoted_message_ids(&message.text, &self.base_url);
        Ok(message)
    }
}

fn required_str(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, PayloadError> {
    obj.get(key)
        .ok_or(PayloadError::MissingField(field))?
        .as_str()
        .map(ToString::to_string)
        .ok_or(PayloadError::WrongType {
            field,
            expected: "a string",
        })
}

fn present(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).is_some_and(|v| !v.is_null())
}

/// `@username` anywhere in the text, ignoring case.
pub fn mentions(text: &str, username: &str) -> bool {
    if username.is_empty() {
        return false;
    }
    text.to_lowercase()
        .contains(&format!("@{}", username.to_lowercase()))
}

/// Text starts with `@username ` (ignoring case) and has something after it.
pub fn pings(text: &str, username: &str) -> bool {
    if username.is_empty() {
        return false;
    }
    let prefix = format!("@{} ", username.to_lowercase());
    let text = text.to_lowercase();
    text.len() > prefix.len() && text.starts_with(&prefix)
}

/// Ids of messages quoted through links to this server, e.g.
/// `[ ](https://host:443/channel/general?msg=ABC123)`.
pub fn quoted_message_ids(text: &str, base_url: &str) -> Vec<String> {
    if base_url.is_empty() {
        return Vec::new();
    }
    let marker = format!("]({base_url}");
    text.split(marker.as_str())
        .skip(1)
        .filter_map(|segment| {
            let link = &segment[..segment.find(')')?];
            let start = link.find("?msg=")? + "?msg=".len();
            let id = link[start..].split('&').next()?;
            (!id.is_empty()).then(|| id.to_string())
        })
        .collect()
}

/// Markdown link that quotes `message` when posted to the server at
/// `base_url`. [`quoted_message_ids`] reads it back.
pub fn quote_link(base_url: &str, message: &Message) -> String {
    let kind = if message.is_direct { "direct" } else { "channel" };
    format!("[]({base_url}/{kind}/{}?msg={})", message.room_name, message.id)
}

fn has_url_preview(obj: &Map<String, Value>) -> bool {
    obj.get("urls")
        .and_then(Value::as_array)
        .and_then(|urls| urls.first())
        .and_then(|first| first.get("meta"))
        .is_some()
}

fn attachments(value: &Value) -> Vec<Attachment> {
    let Some(items) = value.as_array() else {
        if !value.is_null() {
            warn!("Ignoring attachments that are not a list: {}", value);
        }
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let description = item.get("description")?.as_str()?;
            let text = |key: &str| {
                item.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Some(Attachment {
                description: description.to_string(),
                title: text("title"),
                link: text("title_link"),
                kind: text("type"),
            })
        })
        .collect()
}

fn reactions(value: &Value) -> BTreeMap<String, BTreeSet<String>> {
    let mut map = BTreeMap::new();
    let Some(entries) = value.as_object() else {
        warn!("Ignoring reactions that are not an object: {}", value);
        return map;
    };
    for (emoji, reaction) in entries {
        let Some(usernames) = reaction.get("usernames").and_then(Value::as_array) else {
            warn!("Reaction {} has no usernames, skipped", emoji);
            continue;
        };
        let users: BTreeSet<String> = usernames
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect();
        map.insert(emoji.clone(), users);
    }
    map
}

/// Accepts `{"$date": <epoch ms>}` and ISO-8601 strings.
fn timestamp(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::Object(obj) => obj.get("$date").and_then(|date| {
            date.as_i64()
                .or_else(|| date.as_f64().map(|ms| ms as i64))
                .and_then(DateTime::from_timestamp_millis)
        }),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    };
    if parsed.is_none() {
        warn!("Cannot read timestamp `{}`: {}", field, value);
    }
    parsed
}
