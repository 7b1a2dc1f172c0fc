use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;

pub const PROTOCOL_VERSION: &str = "1";
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "msg")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect {
        version: String,
        support: Vec<String>,
    },
    #[serde(rename = "method")]
    Method {
        id: String,
        method: String,
        params: Vec<Value>,
    },
    #[serde(rename = "sub")]
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientFrame {
    pub fn connect() -> Self {
        ClientFrame::Connect {
            version: PROTOCOL_VERSION.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChangedFields {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msg")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected { session: String },
    #[serde(rename = "result")]
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename = "added")]
    Added {
        collection: String,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "updated")]
    Updated {
        #[serde(default)]
        methods: Vec<String>,
    },
    #[serde(rename = "changed")]
    Changed {
        collection: String,
        #[serde(default)]
        fields: ChangedFields,
    },
    #[serde(rename = "ready")]
    Ready {
        #[serde(default)]
        subs: Vec<String>,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug)]
pub enum Decoded {
    Frame(ServerFrame),
    /// Valid JSON without a `msg` discriminator, e.g. the `server_id` greeting.
    Untagged(Value),
}

/// Decodes one text frame. Invalid JSON is an `Err` from serde (fatal to the
/// reader); a JSON object of unexpected shape is a `PayloadError`.
pub fn decode(raw: &str) -> serde_json::Result<std::result::Result<Decoded, PayloadError>> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("msg").is_none() {
        return Ok(Ok(Decoded::Untagged(value)));
    }
    Ok(serde_json::from_value(value)
        .map(Decoded::Frame)
        .map_err(|e| PayloadError::Decode(e.to_string())))
}
