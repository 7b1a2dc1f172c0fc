//! Read-only REST lookups. Each is a single authenticated GET.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{PayloadError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    user: UserInfo,
}

#[derive(Deserialize)]
struct EmojiListResponse {
    emojis: EmojiPage,
}

#[derive(Deserialize)]
struct EmojiPage {
    #[serde(default)]
    update: Vec<Emoji>,
}

#[derive(Deserialize)]
struct Emoji {
    name: String,
}

#[derive(Deserialize)]
struct MembersResponse {
    members: Option<Vec<Member>>,
}

#[derive(Deserialize)]
struct Member {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    message: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    auth_token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        RestClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .header("X-Auth-Token", &self.auth_token)
            .header("X-User-Id", &self.user_id)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    pub async fn user_info(&self, user_id: &str) -> Result<UserInfo> {
        let response: UserInfoResponse = self
            .get("/api/v1/users.info", &[("userId", user_id)])
            .await?;
        Ok(response.user)
    }

    /// Custom emojis as `:name:` strings.
    pub async fn list_custom_emojis(&self) -> Result<Vec<String>> {
        let response: EmojiListResponse = self.get("/api/v1/emoji-custom.list", &[]).await?;
        Ok(response
            .emojis
            .update
            .into_iter()
            .map(|emoji| format!(":{}:", emoji.name))
            .collect())
    }

    pub async fn list_users_in_room_id(&self, room_id: &str) -> Result<Vec<String>> {
        let response: MembersResponse = self
            .get("/api/v1/channels.members", &[("roomId", room_id), ("count", "1000")])
            .await?;
        let members = response.members.ok_or(PayloadError::MissingField("members"))?;
        Ok(members.into_iter().filter_map(|m| m.username).collect())
    }

    /// Raw message object, ready for the message parser.
    pub async fn message(&self, message_id: &str) -> Result<Value> {
        let response: MessageResponse = self
            .get("/api/v1/chat.getMessage", &[("msgId", message_id)])
            .await?;
        Ok(response.message.ok_or(PayloadError::MissingField("message"))?)
    }
}
