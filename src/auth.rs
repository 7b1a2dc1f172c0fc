use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::PayloadError;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    ResumeToken(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::ResumeToken(_) => f.write_str("ResumeToken(..)"),
        }
    }
}

impl Credentials {
    /// Parameters of the `login` method call.
    pub fn login_params(&self) -> Value {
        match self {
            Credentials::Password { username, password } => json!({
                "user": { "username": username },
                "password": {
                    "digest": password_digest(password),
                    "algorithm": "sha-256",
                },
            }),
            Credentials::ResumeToken(token) => json!({ "resume": token }),
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Password { username, .. } => Some(username),
            Credentials::ResumeToken(_) => None,
        }
    }
}

/// Lowercase hex SHA-256 of the plaintext password.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// What a successful `login` result tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub user_id: String,
    pub token: String,
}

impl LoginResult {
    pub fn from_result(result: &Value) -> Result<Self, PayloadError> {
        let field = |name: &'static str| {
            result
                .get(name)
                .ok_or(PayloadError::MissingField(name))?
                .as_str()
                .map(ToString::to_string)
                .ok_or(PayloadError::WrongType {
                    field: name,
                    expected: "a string",
                })
        };
        Ok(LoginResult {
            user_id: field("id")?,
            token: field("token")?,
        })
    }
}
