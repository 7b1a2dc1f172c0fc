use thiserror::Error;

pub type Result<T> = std::result::Result<T, RocketError>;

/// Shape problems in a single inbound payload. Scoped to that payload only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("cannot decode payload: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum RocketError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("the rocket connection has been closed")]
    Closed,

    #[error("method call failed: {code} {error_type}")]
    Method {
        code: String,
        error_type: String,
        reason: Option<String>,
    },

    #[error("malformed payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("user is not known yet, log in first")]
    NotAuthenticated,

    #[error("no known room named `{0}`")]
    NoSuchRoom(String),

    #[error("method call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RocketError {
    pub fn connect(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
