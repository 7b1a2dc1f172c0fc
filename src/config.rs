use std::path::Path;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;

use crate::auth::Credentials;
use crate::error::{Result, RocketError};

pub const CONFIG_ENV: &str = "ROCKET_BOT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub rocket_chat: RocketChatConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RocketChatConfig {
    pub host_name: String,
    /// 0 picks 443 or 80 depending on `ssl`.
    pub port: u16,
    pub ssl: bool,
    pub user: String,
    pub password: String,
    pub auth_token: String,
    /// Largest websocket message accepted; a bigger one closes the connection.
    pub read_limit: usize,
    /// Absent means method calls wait until answered or closed.
    pub call_timeout_secs: Option<u64>,
    pub event_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub keepalive_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for RocketChatConfig {
    fn default() -> Self {
        RocketChatConfig {
            host_name: String::new(),
            port: 0,
            ssl: true,
            user: String::new(),
            password: String::new(),
            auth_token: String::new(),
            read_limit: 65536,
            call_timeout_secs: None,
            event_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            keepalive_secs: 120,
            read_timeout_secs: 125,
        }
    }
}

impl std::fmt::Debug for RocketChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketChatConfig")
            .field("host_name", &self.host_name)
            .field("port", &self.port())
            .field("ssl", &self.ssl)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RocketChatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host_name.is_empty() {
            return Err(RocketError::Config("host_name not set".into()));
        }
        if self.auth_token.is_empty() && (self.user.is_empty() || self.password.is_empty()) {
            return Err(RocketError::Config(
                "set auth_token, or both user and password".into(),
            ));
        }
        if self.event_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            return Err(RocketError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        match (self.port, self.ssl) {
            (0, true) => 443,
            (0, false) => 80,
            (port, _) => port,
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host_name, self.port())
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}:{}/websocket", scheme, self.host_name, self.port())
    }

    /// A resume token wins over a password.
    pub fn credentials(&self) -> Credentials {
        if self.auth_token.is_empty() {
            Credentials::Password {
                username: self.user.clone(),
                password: self.password.clone(),
            }
        } else {
            Credentials::ResumeToken(self.auth_token.clone())
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RocketError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| RocketError::Config(format!("cannot parse config: {e}")))?;
        config.rocket_chat.validate()?;
        Ok(config)
    }

    /// Path from `ROCKET_BOT_CONFIG`, or `config.yaml`.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    pub fn log_filter(&self) -> LevelFilter {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" | "warning" => LevelFilter::Warn,
            "error" | "fatal" => LevelFilter::Error,
            "off" => LevelFilter::Off,
            _ => {
                log::info!("Unknown log level `{}`, using info", self.log_level);
                LevelFilter::Info
            }
        }
    }
}
