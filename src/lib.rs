//! Rocket.Chat client over the DDP websocket protocol, and the pieces a bot
//! needs around it.

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frames;
pub mod message;
pub mod registry;
pub mod responder;
pub mod rest;
pub mod state;
pub mod subscriptions;

pub use config::{Config, RocketChatConfig};
pub use connection::{Connection, DispatchStats, Status};
pub use error::{PayloadError, Result, RocketError};
pub use message::{Attachment, Message};
pub use state::ConnectionState;
