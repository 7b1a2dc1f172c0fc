use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;

/// Something that answers fresh messages on a connection.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Pinged in a room, or written to directly.
    fn wants(&self, message: &Message) -> bool {
        message.am_i_pinged || message.is_direct
    }

    async fn respond(&self, connection: &Connection, message: &Message) -> Result<()>;
}

/// Echoes the message back, then edits the echo to count up while typing.
#[derive(Debug, Clone)]
pub struct EchoResponder {
    pub step: Duration,
    pub steps: u32,
    pub reaction: String,
}

impl Default for EchoResponder {
    fn default() -> Self {
        EchoResponder {
            step: Duration::from_secs(1),
            steps: 10,
            reaction: ":grinning:".to_string(),
        }
    }
}

impl EchoResponder {
    pub fn line(message: &Message, count: u32) -> String {
        format!("@{} {} {}", message.username, message.text_without_ping(), count)
    }
}

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, connection: &Connection, message: &Message) -> Result<()> {
        let reply = connection.reply(message, &Self::line(message, 0)).await?;

        let counter = connection.clone();
        let original = message.clone();
        let (step, steps) = (self.step, self.steps);
        tokio::spawn(async move {
            if let Err(e) = counter.set_typing(&original, true).await {
                warn!("Cannot set typing indicator: {}", e);
            }
            for count in 1..=steps {
                tokio::time::sleep(step).await;
                if let Err(e) = counter.edit_text(&reply, &Self::line(&original, count)).await {
                    warn!("Cannot edit reply {}: {}", reply.id, e);
                    break;
                }
            }
            if let Err(e) = counter.set_typing(&original, false).await {
                warn!("Cannot clear typing indicator: {}", e);
            }
        });

        connection.react(&message.id, &self.reaction).await
    }
}
