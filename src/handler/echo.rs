//! Identity echo handler.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::MessageHandler;
use crate::message::Message;

/// Replies to every message with a response carrying the same id and content.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EchoHandler {
    /// Create a new echo handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    #[instrument(skip(self, msg), fields(id = %msg.id, kind = %msg.kind))]
    async fn handle(&self, msg: &Message) -> Result<Option<Message>> {
        debug!(content_len = msg.content.len(), "Echoing message");
        Ok(Some(Message::response_to(msg, msg.content.clone())))
    }
}
