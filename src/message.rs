//! Relay message model.
//!
//! A message is an opaque payload tagged with an identifier and a kind.
//! Replies reuse the identifier of the message they answer.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a relay message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// A single message exchanged with the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque identifier shared by a request and its response.
    pub id: String,
    /// Message payload.
    pub content: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
}

impl Message {
    pub fn new(id: impl Into<String>, content: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
        }
    }

    /// New request with a freshly minted id.
    pub fn request(content: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), content, MessageType::Request)
    }

    /// New event with a freshly minted id.
    pub fn event(content: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), content, MessageType::Event)
    }

    /// Response answering `msg`, carrying the same id.
    pub fn response_to(msg: &Self, content: impl Into<String>) -> Self {
        Self::new(msg.id.clone(), content, MessageType::Response)
    }

    /// Error reply to `msg`, carrying the same id.
    pub fn error_for(msg: &Self, reason: impl Into<String>) -> Self {
        Self::new(msg.id.clone(), reason, MessageType::Error)
    }
}
