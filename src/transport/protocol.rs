//! Wire frames for the TCP transport.
//!
//! Length-prefixed JSON protocol between the agent and the relay endpoint.
//! Frames are framed as: [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// A single frame exchanged in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Application message.
    Message { message: Message },
    /// Liveness check; the receiver answers with `Pong` and the same nonce.
    Ping { nonce: u64 },
    /// Answer to `Ping`.
    Pong { nonce: u64 },
    /// Sender is closing the connection.
    Close,
}
