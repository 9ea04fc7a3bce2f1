//! Message handler trait and implementations.
//!
//! A handler turns one inbound message into an optional reply. The agent
//! invokes it sequentially from the listener task, in arrival order.

mod echo;

pub use echo::EchoHandler;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::Message;

/// Trait for inbound message handlers.
///
/// Errors are reported to the agent's observer and never stop the
/// listener; the next message is handled as usual.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    ///
    /// # Returns
    /// `Some(reply)` to send back over the same connection, `None` to stay
    /// silent.
    async fn handle(&self, msg: &Message) -> Result<Option<Message>>;
}
