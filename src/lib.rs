//! relay-agent library
//!
//! This crate provides a message relay agent:
//! - Lifecycle management (start, listen, stop, ping) around one connection
//! - Pluggable message handlers, with an identity echo as the default
//! - Transport trait with TCP and in-process implementations
//! - Injected observers for structured lifecycle events

pub mod agent;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod observer;
pub mod transport;

pub use agent::{AgentState, RelayAgent, RelayAgentBuilder};
pub use config::AgentConfig;
pub use error::{RelayError, Result};
pub use handler::{EchoHandler, MessageHandler};
pub use message::{Message, MessageType};
