//! Error types surfaced by the relay agent.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentState;

/// Result type alias for relay agent operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors returned by [`RelayAgent`](crate::agent::RelayAgent) operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad input at construction (empty or malformed endpoint, zero timeout).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Preliminary client setup failed (no transport for the endpoint).
    #[error("Connection setup error: {0}")]
    ConnectionSetup(String),

    /// Connect, handshake or ping failed.
    #[error("Connection error: {0:#}")]
    Connection(anyhow::Error),

    /// Outbound send failed.
    #[error("Send error: {0:#}")]
    Send(anyhow::Error),

    /// Operation attempted while the agent is not started.
    #[error("Agent is not connected (state: {0})")]
    NotConnected(AgentState),

    /// Connect or ping exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Lifecycle transition not allowed from the current state.
    #[error("Cannot {operation} agent in state {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },
}
