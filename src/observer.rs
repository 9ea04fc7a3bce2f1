//! Lifecycle and message events emitted by the agent.
//!
//! The agent never logs directly; it reports to an injected
//! [`AgentObserver`]. [`TracingObserver`] forwards events to `tracing`,
//! [`RecordingObserver`] keeps them in memory.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::message::MessageType;

/// Something worth reporting that happened inside the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Starting { endpoint: String },
    Started { endpoint: String },
    StartFailed { endpoint: String, error: String },
    MessageReceived { id: String, kind: MessageType },
    ReplySent { id: String },
    HandlerFailed { id: String, error: String },
    SendFailed { id: String, error: String },
    ConnectionLost,
    ListenerStopped,
    /// Listener task panicked or was cancelled.
    ListenerFailed { error: String },
    /// Listener missed the shutdown deadline and was aborted.
    ListenerAborted { after: Duration },
    Stopping,
    CloseFailed { error: String },
    Stopped,
}

/// Receiver of agent events.
pub trait AgentObserver: Send + Sync {
    fn observe(&self, event: &AgentEvent);
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AgentObserver for TracingObserver {
    fn observe(&self, event: &AgentEvent) {
        match event {
            AgentEvent::Starting { endpoint } => {
                info!(endpoint = %endpoint, "Relay agent starting");
            }
            AgentEvent::Started { endpoint } => {
                info!(endpoint = %endpoint, "Relay agent started");
            }
            AgentEvent::StartFailed { endpoint, error } => {
                error!(endpoint = %endpoint, error = %error, "Relay agent failed to start");
            }
            AgentEvent::MessageReceived { id, kind } => {
                debug!(id = %id, kind = %kind, "Received message");
            }
            AgentEvent::ReplySent { id } => debug!(id = %id, "Sent reply"),
            AgentEvent::HandlerFailed { id, error } => {
                warn!(id = %id, error = %error, "Error handling message");
            }
            AgentEvent::SendFailed { id, error } => {
                warn!(id = %id, error = %error, "Error sending reply");
            }
            AgentEvent::ConnectionLost => warn!("Connection lost, relay agent stopping"),
            AgentEvent::ListenerStopped => info!("Relay agent listener shutting down"),
            AgentEvent::ListenerFailed { error } => {
                error!(error = %error, "Relay agent listener failed");
            }
            AgentEvent::ListenerAborted { after } => {
                warn!(after = ?after, "Listener did not exit in time, aborted");
            }
            AgentEvent::Stopping => info!("Stopping relay agent"),
            AgentEvent::CloseFailed { error } => {
                warn!(error = %error, "Error closing connection");
            }
            AgentEvent::Stopped => info!("Relay agent stopped"),
        }
    }
}

/// Observer that keeps every event, for assertions and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<AgentEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Whether an event equal to `event` has been seen.
    pub fn saw(&self, event: &AgentEvent) -> bool {
        self.events
            .lock()
            .map(|events| events.contains(event))
            .unwrap_or(false)
    }
}

impl AgentObserver for RecordingObserver {
    fn observe(&self, event: &AgentEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
