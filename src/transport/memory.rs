//! In-process loopback transport for `test://` and `memory://` endpoints.
//!
//! Every successful `connect` hands a [`MemoryPeer`] to whoever holds the
//! receiver returned by [`MemoryConnector::new`]. The peer plays the remote
//! side: it injects inbound messages and observes what the agent sends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, Connector, Link};
use crate::config::Endpoint;
use crate::message::Message;

/// Connector producing in-process links.
#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusing: AtomicBool,
    ping_delay: Option<Duration>,
}

impl MemoryConnector {
    /// Create a connector and the receiver on which peers are delivered.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refusing: AtomicBool::new(false),
                ping_delay: None,
            },
            rx,
        )
    }

    /// Delay every ping by `delay` before it succeeds.
    #[must_use]
    pub const fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = Some(delay);
        self
    }

    /// Make subsequent connects fail as if the endpoint were unreachable.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint, inbound_capacity: usize) -> Result<Link> {
        anyhow::ensure!(
            !self.refusing.load(Ordering::Relaxed),
            "Endpoint {endpoint} refused the connection"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            endpoint: endpoint.clone(),
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            closed: Arc::clone(&closed),
        };
        self.peers
            .send(peer)
            .map_err(|_| anyhow::anyhow!("Nothing is listening on {endpoint}"))?;

        debug!(endpoint = %endpoint, "In-memory link established");

        Ok(Link {
            connection: Arc::new(MemoryConnection {
                outbound: outbound_tx,
                closed,
                ping_delay: self.ping_delay,
            }),
            inbound: inbound_rx,
        })
    }
}

struct MemoryConnection {
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    ping_delay: Option<Duration>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, msg: &Message) -> Result<()> {
        anyhow::ensure!(self.is_alive(), "In-memory link is closed");
        self.outbound
            .send(msg.clone())
            .map_err(|_| anyhow::anyhow!("Peer stopped reading"))
    }

    async fn ping(&self) -> Result<()> {
        anyhow::ensure!(self.is_alive(), "In-memory link is closed");
        if let Some(delay) = self.ping_delay {
            tokio::time::sleep(delay).await;
        }
        anyhow::ensure!(self.is_alive(), "In-memory link closed during ping");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.outbound.is_closed()
    }
}

/// Remote side of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: Endpoint,
    inbound: Option<mpsc::Sender<Message>>,
    outbound: mpsc::UnboundedReceiver<Message>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Endpoint the agent connected to.
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Deliver a message to the agent.
    pub async fn inject(&self, msg: Message) -> Result<()> {
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Peer already disconnected"))?;
        inbound
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("Agent is no longer receiving"))
    }

    /// Next message sent by the agent, or `None` once the link is gone.
    pub async fn next_outbound(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Next message sent by the agent, if one is already queued.
    pub fn try_next_outbound(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }

    /// Stop accepting messages from the agent; its sends fail afterwards.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    /// End the inbound stream, as if the remote side dropped the connection.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Whether the agent has closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
