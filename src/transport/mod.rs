//! Transport layer between the agent and its messaging endpoint.
//!
//! Provides the `Connector`/`Connection` traits and length-prefixed JSON
//! framing functions. `TcpConnector` speaks framed JSON over TCP;
//! `MemoryConnector` is an in-process loopback for tests and embedding.

pub mod memory;
pub mod protocol;
pub mod tcp;

pub use memory::{MemoryConnector, MemoryPeer};
pub use protocol::Frame;
pub use tcp::{TcpConnection, TcpConnector};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{Endpoint, Scheme};
use crate::error::RelayError;
use crate::message::Message;

/// Maximum frame size (16 MB). Safety valve against malformed frames.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// A live link to the endpoint.
///
/// Implementations are shared between the listener task and callers of
/// `ping`/`stop`, so every method takes `&self`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one message to the endpoint.
    async fn send(&self, msg: &Message) -> Result<()>;

    /// Round-trip a liveness check. The caller applies the deadline.
    async fn ping(&self) -> Result<()>;

    /// Close the link. Inbound delivery stops afterwards.
    async fn close(&self) -> Result<()>;

    /// Whether the link is still usable.
    fn is_alive(&self) -> bool;
}

/// An established connection plus its inbound message stream.
///
/// The stream yields `None` once the remote side goes away.
pub struct Link {
    pub connection: Arc<dyn Connection>,
    pub inbound: mpsc::Receiver<Message>,
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete any handshake.
    ///
    /// `inbound_capacity` bounds the queue feeding `Link::inbound`.
    async fn connect(&self, endpoint: &Endpoint, inbound_capacity: usize) -> Result<Link>;
}

/// Default connector for an endpoint scheme.
///
/// In-process endpoints have no default: their peer side must be held by
/// the embedder, so a `MemoryConnector` has to be injected explicitly.
pub fn connector_for(endpoint: &Endpoint) -> Result<Arc<dyn Connector>, RelayError> {
    match endpoint.scheme {
        Scheme::Tcp => Ok(Arc::new(TcpConnector)),
        Scheme::Memory => Err(RelayError::ConnectionSetup(format!(
            "no default transport for {endpoint}; supply a MemoryConnector"
        ))),
    }
}

/// Write a length-prefixed frame to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Frame too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_FRAME_SIZE,
        "Frame exceeds max size: {len} > {MAX_FRAME_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame from a reader.
///
/// Enforces `MAX_FRAME_SIZE`.
pub async fn recv_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_FRAME_SIZE,
        "Frame exceeds max size: {len} > {MAX_FRAME_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
