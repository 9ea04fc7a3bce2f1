//! TCP transport speaking length-prefixed JSON frames.
//!
//! A background reader task owns the read half: it forwards `Message`
//! frames to the inbound queue, answers peer pings, and resolves our own
//! pings when the matching pong arrives. Writes go through a mutex so
//! frames from the listener and from `ping`/`close` never interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::Frame;
use super::{recv_frame, send_frame, Connection, Connector, Link};
use crate::config::Endpoint;
use crate::message::Message;

/// Connector for `tcp://host:port` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint, inbound_capacity: usize) -> Result<Link> {
        debug!(endpoint = %endpoint, "Opening TCP connection");

        let stream = TcpStream::connect(&endpoint.address)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint.address))?;
        stream
            .set_nodelay(true)
            .context("Failed to set TCP_NODELAY")?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| endpoint.address.clone(), |a| a.to_string());

        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            pending_pings: std::sync::Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            reading: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });

        let reader_task = tokio::spawn(read_loop(reader, inbound_tx, Arc::clone(&shared)));

        debug!(peer = %peer, "TCP connection established");

        Ok(Link {
            connection: Arc::new(TcpConnection {
                shared,
                reader_task: std::sync::Mutex::new(Some(reader_task)),
                peer,
            }),
            inbound: inbound_rx,
        })
    }
}

/// State shared between a `TcpConnection` and its reader task.
struct Shared {
    writer: Mutex<OwnedWriteHalf>,
    pending_pings: std::sync::Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_nonce: AtomicU64,
    reading: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    async fn write(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        send_frame(&mut *writer, frame).await
    }

    /// Register a ping waiter. Fails once the reader has exited, so a waiter
    /// can never be left behind after `fail_pending_pings` ran.
    fn register_ping(&self, nonce: u64, waiter: oneshot::Sender<()>) -> Result<()> {
        self.pending_pings
            .lock()
            .map_err(|_| anyhow::anyhow!("Ping registry poisoned"))?
            .insert(nonce, waiter);
        if !self.reading.load(Ordering::Acquire) {
            self.forget_ping(nonce);
            anyhow::bail!("Connection closed before ping {nonce} was sent");
        }
        Ok(())
    }

    fn resolve_ping(&self, nonce: u64) {
        let waiter = self
            .pending_pings
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&nonce));
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!(nonce, "Pong for unknown or expired ping"),
        }
    }

    fn forget_ping(&self, nonce: u64) {
        if let Ok(mut pending) = self.pending_pings.lock() {
            pending.remove(&nonce);
        }
    }

    fn fail_pending_pings(&self) {
        if let Ok(mut pending) = self.pending_pings.lock() {
            pending.clear();
        }
    }
}

/// Removes a ping waiter when the caller gives up (e.g. on timeout).
struct PendingPing<'a> {
    shared: &'a Shared,
    nonce: u64,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        self.shared.forget_ping(self.nonce);
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::Sender<Message>, shared: Arc<Shared>) {
    loop {
        let frame = match recv_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    warn!(error = %e, "TCP read failed, dropping connection");
                }
                break;
            }
        };

        match frame {
            Frame::Message { message } => {
                if inbound.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping reader");
                    break;
                }
            }
            Frame::Ping { nonce } => {
                if let Err(e) = shared.write(&Frame::Pong { nonce }).await {
                    warn!(error = %e, nonce, "Failed to answer peer ping");
                }
            }
            Frame::Pong { nonce } => shared.resolve_ping(nonce),
            Frame::Close => {
                debug!("Peer closed the connection");
                break;
            }
        }
    }

    shared.reading.store(false, Ordering::Release);
    shared.fail_pending_pings();
}

/// Connection handle for a TCP endpoint.
pub struct TcpConnection {
    shared: Arc<Shared>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    peer: String,
}

impl TcpConnection {
    /// Remote address of the connection.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, msg: &Message) -> Result<()> {
        anyhow::ensure!(self.is_alive(), "Connection to {} is closed", self.peer);
        self.shared
            .write(&Frame::Message {
                message: msg.clone(),
            })
            .await
            .with_context(|| format!("Failed to send message {} to {}", msg.id, self.peer))
    }

    async fn ping(&self) -> Result<()> {
        anyhow::ensure!(self.is_alive(), "Connection to {} is closed", self.peer);

        let nonce = self.shared.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.register_ping(nonce, tx)?;
        let _guard = PendingPing {
            shared: &self.shared,
            nonce,
        };

        self.shared
            .write(&Frame::Ping { nonce })
            .await
            .context("Failed to send ping")?;

        rx.await
            .map_err(|_| anyhow::anyhow!("Connection closed before pong {nonce} arrived"))
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = send_frame(&mut *writer, &Frame::Close).await {
                debug!(error = %e, "Could not send close frame");
            }
            writer.shutdown().await.context("Failed to shut down TCP stream")
        };

        let reader_task = self.reader_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = reader_task {
            task.abort();
        }
        self.shared.fail_pending_pings();

        debug!(peer = %self.peer, "TCP connection closed");
        result
    }

    fn is_alive(&self) -> bool {
        self.shared.reading.load(Ordering::Acquire) && !self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}
