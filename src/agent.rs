//! Relay agent lifecycle.
//!
//! The agent owns one connection to its endpoint and one listener task.
//! The listener waits on either the shutdown signal or the next inbound
//! message, handles messages one at a time in arrival order, and sends
//! each handler reply back over the same connection.
//!
//! Shutdown is sequenced: signal the listener, wait for it to exit (bounded
//! by `shutdown_timeout`, then aborted), and only then close the
//! connection. Whoever moves the running resources out of the lifecycle
//! lock owns the close, so it happens exactly once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{AgentConfig, Endpoint};
use crate::error::{RelayError, Result};
use crate::handler::{EchoHandler, MessageHandler};
use crate::message::Message;
use crate::observer::{AgentEvent, AgentObserver, TracingObserver};
use crate::transport::{self, Connection, Connector};

/// Observable lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Resources that exist only while the agent is started.
struct Running {
    connection: Arc<dyn Connection>,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
}

impl Running {
    /// Signal the listener, wait for it, then close the connection.
    async fn shutdown(self, timeout: Duration, observer: &dyn AgentObserver) {
        let Self {
            connection,
            shutdown,
            mut listener,
        } = self;

        let _ = shutdown.send(true);

        match tokio::time::timeout(timeout, &mut listener).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => observer.observe(&AgentEvent::ListenerFailed {
                error: e.to_string(),
            }),
            Err(_) => {
                listener.abort();
                let _ = listener.await;
                observer.observe(&AgentEvent::ListenerAborted { after: timeout });
            }
        }

        if let Err(e) = connection.close().await {
            observer.observe(&AgentEvent::CloseFailed {
                error: format!("{e:#}"),
            });
        }
    }
}

enum Lifecycle {
    Created,
    /// `start()` is waiting for the connector.
    Connecting,
    Started(Running),
    /// A shutdown is in progress; flips to `true` once the connection is closed.
    Stopping(watch::Receiver<bool>),
    Stopped,
}

impl Lifecycle {
    const fn state(&self) -> AgentState {
        match self {
            Self::Created | Self::Connecting => AgentState::Created,
            Self::Started(_) => AgentState::Started,
            Self::Stopping(_) | Self::Stopped => AgentState::Stopped,
        }
    }
}

type SharedLifecycle = Arc<Mutex<Lifecycle>>;

fn lock(lifecycle: &SharedLifecycle) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by `start()` while connecting. Dropping it before `finish` (error
/// return or a cancelled future) puts the agent back to `Created`.
struct ConnectingGuard<'a> {
    lifecycle: &'a SharedLifecycle,
}

impl<'a> ConnectingGuard<'a> {
    fn enter(lifecycle: &'a SharedLifecycle) -> Result<Self> {
        let mut current = lock(lifecycle);
        if !matches!(*current, Lifecycle::Created) {
            return Err(RelayError::InvalidState {
                operation: "start",
                state: current.state(),
            });
        }
        *current = Lifecycle::Connecting;
        Ok(Self { lifecycle })
    }

    /// Install the running resources. `launch` runs under the lifecycle lock
    /// so a listener that exits immediately still finds `Started`.
    fn finish(self, launch: impl FnOnce() -> Running) {
        let mut current = lock(self.lifecycle);
        *current = Lifecycle::Started(launch());
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut current = lock(self.lifecycle);
        if matches!(*current, Lifecycle::Connecting) {
            *current = Lifecycle::Created;
        }
    }
}

/// Owned by whoever runs the shutdown. Dropping it marks the agent
/// `Stopped` and releases callers waiting in `stop()`.
struct StoppingGuard {
    lifecycle: SharedLifecycle,
    done: watch::Sender<bool>,
}

impl Drop for StoppingGuard {
    fn drop(&mut self) {
        *lock(&self.lifecycle) = Lifecycle::Stopped;
        let _ = self.done.send(true);
    }
}

enum StopStep {
    /// Caller owns the shutdown.
    Owner(Running, StoppingGuard),
    /// Another caller owns it; wait for the flag.
    Wait(watch::Receiver<bool>),
    NotRunning(AgentState),
}

fn begin_stop(shared: &SharedLifecycle) -> StopStep {
    let mut lifecycle = lock(shared);
    match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
        Lifecycle::Started(running) => {
            let (done, waiter) = watch::channel(false);
            *lifecycle = Lifecycle::Stopping(waiter);
            StopStep::Owner(
                running,
                StoppingGuard {
                    lifecycle: Arc::clone(shared),
                    done,
                },
            )
        }
        Lifecycle::Stopping(waiter) => {
            let step = StopStep::Wait(waiter.clone());
            *lifecycle = Lifecycle::Stopping(waiter);
            step
        }
        other => {
            let state = other.state();
            *lifecycle = other;
            StopStep::NotRunning(state)
        }
    }
}

/// Builder for [`RelayAgent`].
pub struct RelayAgentBuilder {
    config: AgentConfig,
    connector: Option<Arc<dyn Connector>>,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn AgentObserver>,
}

impl RelayAgentBuilder {
    /// Use `connector` instead of the default for the endpoint scheme.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Handle inbound messages with `handler` (default: [`EchoHandler`]).
    #[must_use]
    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Report events to `observer` (default: [`TracingObserver`]).
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration and set up the client.
    ///
    /// No connection is opened until [`RelayAgent::start`].
    pub fn build(self) -> Result<RelayAgent> {
        let endpoint = self.config.validate()?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => transport::connector_for(&endpoint)?,
        };

        Ok(RelayAgent {
            config: self.config,
            endpoint,
            connector,
            handler: self.handler,
            observer: self.observer,
            lifecycle: Arc::new(Mutex::new(Lifecycle::Created)),
        })
    }
}

/// Relays inbound messages from an endpoint to a handler and sends the
/// handler's replies back.
pub struct RelayAgent {
    config: AgentConfig,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn AgentObserver>,
    lifecycle: SharedLifecycle,
}

impl RelayAgent {
    /// Start building an agent for `config`.
    pub fn builder(config: AgentConfig) -> RelayAgentBuilder {
        RelayAgentBuilder {
            config,
            connector: None,
            handler: Arc::new(EchoHandler::new()),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Echo agent with the default transport and tracing observer.
    pub fn new(config: AgentConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        lock(&self.lifecycle).state()
    }

    /// Connect and spawn the listener.
    ///
    /// Only valid in the `Created` state. On failure the agent stays
    /// `Created` and `start` may be called again.
    pub async fn start(&self) -> Result<()> {
        let connecting = ConnectingGuard::enter(&self.lifecycle)?;

        let endpoint = self.endpoint.to_string();
        self.observer.observe(&AgentEvent::Starting {
            endpoint: endpoint.clone(),
        });

        let connect = self
            .connector
            .connect(&self.endpoint, self.config.inbound_capacity);
        let link = match tokio::time::timeout(self.config.timeout, connect).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.fail_start(&endpoint, RelayError::Connection(e))),
            Err(_) => {
                let err = RelayError::Timeout {
                    operation: "connect",
                    after: self.config.timeout,
                };
                return Err(self.fail_start(&endpoint, err));
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Listener {
            connection: Arc::clone(&link.connection),
            inbound: link.inbound,
            handler: Arc::clone(&self.handler),
            observer: Arc::clone(&self.observer),
            shutdown: shutdown_rx,
            lifecycle: Arc::clone(&self.lifecycle),
        };
        connecting.finish(|| Running {
            connection: link.connection,
            shutdown: shutdown_tx,
            listener: tokio::spawn(listener.run()),
        });

        self.observer.observe(&AgentEvent::Started { endpoint });
        Ok(())
    }

    fn fail_start(&self, endpoint: &str, err: RelayError) -> RelayError {
        self.observer.observe(&AgentEvent::StartFailed {
            endpoint: endpoint.to_string(),
            error: err.to_string(),
        });
        err
    }

    /// Stop the listener and close the connection.
    ///
    /// Returns once the listener has exited and the connection is closed,
    /// also for callers that arrive while another shutdown is in progress.
    /// A no-op when already stopped; `NotConnected` if never started.
    pub async fn stop(&self) -> Result<()> {
        match begin_stop(&self.lifecycle) {
            StopStep::Owner(running, stopping) => {
                self.observer.observe(&AgentEvent::Stopping);
                running
                    .shutdown(self.config.shutdown_timeout, &*self.observer)
                    .await;
                drop(stopping);
                self.observer.observe(&AgentEvent::Stopped);
                Ok(())
            }
            StopStep::Wait(mut done) => {
                let _ = done.wait_for(|closed| *closed).await;
                Ok(())
            }
            StopStep::NotRunning(AgentState::Stopped) => Ok(()),
            StopStep::NotRunning(state) => Err(RelayError::NotConnected(state)),
        }
    }

    /// Ping the endpoint and return the round-trip time.
    pub async fn ping(&self) -> Result<Duration> {
        let connection = {
            let lifecycle = lock(&self.lifecycle);
            match &*lifecycle {
                Lifecycle::Started(running) => Arc::clone(&running.connection),
                other => return Err(RelayError::NotConnected(other.state())),
            }
        };

        let sent_at = Instant::now();
        match tokio::time::timeout(self.config.timeout, connection.ping()).await {
            Ok(Ok(())) => Ok(sent_at.elapsed()),
            Ok(Err(e)) => Err(RelayError::Connection(e)),
            Err(_) => Err(RelayError::Timeout {
                operation: "ping",
                after: self.config.timeout,
            }),
        }
    }
}

impl Drop for RelayAgent {
    fn drop(&mut self) {
        // Cannot await the close here; the listener exits on the signal and
        // the transport drops with the last handle.
        if let Lifecycle::Started(running) = &*lock(&self.lifecycle) {
            let _ = running.shutdown.send(true);
        }
    }
}

/// State owned by the listener task.
struct Listener {
    connection: Arc<dyn Connection>,
    inbound: mpsc::Receiver<Message>,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn AgentObserver>,
    shutdown: watch::Receiver<bool>,
    lifecycle: SharedLifecycle,
}

impl Listener {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.observer.observe(&AgentEvent::ListenerStopped);
                    return;
                }
                next = self.inbound.recv() => match next {
                    Some(msg) => self.dispatch(msg).await,
                    None => {
                        self.connection_lost().await;
                        return;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, msg: Message) {
        self.observer.observe(&AgentEvent::MessageReceived {
            id: msg.id.clone(),
            kind: msg.kind,
        });

        let reply = match self.handler.handle(&msg).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                self.observer.observe(&AgentEvent::HandlerFailed {
                    id: msg.id,
                    error: format!("{e:#}"),
                });
                return;
            }
        };

        match self.connection.send(&reply).await {
            Ok(()) => self
                .observer
                .observe(&AgentEvent::ReplySent { id: reply.id }),
            Err(e) => self.observer.observe(&AgentEvent::SendFailed {
                id: reply.id,
                error: RelayError::Send(e).to_string(),
            }),
        }
    }

    /// The inbound stream ended without a shutdown signal.
    async fn connection_lost(&self) {
        let StopStep::Owner(running, stopping) = begin_stop(&self.lifecycle) else {
            // stop() already owns the shutdown.
            return;
        };

        self.observer.observe(&AgentEvent::ConnectionLost);

        // Dropping our own join handle detaches this task.
        if let Err(e) = running.connection.close().await {
            self.observer.observe(&AgentEvent::CloseFailed {
                error: format!("{e:#}"),
            });
        }
        drop(stopping);
        self.observer.observe(&AgentEvent::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::observer::RecordingObserver;
    use crate::transport::{recv_frame, send_frame, Frame, Link, MemoryConnector, MemoryPeer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    fn test_config() -> AgentConfig {
        AgentConfig::new("test://localhost").with_timeout(Duration::from_secs(5))
    }

    struct Harness {
        agent: RelayAgent,
        connector: Arc<MemoryConnector>,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
        observer: Arc<RecordingObserver>,
    }

    fn harness_with(config: AgentConfig, handler: impl MessageHandler + 'static) -> Harness {
        let (connector, peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let observer = Arc::new(RecordingObserver::new());
        let agent = RelayAgent::builder(config)
            .connector(connector.clone())
            .handler(handler)
            .observer(observer.clone())
            .build()
            .unwrap();
        Harness {
            agent,
            connector,
            peers,
            observer,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), EchoHandler::new())
    }

    async fn started(h: &mut Harness) -> MemoryPeer {
        h.agent.start().await.unwrap();
        h.peers.recv().await.unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Fails on content "fail", echoes everything else.
    struct PickyHandler;

    #[async_trait]
    impl MessageHandler for PickyHandler {
        async fn handle(&self, msg: &Message) -> anyhow::Result<Option<Message>> {
            anyhow::ensure!(msg.content != "fail", "refusing to handle {}", msg.id);
            Ok(Some(Message::response_to(msg, msg.content.clone())))
        }
    }

    /// Sleeps before replying; signals entry and completion.
    struct SlowHandler {
        delay: Duration,
        entered: Arc<Notify>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, msg: &Message) -> anyhow::Result<Option<Message>> {
            self.entered.notify_one();
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(Some(Message::response_to(msg, "done")))
        }
    }

    /// Never completes a connect.
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _endpoint: &Endpoint, _capacity: usize) -> anyhow::Result<Link> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn echo_round_trip_then_double_stop() {
        let mut h = harness();
        assert_eq!(h.agent.state(), AgentState::Created);

        let mut peer = started(&mut h).await;
        assert_eq!(h.agent.state(), AgentState::Started);

        peer.inject(Message::new("abc", "hello", MessageType::Request))
            .await
            .unwrap();
        let reply = peer.next_outbound().await.unwrap();
        assert_eq!(reply, Message::new("abc", "hello", MessageType::Response));

        assert_ok!(h.agent.stop().await);
        assert_ok!(h.agent.stop().await);
        assert_eq!(h.agent.state(), AgentState::Stopped);
        assert!(peer.is_closed());

        let events = h.observer.events();
        assert_eq!(
            events.iter().filter(|e| **e == AgentEvent::Stopped).count(),
            1
        );
        assert!(h.observer.saw(&AgentEvent::ListenerStopped));
    }

    #[tokio::test]
    async fn empty_endpoint_is_configuration_error() {
        let result = RelayAgent::new(AgentConfig::new(""));
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }

    #[tokio::test]
    async fn malformed_endpoint_is_configuration_error() {
        let result = RelayAgent::new(AgentConfig::new("not an endpoint"));
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }

    #[tokio::test]
    async fn memory_endpoint_without_connector_fails_setup() {
        let result = RelayAgent::new(test_config());
        assert!(matches!(result, Err(RelayError::ConnectionSetup(_))));
    }

    #[tokio::test]
    async fn failed_start_stays_created_and_can_retry() {
        let mut h = harness();
        h.connector.set_refusing(true);

        let err = h.agent.start().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
        assert_eq!(h.agent.state(), AgentState::Created);
        assert!(h
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::StartFailed { .. })));

        h.connector.set_refusing(false);
        let _peer = started(&mut h).await;
        assert_eq!(h.agent.state(), AgentState::Started);
        h.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connect_timeout_is_timeout_error() {
        let agent = RelayAgent::builder(test_config().with_timeout(Duration::from_millis(20)))
            .connector(Arc::new(HangingConnector))
            .build()
            .unwrap();

        let err = agent.start().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Timeout {
                operation: "connect",
                ..
            }
        ));
        assert_eq!(agent.state(), AgentState::Created);
    }

    #[tokio::test]
    async fn start_outside_created_is_invalid() {
        let mut h = harness();
        let _peer = started(&mut h).await;

        let err = h.agent.start().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidState {
                state: AgentState::Started,
                ..
            }
        ));

        h.agent.stop().await.unwrap();
        let err = h.agent.start().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidState {
                state: AgentState::Stopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn replies_follow_arrival_order() {
        let mut h = harness();
        let mut peer = started(&mut h).await;

        for (id, content) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
            peer.inject(Message::new(id, content, MessageType::Request))
                .await
                .unwrap();
        }

        for (id, content) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
            let reply = peer.next_outbound().await.unwrap();
            assert_eq!(reply.id, id);
            assert_eq!(reply.content, content);
            assert_eq!(reply.kind, MessageType::Response);
        }

        h.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn misuse_before_start_is_not_connected() {
        let h = harness();

        assert!(matches!(
            h.agent.ping().await,
            Err(RelayError::NotConnected(AgentState::Created))
        ));
        assert!(matches!(
            h.agent.stop().await,
            Err(RelayError::NotConnected(AgentState::Created))
        ));
        assert_eq!(h.agent.state(), AgentState::Created);
    }

    #[tokio::test]
    async fn ping_after_stop_is_not_connected() {
        let mut h = harness();
        let _peer = started(&mut h).await;
        h.agent.stop().await.unwrap();

        assert!(matches!(
            h.agent.ping().await,
            Err(RelayError::NotConnected(AgentState::Stopped))
        ));
    }

    #[tokio::test]
    async fn ping_reports_round_trip() {
        let mut h = harness();
        let _peer = started(&mut h).await;

        let rtt = assert_ok!(h.agent.ping().await);
        assert!(rtt < Duration::from_secs(5));

        h.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn slow_ping_times_out() {
        let (connector, mut peers) = MemoryConnector::new();
        let agent = RelayAgent::builder(test_config().with_timeout(Duration::from_millis(50)))
            .connector(Arc::new(connector.with_ping_delay(Duration::from_secs(10))))
            .build()
            .unwrap();
        agent.start().await.unwrap();
        let _peer = peers.recv().await.unwrap();

        let err = assert_err!(agent.ping().await);
        assert!(matches!(
            err,
            RelayError::Timeout {
                operation: "ping",
                ..
            }
        ));
        assert_eq!(agent.state(), AgentState::Started);

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_listener() {
        let mut h = harness_with(test_config(), PickyHandler);
        let mut peer = started(&mut h).await;

        peer.inject(Message::new("bad", "fail", MessageType::Request))
            .await
            .unwrap();
        peer.inject(Message::new("good", "ok", MessageType::Request))
            .await
            .unwrap();

        let reply = peer.next_outbound().await.unwrap();
        assert_eq!(reply.id, "good");
        assert!(h
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::HandlerFailed { id, .. } if id == "bad")));
        assert_eq!(h.agent.state(), AgentState::Started);

        h.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_failure_is_reported_not_fatal() {
        let mut h = harness();
        let mut peer = started(&mut h).await;
        peer.stop_reading();

        peer.inject(Message::new("lost", "reply", MessageType::Request))
            .await
            .unwrap();

        let observer = h.observer.clone();
        wait_until(|| {
            observer
                .events()
                .iter()
                .any(|e| matches!(e, AgentEvent::SendFailed { id, .. } if id == "lost"))
        })
        .await;
        assert_eq!(h.agent.state(), AgentState::Started);

        h.agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connection_loss_stops_agent() {
        let mut h = harness();
        let mut peer = started(&mut h).await;

        peer.disconnect();

        let agent = &h.agent;
        wait_until(|| agent.state() == AgentState::Stopped).await;
        wait_until(|| peer.is_closed()).await;
        assert!(h.observer.saw(&AgentEvent::ConnectionLost));

        assert_ok!(h.agent.stop().await);
        assert!(matches!(
            h.agent.ping().await,
            Err(RelayError::NotConnected(AgentState::Stopped))
        ));
    }

    #[tokio::test]
    async fn stop_lets_in_flight_handler_finish_before_close() {
        let entered = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let handler = SlowHandler {
            delay: Duration::from_millis(100),
            entered: entered.clone(),
            finished: finished.clone(),
        };
        let mut h = harness_with(test_config(), handler);
        let mut peer = started(&mut h).await;

        peer.inject(Message::new("slow", "x", MessageType::Request))
            .await
            .unwrap();
        entered.notified().await;

        h.agent.stop().await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(peer.try_next_outbound().unwrap().id, "slow");
        assert!(peer.is_closed());
        assert!(!h
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, AgentEvent::ListenerAborted { .. })));
    }

    #[tokio::test]
    async fn stop_aborts_listener_after_shutdown_timeout() {
        let entered = Arc::new(Notify::new());
        let handler = SlowHandler {
            delay: Duration::from_secs(30),
            entered: entered.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let config = test_config().with_shutdown_timeout(Duration::from_millis(20));
        let mut h = harness_with(config, handler);
        let peer = started(&mut h).await;

        peer.inject(Message::new("stuck", "x", MessageType::Request))
            .await
            .unwrap();
        entered.notified().await;

        tokio::time::timeout(Duration::from_secs(5), h.agent.stop())
            .await
            .expect("stop must be bounded")
            .unwrap();

        assert_eq!(h.agent.state(), AgentState::Stopped);
        assert!(peer.is_closed());
        assert!(h.observer.saw(&AgentEvent::ListenerAborted {
            after: Duration::from_millis(20)
        }));
    }

    #[tokio::test]
    async fn concurrent_stops_close_once() {
        let mut h = harness();
        let _peer = started(&mut h).await;

        let (a, b) = tokio::join!(h.agent.stop(), h.agent.stop());
        assert_ok!(a);
        assert_ok!(b);

        let events = h.observer.events();
        assert_eq!(
            events.iter().filter(|e| **e == AgentEvent::Stopping).count(),
            1
        );
    }

    #[tokio::test]
    async fn second_stop_waits_for_first() {
        let entered = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let handler = SlowHandler {
            delay: Duration::from_millis(300),
            entered: entered.clone(),
            finished: finished.clone(),
        };
        let mut h = harness_with(test_config(), handler);
        let peer = started(&mut h).await;

        peer.inject(Message::new("slow", "x", MessageType::Request))
            .await
            .unwrap();
        entered.notified().await;

        let (first, (second, finished_seen, closed_seen)) = tokio::join!(h.agent.stop(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let second = h.agent.stop().await;
            (second, finished.load(Ordering::SeqCst), peer.is_closed())
        });

        assert_ok!(first);
        assert_ok!(second);
        assert!(finished_seen, "second stop returned before the listener exited");
        assert!(closed_seen, "second stop returned before the connection closed");
        assert_eq!(h.agent.state(), AgentState::Stopped);
    }

    /// Hangs on the first connect, then hands out memory links.
    struct HangOnceConnector {
        hung: AtomicBool,
        inner: MemoryConnector,
    }

    #[async_trait]
    impl Connector for HangOnceConnector {
        async fn connect(&self, endpoint: &Endpoint, capacity: usize) -> anyhow::Result<Link> {
            if !self.hung.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.connect(endpoint, capacity).await
        }
    }

    #[tokio::test]
    async fn cancelled_start_can_be_retried() {
        let (inner, mut peers) = MemoryConnector::new();
        let agent = RelayAgent::builder(test_config())
            .connector(Arc::new(HangOnceConnector {
                hung: AtomicBool::new(false),
                inner,
            }))
            .build()
            .unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), agent.start()).await;
        assert!(cancelled.is_err(), "first connect should still be pending");

        assert_eq!(agent.state(), AgentState::Created);
        assert!(matches!(
            agent.stop().await,
            Err(RelayError::NotConnected(AgentState::Created))
        ));

        assert_ok!(agent.start().await);
        assert_eq!(agent.state(), AgentState::Started);
        let mut peer = peers.recv().await.unwrap();

        peer.inject(Message::new("after-retry", "hi", MessageType::Request))
            .await
            .unwrap();
        let reply = peer.next_outbound().await.unwrap();
        assert_eq!(reply.id, "after-retry");

        assert_ok!(agent.stop().await);
    }

    #[tokio::test]
    async fn silent_handler_sends_nothing() {
        struct Sink;

        #[async_trait]
        impl MessageHandler for Sink {
            async fn handle(&self, _msg: &Message) -> anyhow::Result<Option<Message>> {
                Ok(None)
            }
        }

        let mut h = harness_with(test_config(), Sink);
        let mut peer = started(&mut h).await;

        peer.inject(Message::event("tick")).await.unwrap();
        let observer = h.observer.clone();
        wait_until(|| {
            observer
                .events()
                .iter()
                .any(|e| matches!(e, AgentEvent::MessageReceived { .. }))
        })
        .await;

        h.agent.stop().await.unwrap();
        assert!(peer.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn echo_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let msg = Message::new("abc", "hello", MessageType::Request);
            send_frame(&mut stream, &Frame::Message { message: msg })
                .await
                .unwrap();

            let mut frames = Vec::new();
            while let Ok(frame) = recv_frame(&mut stream).await {
                match frame {
                    Frame::Ping { nonce } => {
                        send_frame(&mut stream, &Frame::Pong { nonce }).await.unwrap();
                    }
                    Frame::Close => {
                        frames.push(frame);
                        break;
                    }
                    other => frames.push(other),
                }
            }
            frames
        });

        let config = AgentConfig::new(format!("tcp://{addr}")).with_timeout(Duration::from_secs(5));
        let observer = Arc::new(RecordingObserver::new());
        let agent = RelayAgent::builder(config)
            .observer(observer.clone())
            .build()
            .unwrap();
        agent.start().await.unwrap();
        assert_ok!(agent.ping().await);

        let sent = AgentEvent::ReplySent { id: "abc".into() };
        wait_until(|| observer.saw(&sent)).await;
        agent.stop().await.unwrap();

        let frames = server.await.unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Message {
                    message: Message::new("abc", "hello", MessageType::Response),
                },
                Frame::Close,
            ]
        );
    }

    #[tokio::test]
    async fn tcp_unreachable_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = RelayAgent::new(AgentConfig::new(format!("tcp://{addr}"))).unwrap();
        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
        assert_eq!(agent.state(), AgentState::Created);
    }
}
