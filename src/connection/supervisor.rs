//! Connection supervisor
//!
//! A single actor task owns every state transition. Callers hold a cheap
//! [`ConnectionSupervisor`] handle that queues commands to the actor and
//! reads a shared snapshot of the current state.
//!
//! Every handshake, link, receive loop and reconnect timer is tagged with
//! the generation it was started under. Anything reporting back from an
//! older generation is discarded, so a late timer or read failure can
//! never resurrect a connection that was deliberately closed.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::state::ConnectionState;
use super::transport::{Connector, Frame, FrameSink, FrameStream, Link, NORMAL_CLOSURE};
use crate::config::ConnectionSettings;
use crate::error::{Error, ErrorCode, Result};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Runtime parameters of the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Endpoint to connect to
    pub url: Url,

    /// Fixed delay before a reconnect attempt
    pub reconnect_delay: Duration,

    /// Interval between liveness pings while connected
    pub ping_interval: Duration,

    /// Upper bound on a single handshake
    pub connect_timeout: Duration,
}

impl SupervisorConfig {
    /// Build from the `[connection]` section
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self> {
        let url = Url::parse(&settings.url).map_err(|e| {
            Error::config_field_invalid("connection.url", format!("'{}': {}", settings.url, e))
        })?;

        Ok(Self {
            url,
            reconnect_delay: settings.reconnect_delay(),
            ping_interval: settings.ping_interval(),
            connect_timeout: settings.connect_timeout(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The connection state changed
    StateChanged(ConnectionState),

    /// A text frame arrived, raw payload
    MessageReceived(String),

    /// A recovered failure (handshake, transmit or read), for diagnostics
    Fault { code: ErrorCode, message: String },
}

// ─────────────────────────────────────────────────────────────────
// Shared Snapshot
// ─────────────────────────────────────────────────────────────────

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

struct ActiveLink {
    generation: u64,
    sink: SharedSink,
}

/// State written only by the actor, read by handles
struct Shared {
    state: ConnectionState,
    reachable: bool,
    link: Option<ActiveLink>,
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

enum Command {
    Connect,
    Disconnect,
    Reachability(bool),
    Shutdown,
    HandshakeDone { generation: u64, result: Result<Link> },
    LinkLost { generation: u64, error: Error },
    ReconnectDue { generation: u64 },
}

// ─────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────

/// Handle to the connection supervisor actor
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<RwLock<Shared>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionSupervisor {
    /// Spawn the actor and return a handle plus the actor's join handle
    ///
    /// The supervisor starts `Disconnected` and reachable. The actor runs
    /// until [`shutdown`](Self::shutdown) is called.
    pub fn spawn(
        config: SupervisorConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(RwLock::new(Shared {
            state: ConnectionState::Disconnected,
            reachable: true,
            link: None,
        }));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            backoff: Constant::new(config.reconnect_delay),
            config,
            connector,
            shared: shared.clone(),
            events,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            generation: 0,
            handshake: None,
            reconnect: None,
            link_cancel: None,
        };
        let handle = tokio::spawn(actor.run());

        (Self { shared, cmd_tx }, handle)
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::ChannelClosed("connection supervisor"))
    }

    /// Open the connection unless already connected, connecting or suspended
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Close the connection and cancel any pending reconnect
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Feed a reachability observation
    pub fn set_reachable(&self, reachable: bool) -> Result<()> {
        self.command(Command::Reachability(reachable))
    }

    /// Close the connection and stop the actor
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    /// Last reachability observation
    pub fn is_reachable(&self) -> bool {
        self.shared.read().reachable
    }

    /// Send one text frame over the active link
    ///
    /// Fails without touching the transport unless the state is
    /// `Connected`: `Unreachable` while suspended, `NotConnected` otherwise.
    /// A transport failure demotes the connection and schedules a reconnect.
    pub async fn transmit(&self, payload: String) -> Result<()> {
        let (generation, sink) = {
            let shared = self.shared.read();
            match (&shared.link, shared.state) {
                (Some(link), ConnectionState::Connected) => (link.generation, link.sink.clone()),
                (_, ConnectionState::OfflineSuspended) => return Err(Error::Unreachable),
                (_, state) => return Err(Error::NotConnected { state }),
            }
        };

        let result = sink.lock().await.send_text(payload).await;
        if let Err(e) = result {
            let message = e.to_string();
            let _ = self.cmd_tx.send(Command::LinkLost { generation, error: e });
            return Err(Error::transmit_failed(message));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────

struct Actor {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<RwLock<Shared>>,
    events: mpsc::Sender<SupervisorEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    backoff: Constant,
    generation: u64,
    handshake: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    link_cancel: Option<watch::Sender<bool>>,
}

impl Actor {
    async fn run(mut self) {
        info!(url = %self.config.url, "Connection supervisor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Connect => self.on_connect().await,
                Command::Disconnect => {
                    self.stop_everything();
                    self.set_state(ConnectionState::Disconnected).await;
                }
                Command::Reachability(reachable) => self.on_reachability(reachable).await,
                Command::Shutdown => {
                    self.stop_everything();
                    self.set_state(ConnectionState::Disconnected).await;
                    break;
                }
                Command::HandshakeDone { generation, result } => {
                    self.on_handshake_done(generation, result).await
                }
                Command::LinkLost { generation, error } => self.on_link_lost(generation, error).await,
                Command::ReconnectDue { generation } => self.on_reconnect_due(generation).await,
            }
        }

        info!("Connection supervisor stopped");
    }

    async fn on_connect(&mut self) {
        let (state, reachable) = {
            let shared = self.shared.read();
            (shared.state, shared.reachable)
        };

        if state != ConnectionState::Disconnected {
            debug!(state = %state, "Connect ignored");
            return;
        }
        if !reachable {
            debug!("Connect while unreachable; suspending");
            self.set_state(ConnectionState::OfflineSuspended).await;
            return;
        }

        self.start_connect().await;
    }

    async fn on_reachability(&mut self, reachable: bool) {
        let state = {
            let mut shared = self.shared.write();
            shared.reachable = reachable;
            shared.state
        };

        if !reachable {
            if state != ConnectionState::OfflineSuspended {
                info!("Network unreachable; suspending connection");
                self.stop_everything();
                self.set_state(ConnectionState::OfflineSuspended).await;
            }
        } else if state == ConnectionState::OfflineSuspended {
            info!("Network reachable again; reconnecting");
            self.set_state(ConnectionState::Disconnected).await;
            self.start_connect().await;
        }
    }

    async fn on_handshake_done(&mut self, generation: u64, result: Result<Link>) {
        if generation == self.generation {
            self.handshake = None;
        }

        if generation != self.generation || self.shared.read().state != ConnectionState::Connecting {
            if let Ok(link) = result {
                debug!(generation, "Discarding stale handshake");
                close_link(Arc::new(Mutex::new(link.sink)));
            }
            return;
        }

        match result {
            Ok(link) => {
                self.backoff.reset();
                let sink: SharedSink = Arc::new(Mutex::new(link.sink));
                let (cancel_tx, cancel_rx) = watch::channel(false);
                {
                    let mut shared = self.shared.write();
                    shared.state = ConnectionState::Connected;
                    shared.link = Some(ActiveLink {
                        generation,
                        sink: sink.clone(),
                    });
                }
                self.link_cancel = Some(cancel_tx);

                info!(url = %self.config.url, generation, "Connected");
                self.emit(SupervisorEvent::StateChanged(ConnectionState::Connected)).await;

                tokio::spawn(receive_loop(
                    generation,
                    link.stream,
                    cancel_rx.clone(),
                    self.events.clone(),
                    self.cmd_tx.clone(),
                ));
                tokio::spawn(liveness_probe(sink, self.config.ping_interval, cancel_rx));
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "Handshake failed");
                self.emit_fault(&e).await;
                self.set_state(ConnectionState::Disconnected).await;
                self.schedule_reconnect();
            }
        }
    }

    async fn on_link_lost(&mut self, generation: u64, error: Error) {
        let current = self
            .shared
            .read()
            .link
            .as_ref()
            .map(|link| link.generation == generation)
            .unwrap_or(false);
        if !current || generation != self.generation {
            trace!(generation, "Ignoring loss of stale link");
            return;
        }

        warn!(error = %error, "Connection lost");
        self.emit_fault(&error).await;
        self.drop_link(false);
        self.set_state(ConnectionState::Disconnected).await;
        self.schedule_reconnect();
    }

    async fn on_reconnect_due(&mut self, generation: u64) {
        let pending = self.reconnect.take().is_some();
        let state = self.shared.read().state;

        if generation != self.generation || !pending || state != ConnectionState::Disconnected {
            debug!(generation, state = %state, "Reconnect no longer wanted");
            return;
        }

        debug!("Reconnecting");
        self.start_connect().await;
    }

    async fn start_connect(&mut self) {
        self.cancel_timers();
        self.generation += 1;
        let generation = self.generation;

        self.set_state(ConnectionState::Connecting).await;

        let connector = self.connector.clone();
        let url = self.config.url.clone();
        let connect_timeout = self.config.connect_timeout;
        let cmd_tx = self.cmd_tx.clone();

        self.handshake = Some(tokio::spawn(async move {
            debug!(url = %url, generation, "Opening connection");
            let result = match timeout(connect_timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout {
                    url: url.to_string(),
                    timeout_secs: connect_timeout.as_secs(),
                }),
            };
            let _ = cmd_tx.send(Command::HandshakeDone { generation, result });
        }));
    }

    fn schedule_reconnect(&mut self) {
        if !self.shared.read().reachable {
            debug!("Unreachable; no reconnect scheduled");
            return;
        }

        let delay = self.backoff.next_backoff().unwrap_or(self.config.reconnect_delay);
        let generation = self.generation;
        let cmd_tx = self.cmd_tx.clone();

        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        if let Some(previous) = self.reconnect.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::ReconnectDue { generation });
        })) {
            previous.abort();
        }
    }

    /// Cancel the handshake, the reconnect timer and the active link
    fn stop_everything(&mut self) {
        self.generation += 1;
        self.cancel_timers();
        self.drop_link(true);
    }

    fn cancel_timers(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
    }

    fn drop_link(&mut self, send_close: bool) {
        if let Some(cancel) = self.link_cancel.take() {
            let _ = cancel.send(true);
        }
        let link = self.shared.write().link.take();
        if let Some(link) = link {
            if send_close {
                close_link(link.sink);
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let previous = {
            let mut shared = self.shared.write();
            std::mem::replace(&mut shared.state, state)
        };
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            self.emit(SupervisorEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Event receiver dropped");
        }
    }

    async fn emit_fault(&self, error: &Error) {
        self.emit(SupervisorEvent::Fault {
            code: error.code(),
            message: error.to_string(),
        })
        .await;
    }
}

fn close_link(sink: SharedSink) {
    tokio::spawn(async move {
        if let Err(e) = sink.lock().await.close(NORMAL_CLOSURE).await {
            debug!(error = %e, "Close frame not sent");
        }
    });
}

// ─────────────────────────────────────────────────────────────────
// Link Tasks
// ─────────────────────────────────────────────────────────────────

async fn receive_loop(
    generation: u64,
    mut stream: Box<dyn FrameStream>,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::Sender<SupervisorEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            frame = stream.next_frame() => frame,
        };

        let error = match frame {
            Some(Ok(Frame::Text(text))) => {
                trace!(len = text.len(), "Text frame received");
                if events.send(SupervisorEvent::MessageReceived(text)).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Ok(Frame::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame");
                continue;
            }
            Some(Ok(Frame::Ping)) | Some(Ok(Frame::Pong)) => continue,
            Some(Ok(Frame::Close(code))) => {
                Error::transmit_failed(format!("closed by peer (code {:?})", code))
            }
            Some(Err(e)) => e,
            None => Error::transmit_failed("stream ended"),
        };

        if *cancel.borrow() {
            break;
        }
        let _ = cmd_tx.send(Command::LinkLost { generation, error });
        break;
    }

    trace!(generation, "Receive loop finished");
}

async fn liveness_probe(sink: SharedSink, every: Duration, mut cancel: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.lock().await.ping().await {
                    warn!(error = %e, "Liveness ping failed");
                } else {
                    trace!("Liveness ping sent");
                }
            }
        }
    }
}
