//! Chat client facade
//!
//! Wires the connection supervisor, the delivery coordinator and the
//! conversation store together and exposes a single event stream to the
//! UI layer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ConnectionSupervisor, Connector, SupervisorConfig, SupervisorEvent};
use crate::conversation::{ChatMessage, Conversation, ConversationStore, MessageStatus};
use crate::delivery::{
    DeliveryCoordinator, DeliveryEvent, FlushReport, OutboundMessage, QueueStore, RetryQueue, SendOutcome,
};
use crate::error::Result;
use crate::protocol::InboundMessage;

/// Events delivered to the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),

    /// A message arrived and was added to its conversation
    MessageReceived { chat_id: String, message: ChatMessage },

    /// A send was accepted and recorded locally
    MessagePending { chat_id: String, message: ChatMessage },

    MessageDelivered { chat_id: String, message_id: String },

    /// Show a failure indicator on this message
    MessageDeliveryFailed {
        chat_id: String,
        message_id: String,
        reason: String,
    },

    QueueDepthChanged(usize),

    /// Non-blocking user-facing notice
    Notice(String),

    /// Connectivity badge; shown only after the connection stayed down
    /// for longer than the configured delay
    ConnectivityBadge { visible: bool },
}

/// Handle to a running client
pub struct ChatClient {
    supervisor: ConnectionSupervisor,
    delivery: Arc<DeliveryCoordinator>,
    conversations: Arc<ConversationStore>,
    default_chat: String,
    supervisor_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl ChatClient {
    /// Build and start every component
    ///
    /// The client starts `Disconnected`; call [`connect`](Self::connect)
    /// to open the socket. An unreadable queue file is set aside and the
    /// client starts with an empty queue.
    pub fn start(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        store: Box<dyn QueueStore>,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let buffer = config.connection.event_buffer.max(1);
        let supervisor_config = SupervisorConfig::from_settings(&config.connection)?;

        let queue = Arc::new(RetryQueue::recover(store, config.delivery.max_queue_len));
        let initial_depth = queue.len();

        let (supervisor_tx, supervisor_rx) = mpsc::channel(buffer);
        let (supervisor, supervisor_task) =
            ConnectionSupervisor::spawn(supervisor_config, connector, supervisor_tx);

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let delivery = Arc::new(
            DeliveryCoordinator::new(Arc::new(supervisor.clone()), queue, delivery_tx)
                .with_sender(config.client_name()),
        );

        let conversations = Arc::new(ConversationStore::new());
        let default_chat = config.client.default_chat_id.clone();
        conversations.create_or_get(&default_chat);

        let (event_tx, event_rx) = mpsc::channel(buffer);
        let pump = EventPump {
            delivery: delivery.clone(),
            conversations: conversations.clone(),
            events: event_tx,
            default_chat: default_chat.clone(),
            badge_delay: Duration::from_millis(config.delivery.badge_delay_ms),
            badge_deadline: None,
            badge_visible: false,
        };
        let pump_task = tokio::spawn(pump.run(supervisor_rx, delivery_rx, initial_depth));

        info!(
            url = %config.connection.url,
            queued = initial_depth,
            "Chat client started"
        );

        Ok((
            Self {
                supervisor,
                delivery,
                conversations,
                default_chat,
                supervisor_task,
                pump_task,
            },
            event_rx,
        ))
    }

    pub fn connect(&self) -> Result<()> {
        self.supervisor.connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.supervisor.disconnect()
    }

    /// Feed a reachability observation from an external source
    pub fn set_reachable(&self, reachable: bool) -> Result<()> {
        self.supervisor.set_reachable(reachable)
    }

    pub fn is_reachable(&self) -> bool {
        self.supervisor.is_reachable()
    }

    /// Send to a conversation; never waits for the connection
    pub async fn send(&self, chat_id: &str, text: &str) -> Result<SendOutcome> {
        self.delivery.send(chat_id, text).await
    }

    /// Retry the queue now instead of waiting for a reconnect
    pub async fn flush(&self) -> FlushReport {
        self.delivery.flush().await
    }

    /// Give up on one queued message
    pub fn discard(&self, message_id: &str) -> Result<Option<OutboundMessage>> {
        self.delivery.discard(message_id)
    }

    /// Give up on every queued message
    pub fn clear_queue(&self) -> Result<usize> {
        self.delivery.clear_queue()
    }

    /// Drop a conversation's local history
    pub fn clear_conversation(&self, chat_id: &str) -> bool {
        self.conversations.clear(chat_id)
    }

    pub fn create_or_get_conversation(&self, chat_id: &str) -> Conversation {
        self.conversations.create_or_get(chat_id)
    }

    pub fn conversation(&self, chat_id: &str) -> Option<Conversation> {
        self.conversations.get(chat_id)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.list()
    }

    pub fn default_chat(&self) -> &str {
        &self.default_chat
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn queue_depth(&self) -> usize {
        self.delivery.queue_depth()
    }

    /// Supervisor handle, for wiring a reachability source
    pub fn supervisor(&self) -> ConnectionSupervisor {
        self.supervisor.clone()
    }

    /// Close the connection and stop all background tasks
    pub async fn shutdown(self) -> Result<()> {
        self.supervisor.shutdown()?;
        if let Err(e) = self.supervisor_task.await {
            warn!(error = %e, "Supervisor task ended abnormally");
        }

        let mut pump_task = self.pump_task;
        if tokio::time::timeout(Duration::from_secs(5), &mut pump_task).await.is_err() {
            debug!("Event pump still running; aborting");
            pump_task.abort();
        }

        info!("Chat client stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Event Pump
// ─────────────────────────────────────────────────────────────────

struct EventPump {
    delivery: Arc<DeliveryCoordinator>,
    conversations: Arc<ConversationStore>,
    events: mpsc::Sender<ClientEvent>,
    default_chat: String,
    badge_delay: Duration,
    badge_deadline: Option<Instant>,
    badge_visible: bool,
}

impl EventPump {
    async fn run(
        mut self,
        mut supervisor_rx: mpsc::Receiver<SupervisorEvent>,
        mut delivery_rx: mpsc::UnboundedReceiver<DeliveryEvent>,
        initial_depth: usize,
    ) {
        if initial_depth > 0 {
            self.emit(ClientEvent::QueueDepthChanged(initial_depth)).await;
        }

        loop {
            let deadline = self.badge_deadline;
            let badge_due = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = supervisor_rx.recv() => match event {
                    Some(event) => self.on_supervisor_event(event).await,
                    None => break,
                },
                Some(event) = delivery_rx.recv() => self.on_delivery_event(event).await,
                _ = badge_due => {
                    self.badge_deadline = None;
                    if !self.badge_visible {
                        self.badge_visible = true;
                        self.emit(ClientEvent::ConnectivityBadge { visible: true }).await;
                    }
                }
            }
        }

        // Settle anything still buffered from the delivery side
        while let Ok(event) = delivery_rx.try_recv() {
            self.on_delivery_event(event).await;
        }
        debug!("Event pump stopped");
    }

    async fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::StateChanged(state) => {
                self.update_badge(state).await;
                self.emit(ClientEvent::ConnectionStateChanged(state)).await;

                if state == ConnectionState::Connected {
                    let delivery = self.delivery.clone();
                    tokio::spawn(async move {
                        delivery.on_connection_established().await;
                    });
                }
            }
            SupervisorEvent::MessageReceived(raw) => {
                let inbound = InboundMessage::parse(&raw, &self.default_chat);
                let message = ChatMessage::incoming(&inbound);
                if self.conversations.append(&inbound.chat_id, message.clone()) {
                    self.emit(ClientEvent::MessageReceived {
                        chat_id: inbound.chat_id,
                        message,
                    })
                    .await;
                } else {
                    debug!(id = %inbound.id, "Duplicate inbound message ignored");
                }
            }
            SupervisorEvent::Fault { code, message } => {
                debug!(code = %code, message = %message, "Connection fault");
            }
        }
    }

    async fn on_delivery_event(&mut self, event: DeliveryEvent) {
        let event = match event {
            DeliveryEvent::Pending(outbound) => {
                let message = ChatMessage::outgoing(&outbound);
                self.conversations.append(&outbound.chat_id, message.clone());
                ClientEvent::MessagePending {
                    chat_id: outbound.chat_id,
                    message,
                }
            }
            DeliveryEvent::Delivered { chat_id, message_id } => {
                self.conversations
                    .set_status(&chat_id, &message_id, MessageStatus::Delivered);
                ClientEvent::MessageDelivered { chat_id, message_id }
            }
            DeliveryEvent::Failed {
                chat_id,
                message_id,
                reason,
            } => {
                self.conversations
                    .set_status(&chat_id, &message_id, MessageStatus::Failed);
                ClientEvent::MessageDeliveryFailed {
                    chat_id,
                    message_id,
                    reason,
                }
            }
            DeliveryEvent::Notice(text) => ClientEvent::Notice(text),
            DeliveryEvent::QueueDepthChanged(depth) => ClientEvent::QueueDepthChanged(depth),
        };
        self.emit(event).await;
    }

    /// Arm the badge timer when the connection goes down, clear it on connect
    ///
    /// `Connecting` leaves the timer alone so a failing reconnect loop still
    /// counts as one continuous outage.
    async fn update_badge(&mut self, state: ConnectionState) {
        if state.is_down() {
            if self.badge_deadline.is_none() && !self.badge_visible {
                self.badge_deadline = Some(Instant::now() + self.badge_delay);
            }
        } else if state.is_connected() {
            self.badge_deadline = None;
            if self.badge_visible {
                self.badge_visible = false;
                self.emit(ClientEvent::ConnectivityBadge { visible: false }).await;
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Client event receiver dropped");
        }
    }
}
