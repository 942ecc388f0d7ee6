//! Delivery coordinator
//!
//! Attempts each send immediately and falls back to the retry queue when
//! the connection cannot take it. The queue is flushed on every newly
//! established connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::message::OutboundMessage;
use super::queue::{EnqueueOutcome, RetryQueue};
use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::error::{Error, Result};

/// Anything that can put one text frame on the wire
#[async_trait]
pub trait Transmit: Send + Sync {
    async fn transmit(&self, payload: String) -> Result<()>;

    /// Whether a transmit issued now would reach the transport
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Transmit for ConnectionSupervisor {
    async fn transmit(&self, payload: String) -> Result<()> {
        ConnectionSupervisor::transmit(self, payload).await
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Whether a failed transmit reached the transport at all
fn counts_as_attempt(error: &Error) -> bool {
    !matches!(error, Error::NotConnected { .. } | Error::Unreachable)
}

/// Events published by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A message was created and is being sent
    Pending(OutboundMessage),

    /// The transport accepted a message
    Delivered { chat_id: String, message_id: String },

    /// A message could not be sent (queued for retry, or evicted)
    Failed {
        chat_id: String,
        message_id: String,
        reason: String,
    },

    /// One user-facing notice per failed send
    Notice(String),

    /// Retry queue depth after a change
    QueueDepthChanged(usize),
}

/// What happened to a send
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: OutboundMessage,
    /// `false` means the message went through the retry queue
    pub delivered: bool,
}

/// Counts from one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Owns outbound message semantics
pub struct DeliveryCoordinator {
    transmitter: Arc<dyn Transmit>,
    queue: Arc<RetryQueue>,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    sender: Option<String>,
}

impl DeliveryCoordinator {
    pub fn new(
        transmitter: Arc<dyn Transmit>,
        queue: Arc<RetryQueue>,
        events: mpsc::UnboundedSender<DeliveryEvent>,
    ) -> Self {
        Self {
            transmitter,
            queue,
            events,
            sender: None,
        }
    }

    /// Label put in the `sender` field of outgoing envelopes
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[cfg(test)]
    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Send `text` to `chat_id`
    ///
    /// The message is published as pending first. It is then either
    /// delivered, or queued for retry with one failure event and one notice.
    /// A send refused for lack of a connection that comes up before the
    /// message is queued would miss that connection's flush, so the state is
    /// checked again once the message is in the queue.
    pub async fn send(&self, chat_id: &str, text: &str) -> Result<SendOutcome> {
        let mut message = OutboundMessage::new(chat_id, text);
        self.emit(DeliveryEvent::Pending(message.clone()));

        let payload = self.encode(&message)?;
        match self.transmitter.transmit(payload).await {
            Ok(()) => {
                debug!(id = %message.id, chat = %message.chat_id, "Message delivered");
                self.emit(DeliveryEvent::Delivered {
                    chat_id: message.chat_id.clone(),
                    message_id: message.id.clone(),
                });
                Ok(SendOutcome {
                    message,
                    delivered: true,
                })
            }
            Err(e) => {
                let attempted = counts_as_attempt(&e);
                if attempted {
                    message.delivery_attempts += 1;
                }
                if e.is_retryable() {
                    info!(id = %message.id, reason = %e, "Send failed; queued for retry");
                } else {
                    warn!(id = %message.id, error = %e.format_for_log(), "Send failed; queued for retry");
                }

                self.enqueue(message.clone());
                self.emit(DeliveryEvent::Failed {
                    chat_id: message.chat_id.clone(),
                    message_id: message.id.clone(),
                    reason: e.to_string(),
                });
                self.emit(DeliveryEvent::Notice(format!(
                    "Message not sent ({}). It will be retried when the connection is back.",
                    e
                )));

                if !attempted && self.transmitter.is_connected() {
                    debug!(id = %message.id, "Connection came up during send; flushing");
                    self.flush().await;
                }

                Ok(SendOutcome {
                    message,
                    delivered: false,
                })
            }
        }
    }

    /// Retry everything queued at this instant
    ///
    /// Entries added while the flush runs wait for the next one. An entry
    /// already being retried by a concurrent flush is skipped. Failures stay
    /// queued without further notices.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        if self.queue.is_empty() {
            return report;
        }

        let batch = self.queue.begin_flush();
        if batch.is_empty() {
            return report;
        }

        info!(count = batch.len(), "Flushing retry queue");
        for message in batch {
            report.attempted += 1;

            let sent = match self.encode(&message) {
                Ok(payload) => self.transmitter.transmit(payload).await,
                Err(e) => Err(e),
            };

            match sent {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(e) = self.queue.complete(&message.id) {
                        error!(error = %e, "Failed to persist retry queue");
                    }
                    self.emit(DeliveryEvent::Delivered {
                        chat_id: message.chat_id,
                        message_id: message.id,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    debug!(id = %message.id, reason = %e, "Retry failed; keeping queued");
                    if let Err(e) = self.queue.release(&message.id, counts_as_attempt(&e)) {
                        error!(error = %e, "Failed to persist retry queue");
                    }
                }
            }
        }

        if report.delivered > 0 {
            self.emit(DeliveryEvent::QueueDepthChanged(self.queue.len()));
        }
        info!(
            delivered = report.delivered,
            failed = report.failed,
            remaining = self.queue.len(),
            "Flush complete"
        );
        report
    }

    /// Hook for a newly established connection
    pub async fn on_connection_established(&self) -> FlushReport {
        self.flush().await
    }

    /// Drop one queued message for good
    pub fn discard(&self, message_id: &str) -> Result<Option<OutboundMessage>> {
        let removed = self.queue.remove(message_id)?;
        if removed.is_some() {
            self.emit(DeliveryEvent::QueueDepthChanged(self.queue.len()));
        }
        Ok(removed)
    }

    /// Drop every queued message
    pub fn clear_queue(&self) -> Result<usize> {
        let count = self.queue.clear()?;
        if count > 0 {
            self.emit(DeliveryEvent::QueueDepthChanged(0));
        }
        Ok(count)
    }

    fn encode(&self, message: &OutboundMessage) -> Result<String> {
        Ok(message.to_wire(self.sender.as_deref()).to_json()?)
    }

    fn enqueue(&self, message: OutboundMessage) {
        let outcome = match self.queue.enqueue(message) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Still queued in memory
                error!(error = %e, "Failed to persist retry queue");
                EnqueueOutcome::Added { evicted: None }
            }
        };

        if let EnqueueOutcome::Added { evicted: Some(old) } = outcome {
            warn!(id = %old.id, "Undelivered message evicted from retry queue");
            self.emit(DeliveryEvent::Failed {
                chat_id: old.chat_id,
                message_id: old.id,
                reason: "evicted from full retry queue".to_string(),
            });
        }
        self.emit(DeliveryEvent::QueueDepthChanged(self.queue.len()));
    }

    fn emit(&self, event: DeliveryEvent) {
        if self.events.send(event).is_err() {
            debug!("Delivery event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{JsonFileStore, MemoryStore};
    use crate::protocol::WireMessage;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Transmitter with a switchable connection
    #[derive(Default)]
    struct FakeTransmit {
        connected: AtomicBool,
        reject: Mutex<Vec<String>>,
        sent: Mutex<Vec<WireMessage>>,
        /// Applied only to transmits that find the link up
        delay: Option<Duration>,
        /// Queued into on the first transmit, to race a flush
        inject: Mutex<Option<(Arc<RetryQueue>, OutboundMessage)>>,
        /// Comes up right after refusing its first transmit
        connect_after_refusal: AtomicBool,
    }

    impl FakeTransmit {
        fn connected() -> Arc<Self> {
            let fake = Self::default();
            fake.connected.store(true, Ordering::SeqCst);
            Arc::new(fake)
        }

        fn disconnected() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn sent_contents(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.content.clone()).collect()
        }
    }

    #[async_trait]
    impl Transmit for FakeTransmit {
        async fn transmit(&self, payload: String) -> Result<()> {
            if let Some(delay) = self.delay.filter(|_| self.connected.load(Ordering::SeqCst)) {
                tokio::time::sleep(delay).await;
            }
            if let Some((queue, message)) = self.inject.lock().take() {
                queue.enqueue(message).unwrap();
            }
            if !self.connected.load(Ordering::SeqCst) {
                if self.connect_after_refusal.swap(false, Ordering::SeqCst) {
                    self.connected.store(true, Ordering::SeqCst);
                }
                return Err(Error::NotConnected {
                    state: ConnectionState::Disconnected,
                });
            }

            let wire = WireMessage::from_json(&payload).unwrap();
            if self.reject.lock().contains(&wire.content) {
                return Err(Error::transmit_failed("rejected"));
            }
            self.sent.lock().push(wire);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn coordinator(
        transmitter: Arc<FakeTransmit>,
        queue: Arc<RetryQueue>,
    ) -> (DeliveryCoordinator, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeliveryCoordinator::new(transmitter, queue, tx), rx)
    }

    fn payloads(coord: &DeliveryCoordinator) -> Vec<String> {
        coord.queue().snapshot().into_iter().map(|m| m.payload).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_send_while_connected_never_queues() {
        let fake = FakeTransmit::connected();
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));

        let outcome = coord.send("bot_1", "hello").await.unwrap();
        assert!(outcome.delivered);
        assert_eq!(coord.queue_depth(), 0);
        assert_eq!(fake.sent_contents(), vec!["hello"]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DeliveryEvent::Pending(_)));
        assert_eq!(
            events[1],
            DeliveryEvent::Delivered {
                chat_id: "bot_1".to_string(),
                message_id: outcome.message.id.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues_once_with_one_notice() {
        let fake = FakeTransmit::disconnected();
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));

        let outcome = coord.send("bot_1", "hello").await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(outcome.message.delivery_attempts, 0);

        let queued = coord.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, outcome.message.id);
        assert_eq!(queued[0].payload, "hello");

        let events = drain(&mut rx);
        let notices = events.iter().filter(|e| matches!(e, DeliveryEvent::Notice(_))).count();
        let failures = events
            .iter()
            .filter(|e| matches!(e, DeliveryEvent::Failed { .. }))
            .count();
        assert_eq!(notices, 1);
        assert_eq!(failures, 1);
        assert!(events.contains(&DeliveryEvent::QueueDepthChanged(1)));
    }

    #[tokio::test]
    async fn test_transport_failure_counts_an_attempt() {
        let fake = FakeTransmit::connected();
        fake.reject.lock().push("hello".to_string());
        let (coord, _rx) = coordinator(fake, Arc::new(RetryQueue::in_memory()));

        let outcome = coord.send("bot_1", "hello").await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(coord.queue().snapshot()[0].delivery_attempts, 1);
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_silent() {
        let (coord, mut rx) = coordinator(FakeTransmit::connected(), Arc::new(RetryQueue::in_memory()));

        assert_eq!(coord.flush().await, FlushReport::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order_and_dequeues() {
        let fake = FakeTransmit::disconnected();
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));
        for text in ["one", "two", "three"] {
            coord.send("bot_1", text).await.unwrap();
        }
        drain(&mut rx);

        fake.connected.store(true, Ordering::SeqCst);
        let report = coord.on_connection_established().await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);
        assert_eq!(fake.sent_contents(), vec!["one", "two", "three"]);
        assert!(coord.queue().is_empty());

        let events = drain(&mut rx);
        let delivered = events
            .iter()
            .filter(|e| matches!(e, DeliveryEvent::Delivered { .. }))
            .count();
        assert_eq!(delivered, 3);
        assert_eq!(events.last(), Some(&DeliveryEvent::QueueDepthChanged(0)));
        assert!(!events.iter().any(|e| matches!(e, DeliveryEvent::Notice(_))));
    }

    #[tokio::test]
    async fn test_flush_failure_stays_queued_without_notice() {
        let fake = FakeTransmit::disconnected();
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));
        coord.send("bot_1", "good").await.unwrap();
        coord.send("bot_1", "bad").await.unwrap();
        drain(&mut rx);

        fake.connected.store(true, Ordering::SeqCst);
        fake.reject.lock().push("bad".to_string());
        let report = coord.flush().await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        let remaining = coord.queue().snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, "bad");
        assert_eq!(remaining[0].delivery_attempts, 1);

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, DeliveryEvent::Notice(_))));
        assert!(!events.iter().any(|e| matches!(e, DeliveryEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_flush_snapshot_excludes_messages_added_mid_flush() {
        let fake = FakeTransmit::disconnected();
        let queue = Arc::new(RetryQueue::in_memory());
        let (coord, _rx) = coordinator(fake.clone(), queue.clone());
        coord.send("bot_1", "first").await.unwrap();

        fake.connected.store(true, Ordering::SeqCst);
        *fake.inject.lock() = Some((queue.clone(), OutboundMessage::new("bot_1", "late")));

        let report = coord.flush().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(fake.sent_contents(), vec!["first"]);
        assert_eq!(queue.snapshot()[0].payload, "late");

        coord.flush().await;
        assert_eq!(fake.sent_contents(), vec!["first", "late"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flushes_never_double_send() {
        let fake = Arc::new(FakeTransmit {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let (coord, _rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));
        for text in ["a", "b", "c"] {
            coord.send("bot_1", text).await.unwrap();
        }

        fake.connected.store(true, Ordering::SeqCst);
        let (first, second) = tokio::join!(coord.flush(), coord.flush());

        assert_eq!(first.attempted + second.attempted, 3);
        assert_eq!(fake.sent_contents(), vec!["a", "b", "c"]);
        assert!(coord.queue().is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outbox.json");

        {
            let queue = RetryQueue::open(Box::new(JsonFileStore::new(&path)), 0).unwrap();
            let (coord, _rx) = coordinator(FakeTransmit::disconnected(), Arc::new(queue));
            coord.send("bot_1", "hello").await.unwrap();
        }

        let fake = FakeTransmit::connected();
        let queue = RetryQueue::open(Box::new(JsonFileStore::new(&path)), 0).unwrap();
        let (coord, _rx) = coordinator(fake.clone(), Arc::new(queue));
        assert_eq!(coord.queue_depth(), 1);

        coord.flush().await;
        assert_eq!(fake.sent_contents(), vec!["hello"]);

        let reopened = JsonFileStore::new(&path);
        assert!(crate::delivery::QueueStore::load(&reopened).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_queue_reports_evicted_message() {
        let queue = RetryQueue::open(Box::new(MemoryStore::new()), 1).unwrap();
        let (coord, mut rx) = coordinator(FakeTransmit::disconnected(), Arc::new(queue));

        let first = coord.send("bot_1", "old").await.unwrap();
        drain(&mut rx);
        coord.send("bot_1", "new").await.unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&DeliveryEvent::Failed {
            chat_id: "bot_1".to_string(),
            message_id: first.message.id.clone(),
            reason: "evicted from full retry queue".to_string(),
        }));
        assert_eq!(coord.queue_depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_keeps_message_being_flushed() {
        let fake = Arc::new(FakeTransmit {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let queue = RetryQueue::open(Box::new(MemoryStore::new()), 1).unwrap();
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(queue));
        let coord = Arc::new(coord);

        let a = coord.send("bot_1", "a").await.unwrap();
        drain(&mut rx);

        fake.connected.store(true, Ordering::SeqCst);
        let flushing = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.flush().await })
        };
        // Let the flush claim "a" and park in the transport
        tokio::time::sleep(Duration::from_millis(10)).await;

        fake.connected.store(false, Ordering::SeqCst);
        coord.send("bot_1", "b").await.unwrap();
        fake.connected.store(true, Ordering::SeqCst);

        let report = flushing.await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(fake.sent_contents(), vec!["a"]);

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            DeliveryEvent::Failed { message_id, .. } if *message_id == a.message.id
        )));
        assert_eq!(payloads(&coord), vec!["b"]);
    }

    #[tokio::test]
    async fn test_send_racing_connection_is_flushed_right_away() {
        let fake = Arc::new(FakeTransmit {
            connect_after_refusal: AtomicBool::new(true),
            ..Default::default()
        });
        let (coord, mut rx) = coordinator(fake.clone(), Arc::new(RetryQueue::in_memory()));

        let outcome = coord.send("bot_1", "hello").await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(fake.sent_contents(), vec!["hello"]);
        assert!(coord.queue().is_empty());

        let events = drain(&mut rx);
        assert!(events.contains(&DeliveryEvent::Delivered {
            chat_id: "bot_1".to_string(),
            message_id: outcome.message.id.clone(),
        }));
        assert_eq!(events.last(), Some(&DeliveryEvent::QueueDepthChanged(0)));
    }

    #[tokio::test]
    async fn test_flush_without_connection_counts_no_attempt() {
        let fake = FakeTransmit::disconnected();
        let (coord, _rx) = coordinator(fake, Arc::new(RetryQueue::in_memory()));
        coord.send("bot_1", "hello").await.unwrap();

        let report = coord.flush().await;
        assert_eq!(report.failed, 1);
        assert_eq!(coord.queue().snapshot()[0].delivery_attempts, 0);
    }

    #[tokio::test]
    async fn test_discard_and_clear() {
        let (coord, mut rx) = coordinator(FakeTransmit::disconnected(), Arc::new(RetryQueue::in_memory()));
        let a = coord.send("bot_1", "a").await.unwrap();
        coord.send("bot_1", "b").await.unwrap();
        drain(&mut rx);

        assert!(coord.discard(&a.message.id).unwrap().is_some());
        assert_eq!(drain(&mut rx), vec![DeliveryEvent::QueueDepthChanged(1)]);

        assert_eq!(coord.clear_queue().unwrap(), 1);
        assert_eq!(coord.clear_queue().unwrap(), 0);
        assert_eq!(drain(&mut rx), vec![DeliveryEvent::QueueDepthChanged(0)]);
    }

    #[tokio::test]
    async fn test_sender_label_in_envelope() {
        let fake = FakeTransmit::connected();
        let (tx, _rx) = mpsc::unbounded_channel();
        let coord = DeliveryCoordinator::new(fake.clone(), Arc::new(RetryQueue::in_memory()), tx)
            .with_sender("laptop");

        coord.send("bot_1", "hi").await.unwrap();
        assert_eq!(fake.sent.lock()[0].sender.as_deref(), Some("laptop"));
    }
}
