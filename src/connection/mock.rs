//! In-memory transport for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::transport::{Connector, Frame, FrameSink, FrameStream, Link};
use crate::error::{Error, Result};

/// Connector whose links are inspectable [`MockPeer`]s
#[derive(Default)]
pub(crate) struct MockConnector {
    attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
    handshake_delay: Duration,
    peers: Mutex<Vec<MockPeer>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the first `n` handshakes
    pub(crate) fn failing(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicUsize::new(n),
            ..Default::default()
        })
    }

    pub(crate) fn with_handshake_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            handshake_delay: delay,
            ..Default::default()
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The `index`-th successfully opened link
    pub(crate) fn peer(&self, index: usize) -> MockPeer {
        self.peers.lock()[index].clone()
    }

    /// Links neither closed nor dropped by the client
    pub(crate) fn open_links(&self) -> usize {
        self.peers.lock().iter().filter(|p| p.is_open()).count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::connect_failed(url.as_str(), "connection refused"));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = MockPeer {
            state: Arc::new(PeerState {
                inbound_tx: Some(inbound_tx),
                ..Default::default()
            }),
        };
        self.peers.lock().push(peer.clone());

        Ok(Link {
            sink: Box::new(MockSink { peer: peer.clone() }),
            stream: Box::new(MockStream { rx: inbound_rx }),
        })
    }
}

#[derive(Default)]
struct PeerState {
    sent: Mutex<Vec<String>>,
    pings: AtomicUsize,
    close_code: Mutex<Option<u16>>,
    fail_sends: AtomicBool,
    fail_pings: AtomicBool,
    sink_dropped: AtomicBool,
    inbound_tx: Option<mpsc::UnboundedSender<Result<Frame>>>,
}

/// Server side of one mock link
#[derive(Clone)]
pub(crate) struct MockPeer {
    state: Arc<PeerState>,
}

impl MockPeer {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    pub(crate) fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn close_code(&self) -> Option<u16> {
        *self.state.close_code.lock()
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Deliver a text frame to the client
    pub(crate) fn push_text(&self, text: &str) {
        self.push(Ok(Frame::Text(text.to_string())));
    }

    /// Make the client's next read fail
    pub(crate) fn fail_read(&self) {
        self.push(Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))));
    }

    fn push(&self, frame: Result<Frame>) {
        if let Some(tx) = &self.state.inbound_tx {
            let _ = tx.send(frame);
        }
    }

    fn is_open(&self) -> bool {
        self.close_code().is_none() && !self.state.sink_dropped.load(Ordering::SeqCst)
    }
}

struct MockSink {
    peer: MockPeer,
}

impl Drop for MockSink {
    fn drop(&mut self) {
        self.peer.state.sink_dropped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.peer.state.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transmit_failed("broken pipe"));
        }
        self.peer.state.sent.lock().push(text);
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.peer.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.peer.state.fail_pings.load(Ordering::SeqCst) {
            return Err(Error::transmit_failed("ping rejected"));
        }
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        *self.peer.state.close_code.lock() = Some(code);
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await
    }
}
