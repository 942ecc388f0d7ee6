//! Socket transport seam and its WebSocket implementation
//!
//! The supervisor only talks to [`Connector`], [`FrameSink`] and
//! [`FrameStream`]; `WsConnector` backs them with tokio-tungstenite.

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Close code sent on a deliberate disconnect
pub const NORMAL_CLOSURE: u16 = 1000;

/// A frame read from the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    /// Peer closed, with its status code if one was given
    Close(Option<u16>),
}

/// Write half of an established connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send a text frame, completing once the transport accepted it
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a ping control frame
    async fn ping(&mut self) -> Result<()>;

    /// Send a close control frame with the given status code
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// Read half of an established connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` once the stream has ended
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// An established connection, split into its halves
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens connections to the endpoint (performs the handshake)
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Link>;
}

// ─────────────────────────────────────────────────────────────────
// WebSocket Implementation
// ─────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Link> {
        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::connect_failed(url.as_str(), e.to_string()))?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws.split();
        Ok(Link {
            sink: Box::new(WsSink { inner: write }),
            stream: Box::new(WsReader { inner: read }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::transmit_failed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| Error::transmit_failed(e.to_string()))
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(""),
        };
        self.inner.send(WsMessage::Close(Some(frame))).await?;
        Ok(())
    }
}

struct WsReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsReader {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        let message = self.inner.next().await?;
        Some(message.map_err(Error::from).map(|msg| match msg {
            WsMessage::Text(text) => Frame::Text(text),
            WsMessage::Binary(data) => Frame::Binary(data),
            WsMessage::Ping(_) => Frame::Ping,
            WsMessage::Pong(_) => Frame::Pong,
            WsMessage::Close(frame) => Frame::Close(frame.map(|f| u16::from(f.code))),
            WsMessage::Frame(_) => Frame::Binary(Vec::new()),
        }))
    }
}
