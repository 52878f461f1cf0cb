//! Connection establishment seam
//!
//! The transport talks to the network through [`Connector`] and
//! [`Connection`] so that reconnection and buffering logic can be exercised
//! against an in-memory fake. The production implementation,
//! [`WsConnector`], dials with tokio-tungstenite and exchanges frames as
//! JSON text messages.

use crate::message::Frame;
use crate::TransportError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live, bidirectional frame channel.
///
/// `recv` follows the stream contract: `Some(Ok(frame))` per inbound frame,
/// `Some(Err(_))` on a protocol error, `None` once the peer is gone.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug + 'static {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;
    async fn recv(&self) -> Option<Result<Frame, TransportError>>;
    async fn close(&self);
}

/// Dials a URL and yields a [`Connection`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self, url: &str) -> Result<Self::Conn, TransportError>;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::connection_failed(e.to_string()))?;
        tracing::debug!(url = %url, status = %response.status(), "websocket established");

        let (writer, reader) = stream.split();
        Ok(WsConnection {
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(reader),
        })
    }
}

/// A single WebSocket connection. Reads and writes are independently
/// serialized so the read loop and senders never contend on one lock.
pub struct WsConnection {
    writer: tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>,
    reader: tokio::sync::Mutex<SplitStream<WsStream>>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.to_text()?;
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::send_failed(e.to_string()))
    }

    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => match Frame::from_text(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed frame");
                        continue;
                    }
                },
                // Control frames are handled by tungstenite itself; binary
                // payloads are not part of the wire contract.
                Some(Ok(WsMessage::Ping(_)))
                | Some(Ok(WsMessage::Pong(_)))
                | Some(Ok(WsMessage::Binary(_)))
                | Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(TransportError::connection_lost(e.to_string()))),
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(WsMessage::Close(None)).await {
            tracing::debug!(error = %e, "close handshake failed");
        }
    }
}
