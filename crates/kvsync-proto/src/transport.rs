//! Async transport for framed sync messages over a WebSocket (§4.5, §4.6).
//!
//! Wraps a `tokio-tungstenite` stream so the Sync Server and Sync Client
//! Provider exchange [`Frame`] values directly instead of raw bytes.
//! Malformed frames are logged and skipped rather than killing the
//! connection (§7 "tolerate malformed frames, never crash the connection").

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;

/// A WebSocket stream framed for the sync protocol.
///
/// Generic over the inner stream type so both server-accepted connections
/// (`WebSocketStream<TcpStream>`) and client-dialed ones
/// (`WebSocketStream<MaybeTlsStream<TcpStream>>`) share one transport.
pub struct FrameTransport<S> {
    inner: WebSocketStream<S>,
}

impl FrameTransport<TcpStream> {
    /// Wrap a server-side accepted WebSocket stream.
    pub fn new(inner: WebSocketStream<TcpStream>) -> Self {
        Self { inner }
    }
}

impl FrameTransport<MaybeTlsStream<TcpStream>> {
    /// Wrap a client-dialed WebSocket stream.
    pub fn new_client(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self { inner }
    }
}

impl<S> FrameTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    /// Send one frame as a binary WebSocket message.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        self.inner
            .send(WsMessage::Binary(frame.encode()))
            .await
            .map_err(io_err)
    }

    /// Receive the next frame, skipping non-binary messages (ping/pong/
    /// close/text) and logging frames that fail to decode rather than
    /// tearing down the connection.
    ///
    /// Returns `Ok(None)` when the stream has ended.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(message) = self.inner.next().await else {
                return Ok(None);
            };
            let message = message.map_err(io_err)?;
            match message {
                WsMessage::Binary(bytes) => match Frame::decode(&bytes) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping malformed sync frame");
                        continue;
                    }
                },
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Close the underlying socket with a code and reason (§6, §4.6
    /// "close with code 4004").
    pub async fn close(&mut self, code: u16, reason: String) -> Result<()> {
        self.inner
            .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(
                    code,
                ),
                reason: reason.into(),
            }))
            .await
            .map_err(io_err)
    }
}

fn io_err(e: tokio_tungstenite::tungstenite::Error) -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
