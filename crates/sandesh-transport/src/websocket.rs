//! WebSocket live transport, built on tokio-tungstenite.
//!
//! Sandesh frames are binary MessagePack with a length prefix; each
//! WebSocket binary message may carry a partial frame or several frames,
//! so reads go through a streaming decode buffer.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use sandesh_protocol::{codec, Frame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum size of a single WebSocket message in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".parse().unwrap(),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Standalone WebSocket transport listener.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        let conn = WebSocketConnection::new(ws_stream, addr, self.config.max_message_size);
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A live WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: Arc<Mutex<WebSocketStream<TcpStream>>>,
    remote_addr: SocketAddr,
    is_open: AtomicBool,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(
        stream: WebSocketStream<TcpStream>,
        remote_addr: SocketAddr,
        max_message_size: usize,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream: Arc::new(Mutex::new(stream)),
            remote_addr,
            is_open: AtomicBool::new(true),
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // A previous read may have left a complete frame in the buffer
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            sandesh_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }

                    self.read_buffer.extend_from_slice(&data);

                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                    // Partial frame, keep reading
                }
                Some(Ok(Message::Text(_))) => {
                    // The wire protocol is binary only
                    debug!(connection = %self.id, "Ignoring text message");
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = codec::encode(&frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut stream = self.stream.lock().await;
        stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut stream = self.stream.lock().await;
        stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
