//! Transport abstraction traits for Sandesh.
//!
//! The coordinator core never talks to a socket directly: it sees
//! connections only through these traits, so the live transport can be
//! swapped without touching signaling logic.

use async_trait::async_trait;
use bytes::Bytes;
use sandesh_protocol::Frame;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
///
/// Also used by the presence registry to tell a stale connection's
/// teardown apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self(format!("conn_{:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] sandesh_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept live connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// Blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An active live connection over a transport.
///
/// Connections carry the bidirectional signaling and messaging frame
/// flow between the coordinator and a single client. Hard disconnect of
/// a connection is a signaling event in itself: the server ends any
/// session its user is engaged in.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next frame from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a frame to the connection.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send pre-encoded bytes to the connection, avoiding a re-encode.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
