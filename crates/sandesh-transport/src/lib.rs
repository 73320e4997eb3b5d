//! # sandesh-transport
//!
//! Transport layer for the Sandesh signaling coordinator.
//!
//! Two delivery paths live here:
//!
//! - **WebSocket** - The live bidirectional transport for signaling and
//!   in-session messaging
//! - **Wake** - One-shot, best-effort push implementations for rousing a
//!   client with no live connection
//!
//! ## Transport Abstraction
//!
//! Live transports implement the `Transport` and `Connection` traits, so
//! the coordinator stays protocol-agnostic.
//!
//! ```rust,ignore
//! use sandesh_transport::{Transport, Connection};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod traits;
pub mod wake;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, Transport, TransportError};
pub use wake::{MpscWake, NoopWake};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
