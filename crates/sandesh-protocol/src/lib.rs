//! # sandesh-protocol
//!
//! Wire protocol definitions for the sandesh signaling coordinator.
//!
//! This crate defines the binary protocol spoken between consultation-app
//! clients and the coordinator, including frame types, codecs, and
//! versioning.
//!
//! ## Frame Types
//!
//! - `Register` - Bind a connection as a user's live handle
//! - `CallRequest` / `Invite` / `Answer` - Session invites and answers
//! - `SessionConnect` / `SessionEvent` / `End` - Session lifecycle
//! - `Chat` / `Receipt` / `Typing` / `HistoryRequest` - Messaging
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use sandesh_protocol::{codec, Frame, SessionKind};
//!
//! // Create an invite frame using the helper method
//! let frame = Frame::invite(1, "sess-1", SessionKind::AudioCall, "client-4", None);
//!
//! // Encode and decode
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ChatRecord, DeliveryStatus, Frame, SessionKind, SessionPhase};
pub use version::WIRE_VERSION;
