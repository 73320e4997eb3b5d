//! # sandesh-core
//!
//! Presence, session lifecycle, invite dispatch, and in-session messaging
//! for the Sandesh signaling coordinator.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Presence** - Per-user reachable endpoints (live handle + wake token)
//! - **Session** - Lifecycle state machine and session store
//! - **Dispatch** - Invite routing (live-first, wake fallback) and timers
//! - **Chat** - In-session message channel with delivery receipts
//! - **Presenter** - Client-side call presentation state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Dispatcher │────▶│  Sessions   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │        │
//!                        ▼        ▼
//!                 ┌──────────┐ ┌─────────────┐
//!                 │ Presence │ │ WakeChannel │
//!                 └──────────┘ └─────────────┘
//! ```

pub mod chat;
pub mod dispatch;
pub mod error;
pub mod presence;
pub mod presenter;
pub mod session;

pub use chat::{MemoryStore, MessageChannel, MessageStore, StoredMessage};
pub use dispatch::{DispatchConfig, Dispatcher, WakeChannel, WakePayload};
pub use error::SignalError;
pub use presence::{LiveHandle, PresenceRecord, PresenceRegistry, UserId, WakeToken};
pub use presenter::{Presenter, PresenterAction, PresenterState, RingControl};
pub use session::{
    Session, SessionId, SessionSnapshot, SessionState, SessionStore, Transition,
};
