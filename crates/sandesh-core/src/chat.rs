//! In-session messaging for sandesh.
//!
//! Messages ride the same live transport as signaling and are scoped to a
//! connected session. Delivery state advances monotonically
//! (`Sent -> Delivered -> Read`); receipts arriving out of order or
//! duplicated never move a message backwards.

use crate::error::SignalError;
use crate::presence::PresenceRegistry;
use crate::session::{SessionState, SessionStore};
use dashmap::DashMap;
use sandesh_protocol::{ChatRecord, DeliveryStatus, Frame};
use std::sync::Arc;
use tracing::debug;

/// Hard cap on a single history page.
pub const HISTORY_LIMIT_MAX: usize = 200;

/// Page size used when the client asks for zero.
pub const HISTORY_LIMIT_DEFAULT: usize = 50;

/// A message as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Sender-assigned message id, unique within the session.
    pub message_id: String,
    /// Session the message belongs to.
    pub session_id: String,
    /// Author of the message.
    pub sender_id: String,
    /// Message body.
    pub text: String,
    /// Sender-side timestamp, epoch milliseconds.
    pub sent_at: u64,
    /// Current delivery state.
    pub status: DeliveryStatus,
}

/// Persistence seam for session messages.
///
/// The default in-memory store suffices for a single node; a durable
/// backend slots in behind this trait without touching the channel.
pub trait MessageStore: Send + Sync {
    /// Persist a newly sent message.
    fn append(&self, message: StoredMessage);

    /// Advance a message's delivery state.
    ///
    /// Only forward movement is applied; returns `true` if the state
    /// changed.
    fn advance_status(&self, session_id: &str, message_id: &str, status: DeliveryStatus) -> bool;

    /// Messages for a session strictly older than `before` (all messages
    /// when `None`), newest first, at most `limit`.
    fn query_before(&self, session_id: &str, before: Option<u64>, limit: usize)
        -> Vec<StoredMessage>;
}

/// In-memory message store, per-session append order preserved.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<String, Vec<StoredMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages across all sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.iter().map(|e| e.value().len()).sum()
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, message: StoredMessage) {
        self.messages
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
    }

    fn advance_status(&self, session_id: &str, message_id: &str, status: DeliveryStatus) -> bool {
        let Some(mut entry) = self.messages.get_mut(session_id) else {
            return false;
        };
        let Some(message) = entry.iter_mut().find(|m| m.message_id == message_id) else {
            return false;
        };
        if status > message.status {
            message.status = status;
            true
        } else {
            false
        }
    }

    fn query_before(
        &self,
        session_id: &str,
        before: Option<u64>,
        limit: usize,
    ) -> Vec<StoredMessage> {
        let Some(entry) = self.messages.get(session_id) else {
            return Vec::new();
        };
        let mut page: Vec<StoredMessage> = entry
            .iter()
            .filter(|m| before.map_or(true, |cut| m.sent_at < cut))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        page.truncate(limit);
        page
    }
}

/// The in-session message channel.
///
/// Sending, receipts, and typing indicators are all gated on session
/// membership; sending additionally requires the session to be
/// `Connected`, regardless of session kind.
pub struct MessageChannel {
    sessions: Arc<SessionStore>,
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn MessageStore>,
}

impl MessageChannel {
    /// Create a new message channel over the given store.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<PresenceRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            sessions,
            registry,
            store,
        }
    }

    /// Look up the session and return the sender's peer, enforcing
    /// membership and, when `require_connected`, the connected gate.
    async fn peer_in_session(
        &self,
        session_id: &str,
        user_id: &str,
        require_connected: bool,
    ) -> Result<String, SignalError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?;
        let session = handle.lock().await;

        let peer = session
            .peer_of(user_id)
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?
            .to_string();

        if require_connected && session.state != SessionState::Connected {
            return Err(SignalError::SessionNotConnected(session_id.to_string()));
        }

        Ok(peer)
    }

    /// Send a message within a connected session.
    ///
    /// The message is persisted as `Sent` and relayed to the peer's live
    /// connection if one exists; an offline peer catches up via history.
    ///
    /// # Errors
    ///
    /// - [`SignalError::SessionNotFound`] for an unknown session or a
    ///   sender who is not a participant.
    /// - [`SignalError::SessionNotConnected`] when the session has not
    ///   completed the connect handshake.
    pub async fn send(
        &self,
        session_id: &str,
        sender_id: &str,
        message_id: &str,
        text: &str,
        sent_at: u64,
    ) -> Result<(), SignalError> {
        let peer = self.peer_in_session(session_id, sender_id, true).await?;

        self.store.append(StoredMessage {
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            sent_at,
            status: DeliveryStatus::Sent,
        });

        if let Some(handle) = self.registry.live_handle(&peer) {
            let relayed = handle.send(Frame::Chat {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                sender_id: Some(sender_id.to_string()),
                text: text.to_string(),
                sent_at,
            });
            debug!(session = %session_id, message = %message_id, relayed, "Chat relayed");
        }

        Ok(())
    }

    /// Apply a delivery or read receipt from the recipient.
    ///
    /// The stored state advances monotonically; a stale or duplicate
    /// receipt is absorbed without relaying. Applied receipts are relayed
    /// to the peer (the original sender).
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SessionNotFound`] for an unknown session or
    /// a non-participant.
    pub async fn receipt(
        &self,
        session_id: &str,
        user_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<(), SignalError> {
        let peer = self.peer_in_session(session_id, user_id, false).await?;

        if !self.store.advance_status(session_id, message_id, status) {
            return Ok(());
        }

        if let Some(handle) = self.registry.live_handle(&peer) {
            handle.send(Frame::receipt(session_id, message_id, status));
        }

        Ok(())
    }

    /// Relay a typing indicator to the peer.
    ///
    /// Transient and unpersisted; silently dropped unless the session is
    /// connected and the peer is live.
    pub async fn typing(&self, session_id: &str, user_id: &str, active: bool) {
        let Ok(peer) = self.peer_in_session(session_id, user_id, true).await else {
            return;
        };
        if let Some(handle) = self.registry.live_handle(&peer) {
            handle.send(Frame::Typing {
                session_id: session_id.to_string(),
                active,
            });
        }
    }

    /// Fetch a page of session history for `user_id`, newest first.
    ///
    /// `limit` is clamped to [`HISTORY_LIMIT_MAX`]; zero selects
    /// [`HISTORY_LIMIT_DEFAULT`]. Each record's `mine` flag is computed
    /// against the requesting user, so the same stored message renders
    /// correctly on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SessionNotFound`] for an unknown session or
    /// a non-participant.
    pub async fn fetch_history(
        &self,
        session_id: &str,
        user_id: &str,
        limit: usize,
        before: Option<u64>,
    ) -> Result<Vec<ChatRecord>, SignalError> {
        self.peer_in_session(session_id, user_id, false).await?;

        let limit = if limit == 0 {
            HISTORY_LIMIT_DEFAULT
        } else {
            limit.min(HISTORY_LIMIT_MAX)
        };

        Ok(self
            .store
            .query_before(session_id, before, limit)
            .into_iter()
            .map(|m| ChatRecord {
                message_id: m.message_id,
                sender_id: m.sender_id.clone(),
                text: m.text,
                sent_at: m.sent_at,
                status: m.status,
                mine: m.sender_id == user_id,
            })
            .collect())
    }
}
