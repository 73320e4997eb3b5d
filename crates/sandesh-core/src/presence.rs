//! Presence tracking for sandesh.
//!
//! The presence registry maps a user identity to its currently reachable
//! endpoints: a live transport handle (present only while connected) and a
//! durable wake token (survives disconnect, rotated on re-registration).

use crate::error::SignalError;
use dashmap::DashMap;
use sandesh_protocol::Frame;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// A user identity.
pub type UserId = String;

/// A durable wake token (push-notification address).
pub type WakeToken = String;

/// Current time in epoch milliseconds.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// An opaque reference to an open bidirectional connection.
///
/// Frames pushed into the outbox are drained by the owning connection's
/// write loop.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    /// Identifier of the underlying connection.
    pub connection_id: String,
    /// Frame outbox for this connection.
    pub outbox: mpsc::UnboundedSender<Frame>,
}

impl LiveHandle {
    /// Create a new live handle.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, outbox: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbox,
        }
    }

    /// Push a frame to the connection's write loop.
    ///
    /// Returns `false` if the connection has already gone away.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbox.send(frame).is_ok()
    }
}

/// Reachable endpoints for a single user.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// User identity.
    pub user_id: UserId,
    /// Live transport handle; present only while connected.
    pub live: Option<LiveHandle>,
    /// Durable wake token; survives disconnect.
    pub wake_token: Option<WakeToken>,
    /// When the record was first created.
    pub registered_at: u64,
    /// Last inbound activity timestamp.
    pub last_seen: u64,
}

impl PresenceRecord {
    fn new(user_id: UserId, live: Option<LiveHandle>, wake_token: Option<WakeToken>) -> Self {
        let now = now_millis();
        Self {
            user_id,
            live,
            wake_token,
            registered_at: now,
            last_seen: now,
        }
    }
}

/// Registry of reachable endpoints, keyed by user id.
///
/// Safe for many concurrent readers and writers; a new live handle for a
/// user replaces any prior one (single active session per user,
/// last-write-wins).
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    records: DashMap<UserId, PresenceRecord>,
}

impl PresenceRegistry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Upsert a user's reachable endpoints.
    ///
    /// A `Some` live handle replaces any prior one; a `Some` wake token
    /// rotates the stored one. `None` fields leave existing endpoints
    /// untouched, so repeated registration is an idempotent upsert.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::InvalidRegistration`] if both fields are
    /// `None`.
    pub fn register(
        &self,
        user_id: impl Into<UserId>,
        live: Option<LiveHandle>,
        wake_token: Option<WakeToken>,
    ) -> Result<(), SignalError> {
        if live.is_none() && wake_token.is_none() {
            return Err(SignalError::InvalidRegistration);
        }

        let user_id = user_id.into();
        match self.records.entry(user_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if let Some(handle) = live {
                    debug!(user = %user_id, connection = %handle.connection_id, "Presence: live handle replaced");
                    record.live = Some(handle);
                }
                if let Some(token) = wake_token {
                    record.wake_token = Some(token);
                }
                record.last_seen = now_millis();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(user = %user_id, "Presence: user registered");
                entry.insert(PresenceRecord::new(user_id.clone(), live, wake_token));
            }
        }

        Ok(())
    }

    /// Clear a user's live handle after its connection went away.
    ///
    /// Only clears when the handle still belongs to `connection_id`, so a
    /// stale connection's teardown cannot clobber a newer registration.
    /// The wake token is retained.
    ///
    /// Returns `true` if the live handle was cleared.
    pub fn mark_disconnected(&self, user_id: &str, connection_id: &str) -> bool {
        if let Some(mut record) = self.records.get_mut(user_id) {
            let owned = record
                .live
                .as_ref()
                .is_some_and(|h| h.connection_id == connection_id);
            if owned {
                record.live = None;
                debug!(user = %user_id, connection = %connection_id, "Presence: live handle cleared");
                return true;
            }
        }
        false
    }

    /// Remove the user's record entirely (explicit logout).
    ///
    /// Returns `true` if a record existed.
    pub fn logout(&self, user_id: &str) -> bool {
        let removed = self.records.remove(user_id).is_some();
        if removed {
            debug!(user = %user_id, "Presence: user logged out");
        }
        removed
    }

    /// Get a snapshot of a user's presence record.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }

    /// Whether the user currently has a live handle.
    #[must_use]
    pub fn is_live(&self, user_id: &str) -> bool {
        self.records
            .get(user_id)
            .is_some_and(|r| r.live.is_some())
    }

    /// Get the user's live handle, if any.
    #[must_use]
    pub fn live_handle(&self, user_id: &str) -> Option<LiveHandle> {
        self.records.get(user_id).and_then(|r| r.live.clone())
    }

    /// Refresh a user's last-seen timestamp.
    pub fn touch(&self, user_id: &str) {
        if let Some(mut record) = self.records.get_mut(user_id) {
            record.last_seen = now_millis();
        }
    }
}
