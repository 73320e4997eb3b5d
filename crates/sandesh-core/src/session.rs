//! Session lifecycle state for sandesh.
//!
//! A session is the unit of a single call or chat engagement between two
//! users, with its own lifecycle independent of either party's transport
//! state:
//!
//! ```text
//! REQUESTED -> RINGING -> {ACCEPTED | REJECTED | TIMED_OUT}
//!                          ACCEPTED -> CONNECTED -> ENDED
//! ```
//!
//! Transitions are monotonic and idempotent: an illegal or repeated
//! transition is a no-op, never an error. All writes to one session go
//! through its per-session async mutex (single-writer).

use crate::error::SignalError;
use crate::presence::{now_millis, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sandesh_protocol::{SessionKind, SessionPhase};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A session identifier.
pub type SessionId = String;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique session ID.
#[must_use]
pub fn generate_session_id() -> SessionId {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess_{:x}{:04x}", timestamp, counter & 0xFFFF)
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Allocated, not yet handed to any transport.
    Requested,
    /// Invite handed off to a transport (live-ack or wake-dispatch).
    Ringing,
    /// Target accepted; awaiting the session-connect handshake.
    Accepted,
    /// Target rejected. Terminal.
    Rejected,
    /// Ring, ack, or handshake window expired. Terminal.
    TimedOut,
    /// Both parties completed the session-connect handshake.
    Connected,
    /// Explicitly ended or peer hard-disconnected. Terminal.
    Ended,
}

impl SessionState {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Rejected | SessionState::TimedOut | SessionState::Ended
        )
    }

    /// Wire representation of this state, if it has one.
    ///
    /// `Requested` exists only transiently inside invite routing and is
    /// never reported on the wire.
    #[must_use]
    pub fn phase(self) -> Option<SessionPhase> {
        match self {
            SessionState::Requested => None,
            SessionState::Ringing => Some(SessionPhase::Ringing),
            SessionState::Accepted => Some(SessionPhase::Accepted),
            SessionState::Rejected => Some(SessionPhase::Rejected),
            SessionState::TimedOut => Some(SessionPhase::TimedOut),
            SessionState::Connected => Some(SessionPhase::Connected),
            SessionState::Ended => Some(SessionPhase::Ended),
        }
    }
}

/// Which transport carried the invite to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Delivered over the live transport with an application-level ack.
    Live,
    /// Dispatched as a one-shot wake notification (optimistic ringing).
    Wake,
}

/// Outcome of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition was legal and the state changed.
    Applied,
    /// Illegal or duplicate transition; state unchanged.
    Ignored,
}

/// A single call/chat session between two users.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Kind of session.
    pub kind: SessionKind,
    /// The inviting user.
    pub initiator_id: UserId,
    /// The invited user.
    pub target_id: UserId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// How the invite reached the target, once routed.
    pub route: Option<RouteKind>,
    /// Transport-opaque metadata attached at invite time.
    pub payload: Option<serde_json::Value>,
    /// Creation timestamp, epoch milliseconds.
    pub created_at: u64,
    /// Timestamp of the last state change, epoch milliseconds.
    pub state_changed_at: u64,
    /// Whether the initiator completed the session-connect handshake.
    pub initiator_joined: bool,
    /// Whether the target completed the session-connect handshake.
    pub target_joined: bool,
}

impl Session {
    /// Create a new session in `Requested` state.
    #[must_use]
    pub fn new(
        id: impl Into<SessionId>,
        kind: SessionKind,
        initiator_id: impl Into<UserId>,
        target_id: impl Into<UserId>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            kind,
            initiator_id: initiator_id.into(),
            target_id: target_id.into(),
            state: SessionState::Requested,
            route: None,
            payload,
            created_at: now,
            state_changed_at: now,
            initiator_joined: false,
            target_joined: false,
        }
    }

    /// Whether the session is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether `user_id` is one of the two participants.
    #[must_use]
    pub fn involves(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.target_id == user_id
    }

    /// The other participant, if `user_id` is one of the two.
    #[must_use]
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.initiator_id == user_id {
            Some(&self.target_id)
        } else if self.target_id == user_id {
            Some(&self.initiator_id)
        } else {
            None
        }
    }

    /// Apply a lifecycle transition.
    ///
    /// This is the single idempotent guard: illegal transitions,
    /// transitions out of a terminal state, and repeats of an
    /// already-applied transition all return [`Transition::Ignored`]
    /// without mutating state.
    pub fn apply(&mut self, to: SessionState) -> Transition {
        use SessionState::*;

        let legal = match (self.state, to) {
            (Requested, Ringing) | (Requested, TimedOut) => true,
            (Ringing, Accepted) | (Ringing, Rejected) | (Ringing, TimedOut) | (Ringing, Ended) => {
                true
            }
            (Accepted, Connected) | (Accepted, TimedOut) | (Accepted, Ended) => true,
            (Connected, Ended) => true,
            _ => false,
        };

        if !legal {
            trace!(session = %self.id, from = ?self.state, to = ?to, "Transition ignored");
            return Transition::Ignored;
        }

        debug!(session = %self.id, from = ?self.state, to = ?to, "Transition applied");
        self.state = to;
        self.state_changed_at = now_millis();
        Transition::Applied
    }

    /// Record a participant's session-connect handshake join.
    ///
    /// Returns `true` once both participants have joined. Joins from
    /// non-participants or repeat joins are no-ops.
    pub fn mark_joined(&mut self, user_id: &str) -> bool {
        if self.initiator_id == user_id {
            self.initiator_joined = true;
        } else if self.target_id == user_id {
            self.target_joined = true;
        }
        self.initiator_joined && self.target_joined
    }
}

/// Snapshot of a session, used for reconnect resync.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    pub initiator_id: UserId,
    pub target_id: UserId,
    pub payload: Option<serde_json::Value>,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            kind: s.kind,
            state: s.state,
            initiator_id: s.initiator_id.clone(),
            target_id: s.target_id.clone(),
            payload: s.payload.clone(),
        }
    }
}

/// Store of in-flight sessions.
///
/// Each session lives behind its own async mutex: all transitions for one
/// session are strictly ordered, while different sessions proceed in
/// parallel. An active-session index enforces the one-engagement-per-user
/// policy and serves disconnect/resync lookups.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    active: DashMap<UserId, SessionId>,
}

impl SessionStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions (including terminal, pre-sweep).
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Insert a new session, binding both participants as engaged.
    ///
    /// The engagement claim doubles as the busy check: each index entry
    /// is taken through a vacant-or-fail entry lookup, so two racing
    /// invites to one user cannot both book them and an existing
    /// engagement is never clobbered.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::ResourceBusy`] naming the already-engaged
    /// participant. A failed insert leaves no claim behind.
    pub fn try_insert(&self, session: Session) -> Result<Arc<Mutex<Session>>, SignalError> {
        let id = session.id.clone();

        match self.active.entry(session.target_id.clone()) {
            Entry::Occupied(_) => {
                return Err(SignalError::ResourceBusy(session.target_id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }
        match self.active.entry(session.initiator_id.clone()) {
            Entry::Occupied(_) => {
                self.active.remove_if(&session.target_id, |_, s| s == &id);
                return Err(SignalError::ResourceBusy(session.initiator_id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id, handle.clone());
        Ok(handle)
    }

    /// Get a session's mutex handle.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// The session a user is currently engaged in, if any.
    #[must_use]
    pub fn active_session(&self, user_id: &str) -> Option<SessionId> {
        self.active.get(user_id).map(|s| s.clone())
    }

    /// Release both participants' engagement for a terminal session.
    ///
    /// Only entries still pointing at `session_id` are removed, so a
    /// newer engagement is never clobbered.
    pub fn release(&self, session_id: &str, users: [&str; 2]) {
        for user in users {
            self.active
                .remove_if(user, |_, active| active == session_id);
        }
    }

    /// Remove terminal sessions whose last state change is older than
    /// `retention`. Returns the number of sessions removed.
    ///
    /// Sessions currently locked by a writer are skipped and picked up on
    /// the next sweep.
    pub fn sweep_terminal(&self, retention: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().try_lock().ok()?;
                (session.is_terminal() && session.state_changed_at <= cutoff)
                    .then(|| entry.key().clone())
            })
            .collect();

        for id in &expired {
            self.sessions.remove(id);
            debug!(session = %id, "Swept terminal session");
        }

        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("sess-1", SessionKind::AudioCall, "alice", "bob", None)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.apply(SessionState::Ringing), Transition::Applied);
        assert_eq!(s.apply(SessionState::Accepted), Transition::Applied);
        assert_eq!(s.apply(SessionState::Connected), Transition::Applied);
        assert_eq!(s.apply(SessionState::Ended), Transition::Applied);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            SessionState::Rejected,
            SessionState::TimedOut,
            SessionState::Ended,
        ] {
            let mut s = session();
            s.apply(SessionState::Ringing);
            assert_eq!(s.apply(terminal), Transition::Applied);

            for next in [
                SessionState::Ringing,
                SessionState::Accepted,
                SessionState::Rejected,
                SessionState::TimedOut,
                SessionState::Connected,
                SessionState::Ended,
            ] {
                assert_eq!(s.apply(next), Transition::Ignored);
                assert_eq!(s.state, terminal);
            }
        }
    }

    #[test]
    fn test_duplicate_transition_is_noop() {
        let mut s = session();
        s.apply(SessionState::Ringing);
        assert_eq!(s.apply(SessionState::Accepted), Transition::Applied);
        // Duplicate accept delivered by an at-least-once path
        assert_eq!(s.apply(SessionState::Accepted), Transition::Ignored);
        assert_eq!(s.state, SessionState::Accepted);
    }

    #[test]
    fn test_illegal_jumps_ignored() {
        let mut s = session();
        assert_eq!(s.apply(SessionState::Connected), Transition::Ignored);
        assert_eq!(s.apply(SessionState::Accepted), Transition::Ignored);
        assert_eq!(s.state, SessionState::Requested);
    }

    #[test]
    fn test_end_reachable_from_ringing_and_accepted() {
        let mut s = session();
        s.apply(SessionState::Ringing);
        assert_eq!(s.apply(SessionState::Ended), Transition::Applied);

        let mut s = session();
        s.apply(SessionState::Ringing);
        s.apply(SessionState::Accepted);
        assert_eq!(s.apply(SessionState::Ended), Transition::Applied);
    }

    #[test]
    fn test_mark_joined_both_sides() {
        let mut s = session();
        assert!(!s.mark_joined("alice"));
        assert!(!s.mark_joined("alice")); // repeat join, still one-sided
        assert!(!s.mark_joined("mallory")); // non-participant ignored
        assert!(s.mark_joined("bob"));
    }

    #[test]
    fn test_peer_of() {
        let s = session();
        assert_eq!(s.peer_of("alice"), Some("bob"));
        assert_eq!(s.peer_of("bob"), Some("alice"));
        assert_eq!(s.peer_of("mallory"), None);
    }

    #[test]
    fn test_store_active_index() {
        let store = SessionStore::new();
        store.try_insert(session()).unwrap();

        assert_eq!(store.active_session("alice").as_deref(), Some("sess-1"));
        assert_eq!(store.active_session("bob").as_deref(), Some("sess-1"));

        store.release("sess-1", ["alice", "bob"]);
        assert!(store.active_session("alice").is_none());
    }

    #[test]
    fn test_release_ignores_newer_engagement() {
        let store = SessionStore::new();
        store.try_insert(session()).unwrap();
        store.release("sess-1", ["alice", "bob"]);

        let mut s2 = session();
        s2.id = "sess-2".to_string();
        store.try_insert(s2).unwrap();

        // A late release for the old session must not unbind the new one
        store.release("sess-1", ["alice", "bob"]);
        assert_eq!(store.active_session("alice").as_deref(), Some("sess-2"));
    }

    #[test]
    fn test_insert_refuses_double_booking() {
        let store = SessionStore::new();
        store.try_insert(session()).unwrap();

        // Second invite to an engaged target: rejected, index untouched
        let mut s2 = session();
        s2.id = "sess-2".to_string();
        s2.initiator_id = "carol".to_string();
        let err = store.try_insert(s2).unwrap_err();
        assert!(matches!(err, SignalError::ResourceBusy(ref u) if u == "bob"));
        assert_eq!(store.active_session("bob").as_deref(), Some("sess-1"));
        assert!(store.active_session("carol").is_none());

        // Engaged initiator, free target: rejected with no dangling claim
        let mut s3 = session();
        s3.id = "sess-3".to_string();
        s3.target_id = "dave".to_string();
        let err = store.try_insert(s3).unwrap_err();
        assert!(matches!(err, SignalError::ResourceBusy(ref u) if u == "alice"));
        assert!(store.active_session("dave").is_none());
        assert!(store.get("sess-3").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_terminal() {
        let store = SessionStore::new();

        let live = store.try_insert(session()).unwrap();
        live.lock().await.apply(SessionState::Ringing);

        let mut done = session();
        done.id = "sess-2".to_string();
        done.initiator_id = "carol".to_string();
        done.target_id = "dave".to_string();
        let done = store.try_insert(done).unwrap();
        {
            let mut s = done.lock().await;
            s.apply(SessionState::Ringing);
            s.apply(SessionState::Ended);
            s.state_changed_at = 0; // long past retention
        }

        assert_eq!(store.sweep_terminal(Duration::from_secs(60)), 1);
        assert!(store.get("sess-1").is_some());
        assert!(store.get("sess-2").is_none());
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess_"));
    }
}
