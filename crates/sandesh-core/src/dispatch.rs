//! Invite routing and session-lifecycle driving for sandesh.
//!
//! The dispatcher owns the routing decision for every session invite:
//! prefer the target's live transport (request/acknowledge), fall back to
//! a single fire-and-forget wake notification, and fail fast when neither
//! endpoint is known. It also drives the ring and handshake timers, with
//! race-free cancellation: a timer firing after its session advanced is a
//! no-op.

use crate::error::SignalError;
use crate::presence::{PresenceRegistry, UserId, WakeToken};
use crate::session::{
    generate_session_id, Session, SessionId, SessionSnapshot, SessionState, SessionStore,
    RouteKind, Transition,
};
use async_trait::async_trait;
use dashmap::DashMap;
use sandesh_protocol::{Frame, SessionKind, SessionPhase};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Payload carried by a wake notification.
///
/// Holds enough for the woken client to render an invite UI without
/// further round-trips; the live-transport resync after reconnection is
/// the authoritative confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakePayload {
    /// Session being offered.
    pub session_id: SessionId,
    /// Kind of session.
    pub kind: SessionKind,
    /// Caller user identity.
    pub from_user_id: UserId,
    /// Invite metadata attached by the caller.
    pub payload: Option<serde_json::Value>,
}

/// One-shot, at-most-once, best-effort push channel used to rouse a
/// backgrounded or killed client.
///
/// Implementations must mark the message high-priority with zero TTL: if
/// the destination is unreachable right now, the message is dropped,
/// never queued, and never retried. Callers needing retry semantics must
/// re-invoke at the dispatcher level explicitly.
#[async_trait]
pub trait WakeChannel: Send + Sync {
    /// Push a wake payload to a durable token.
    ///
    /// Returns `true` if the channel accepted the push. Acceptance is not
    /// a delivery guarantee.
    async fn push(&self, token: &WakeToken, payload: WakePayload) -> bool;
}

/// Dispatcher timing configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long to wait for the live transport's application-level ack.
    pub transport_ack_timeout: Duration,
    /// How long a session may ring before timing out.
    pub ring_timeout: Duration,
    /// Grace window for the post-accept session-connect handshake.
    pub handshake_grace: Duration,
    /// How long terminal sessions are retained before sweeping.
    pub terminal_retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transport_ack_timeout: Duration::from_secs(10),
            ring_timeout: Duration::from_secs(30),
            handshake_grace: Duration::from_secs(10),
            terminal_retention: Duration::from_secs(300),
        }
    }
}

/// A timer armed for one session state.
///
/// The generation lets a fired task tell whether the map entry is still
/// its own; `guards` is the state the timer was armed against, checked
/// under the session lock before any timeout is applied.
struct ArmedTimer {
    generation: u64,
    guards: SessionState,
    task: JoinHandle<()>,
}

/// The invite router and session-lifecycle driver.
///
/// Constructed once per process with injected collaborators and shared by
/// reference; there is no global transport singleton.
pub struct Dispatcher {
    registry: Arc<PresenceRegistry>,
    sessions: Arc<SessionStore>,
    wake: Arc<dyn WakeChannel>,
    config: DispatchConfig,
    /// Pending application-level acks, keyed by request id.
    acks: DashMap<u64, oneshot::Sender<()>>,
    /// Per-session ring/handshake timer, replaced on each arming.
    timers: DashMap<SessionId, ArmedTimer>,
    request_ids: AtomicU64,
    timer_generations: AtomicU64,
    /// Back-reference handed to spawned timer tasks.
    me: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Create a new dispatcher.
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        sessions: Arc<SessionStore>,
        wake: Arc<dyn WakeChannel>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        info!(
            ack_timeout_ms = config.transport_ack_timeout.as_millis() as u64,
            ring_timeout_ms = config.ring_timeout.as_millis() as u64,
            "Creating dispatcher"
        );
        Arc::new_cyclic(|me| Self {
            registry,
            sessions,
            wake,
            config,
            acks: DashMap::new(),
            timers: DashMap::new(),
            request_ids: AtomicU64::new(1),
            timer_generations: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    /// The dispatcher's timing configuration.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve a pending application-level ack.
    ///
    /// Unknown or already-resolved ids are no-ops, absorbing duplicate
    /// deliveries.
    pub fn resolve_ack(&self, request_id: u64) {
        if let Some((_, tx)) = self.acks.remove(&request_id) {
            let _ = tx.send(());
        }
    }

    /// Push a frame to a user's live connection, if any.
    fn notify(&self, user_id: &str, frame: Frame) {
        if let Some(handle) = self.registry.live_handle(user_id) {
            if !handle.send(frame) {
                debug!(user = %user_id, "Notify dropped: connection gone");
            }
        }
    }

    fn notify_event(&self, user_id: &str, session_id: &str, phase: SessionPhase, reason: Option<&str>) {
        self.notify(
            user_id,
            Frame::session_event(session_id, phase, reason.map(str::to_string)),
        );
    }

    /// Create a session and route its invite to the target.
    ///
    /// Routing preference: live transport with ack-or-timeout, then a
    /// single wake push (optimistic ringing), else immediate timeout.
    /// Transport-level failures after routing begins are expressed as
    /// session-state transitions, not errors; the session id is returned
    /// whenever a route was attempted.
    ///
    /// # Errors
    ///
    /// - [`SignalError::ResourceBusy`] if either party is already
    ///   engaged. The engagement index is claimed atomically, so two
    ///   simultaneous invites to one target cannot both book them.
    /// - [`SignalError::TargetUnreachable`] if the target has neither a
    ///   live handle nor a wake token; the allocated session is left in
    ///   `TimedOut`, never in `Ringing`.
    pub async fn create_and_route(
        &self,
        initiator_id: &str,
        target_id: &str,
        kind: SessionKind,
        payload: Option<serde_json::Value>,
    ) -> Result<SessionId, SignalError> {
        let session_id = generate_session_id();
        let handle = self.sessions.try_insert(Session::new(
            session_id.clone(),
            kind,
            initiator_id,
            target_id,
            payload.clone(),
        ))?;

        debug!(session = %session_id, from = %initiator_id, to = %target_id, ?kind, "Session requested");

        let record = self.registry.lookup(target_id);
        let live = record.as_ref().and_then(|r| r.live.clone());
        let wake_token = record.as_ref().and_then(|r| r.wake_token.clone());

        // Live transport first: request/acknowledge. No wake is issued
        // while a live handle exists; the live transport is authoritative.
        if let Some(live) = live {
            let request_id = self.next_request_id();
            let (tx, rx) = oneshot::channel();
            self.acks.insert(request_id, tx);

            let invite = Frame::invite(
                request_id,
                session_id.clone(),
                kind,
                initiator_id,
                payload.clone(),
            );

            if live.send(invite) {
                let acked =
                    tokio::time::timeout(self.config.transport_ack_timeout, rx).await;
                self.acks.remove(&request_id);

                match acked {
                    Ok(Ok(())) => {
                        let mut session = handle.lock().await;
                        if session.apply(SessionState::Ringing) == Transition::Applied {
                            session.route = Some(RouteKind::Live);
                            drop(session);
                            self.arm_timer(
                                &session_id,
                                self.config.ring_timeout,
                                SessionState::Ringing,
                            );
                            self.notify_event(
                                initiator_id,
                                &session_id,
                                SessionPhase::Ringing,
                                None,
                            );
                        }
                        return Ok(session_id);
                    }
                    _ => {
                        warn!(session = %session_id, "Invite not acked within transport timeout");
                        let mut session = handle.lock().await;
                        if session.apply(SessionState::TimedOut) == Transition::Applied {
                            self.sessions
                                .release(&session_id, [initiator_id, target_id]);
                            drop(session);
                            self.notify_event(
                                initiator_id,
                                &session_id,
                                SessionPhase::TimedOut,
                                Some("transport ack timeout"),
                            );
                        }
                        return Ok(session_id);
                    }
                }
            }

            // Connection went away between lookup and send; fall through
            // to the wake path.
            self.acks.remove(&request_id);
        }

        if let Some(token) = wake_token {
            // Exactly one push, fire-and-forget: the wake channel offers
            // no delivery guarantee, so the reconnect resync is the
            // confirmation path, not a retry loop.
            let accepted = self
                .wake
                .push(
                    &token,
                    WakePayload {
                        session_id: session_id.clone(),
                        kind,
                        from_user_id: initiator_id.to_string(),
                        payload,
                    },
                )
                .await;
            debug!(session = %session_id, accepted, "Wake notification dispatched");

            let mut session = handle.lock().await;
            if session.apply(SessionState::Ringing) == Transition::Applied {
                session.route = Some(RouteKind::Wake);
                drop(session);
                self.arm_timer(&session_id, self.config.ring_timeout, SessionState::Ringing);
                self.notify_event(initiator_id, &session_id, SessionPhase::Ringing, None);
            }
            return Ok(session_id);
        }

        let mut session = handle.lock().await;
        session.apply(SessionState::TimedOut);
        drop(session);
        self.sessions.release(&session_id, [initiator_id, target_id]);
        Err(SignalError::TargetUnreachable(target_id.to_string()))
    }

    /// Handle the target's accept or reject of a ringing session.
    ///
    /// Answers for a session not in `Ringing`, or from anyone but the
    /// target, are no-ops: at-least-once wake/ack paths may deliver
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SessionNotFound`] for an unknown session id.
    pub async fn answer(
        &self,
        session_id: &str,
        user_id: &str,
        accepted: bool,
    ) -> Result<(), SignalError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?;

        let mut session = handle.lock().await;
        if session.target_id != user_id || session.state != SessionState::Ringing {
            return Ok(());
        }

        if accepted {
            session.apply(SessionState::Accepted);
            let initiator = session.initiator_id.clone();
            drop(session);
            // Accept starts the session-connect handshake window.
            self.arm_timer(session_id, self.config.handshake_grace, SessionState::Accepted);
            self.notify_event(&initiator, session_id, SessionPhase::Accepted, None);
        } else {
            session.apply(SessionState::Rejected);
            let initiator = session.initiator_id.clone();
            let target = session.target_id.clone();
            drop(session);
            self.cancel_timer(session_id);
            self.sessions.release(session_id, [&initiator, &target]);
            self.notify_event(&initiator, session_id, SessionPhase::Rejected, None);
        }

        Ok(())
    }

    /// Handle a participant's session-connect handshake join.
    ///
    /// Once both parties have joined within the grace window, the session
    /// becomes `Connected` and both are notified.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SessionNotFound`] for an unknown session id.
    pub async fn join_connected(&self, session_id: &str, user_id: &str) -> Result<(), SignalError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?;

        let mut session = handle.lock().await;
        if session.state != SessionState::Accepted {
            return Ok(());
        }

        if session.mark_joined(user_id) && session.apply(SessionState::Connected) == Transition::Applied {
            let initiator = session.initiator_id.clone();
            let target = session.target_id.clone();
            drop(session);
            self.cancel_timer(session_id);
            self.notify_event(&initiator, session_id, SessionPhase::Connected, None);
            self.notify_event(&target, session_id, SessionPhase::Connected, None);
        }

        Ok(())
    }

    /// Explicitly end a session (hang-up or peer hard disconnect).
    ///
    /// Valid from `Ringing`, `Accepted`, and `Connected`; anything else is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SessionNotFound`] for an unknown session id.
    pub async fn end(
        &self,
        session_id: &str,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<(), SignalError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?;

        let mut session = handle.lock().await;
        if !session.involves(user_id) {
            return Ok(());
        }

        if session.apply(SessionState::Ended) == Transition::Applied {
            let initiator = session.initiator_id.clone();
            let target = session.target_id.clone();
            drop(session);
            self.cancel_timer(session_id);
            self.sessions.release(session_id, [&initiator, &target]);
            self.notify_event(&initiator, session_id, SessionPhase::Ended, reason.as_deref());
            self.notify_event(&target, session_id, SessionPhase::Ended, reason.as_deref());
        }

        Ok(())
    }

    /// Handle a user's live-transport disconnect.
    ///
    /// Clears the live handle (wake token retained) and ends any
    /// non-terminal session the user is engaged in.
    pub async fn on_disconnect(&self, user_id: &str, connection_id: &str) {
        self.registry.mark_disconnected(user_id, connection_id);

        if let Some(session_id) = self.sessions.active_session(user_id) {
            debug!(user = %user_id, session = %session_id, "Ending session on hard disconnect");
            let _ = self
                .end(&session_id, user_id, Some("peer disconnected".to_string()))
                .await;
        }
    }

    /// Reconnect resync: the user's current non-terminal session, if any.
    ///
    /// A client woken by a wake notification registers a fresh live handle
    /// and pulls this snapshot to confirm the optimistic session state.
    pub async fn resync(&self, user_id: &str) -> Option<SessionSnapshot> {
        let session_id = self.sessions.active_session(user_id)?;
        let handle = self.sessions.get(&session_id)?;
        let session = handle.lock().await;
        (!session.is_terminal()).then(|| SessionSnapshot::from(&*session))
    }

    /// Arm (or re-arm) the session's timer against the state it guards.
    /// The previous timer, if any, is aborted.
    fn arm_timer(&self, session_id: &str, after: Duration, guards: SessionState) {
        let Some(dispatcher) = self.me.upgrade() else {
            return;
        };
        let generation = self.timer_generations.fetch_add(1, Ordering::Relaxed);
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            dispatcher.on_timer_expired(&id, generation, guards).await;
        });

        if let Some(old) = self.timers.insert(
            session_id.to_string(),
            ArmedTimer {
                generation,
                guards,
                task,
            },
        ) {
            old.task.abort();
        }
    }

    /// Cancel the session's timer, racing safely with a concurrent fire.
    fn cancel_timer(&self, session_id: &str) {
        if let Some((_, timer)) = self.timers.remove(session_id) {
            timer.task.abort();
        }
    }

    /// A ring or handshake timer expired.
    ///
    /// The guarded state is re-checked under the session lock: a timer
    /// whose abort raced the session advancing (and possibly re-arming a
    /// newer timer) finds a state it did not guard and backs off without
    /// touching anything. Only the task's own map entry is cleaned up.
    async fn on_timer_expired(&self, session_id: &str, generation: u64, guards: SessionState) {
        let Some(handle) = self.sessions.get(session_id) else {
            self.timers
                .remove_if(session_id, |_, t| t.generation == generation);
            return;
        };

        let mut session = handle.lock().await;
        self.timers
            .remove_if(session_id, |_, t| t.generation == generation);
        if session.state != guards {
            return;
        }

        let reason = match guards {
            SessionState::Ringing => "ring timeout",
            SessionState::Accepted => "handshake timeout",
            _ => return,
        };

        if session.apply(SessionState::TimedOut) == Transition::Applied {
            info!(session = %session_id, reason, "Session timed out");
            let initiator = session.initiator_id.clone();
            let target = session.target_id.clone();
            drop(session);
            self.sessions.release(session_id, [&initiator, &target]);
            self.notify_event(&initiator, session_id, SessionPhase::TimedOut, Some(reason));
            self.notify_event(&target, session_id, SessionPhase::TimedOut, Some(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::LiveHandle;
    use tokio::sync::mpsc;

    struct RecordingWake {
        pushes: std::sync::Mutex<Vec<(WakeToken, WakePayload)>>,
    }

    impl RecordingWake {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pushes: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WakeChannel for RecordingWake {
        async fn push(&self, token: &WakeToken, payload: WakePayload) -> bool {
            self.pushes.lock().unwrap().push((token.clone(), payload));
            true
        }
    }

    struct Rig {
        registry: Arc<PresenceRegistry>,
        sessions: Arc<SessionStore>,
        wake: Arc<RecordingWake>,
        dispatcher: Arc<Dispatcher>,
    }

    fn rig() -> Rig {
        let registry = Arc::new(PresenceRegistry::new());
        let sessions = Arc::new(SessionStore::new());
        let wake = RecordingWake::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            wake.clone(),
            DispatchConfig::default(),
        );
        Rig {
            registry,
            sessions,
            wake,
            dispatcher,
        }
    }

    fn connect(rig: &Rig, user: &str, conn: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        rig.registry
            .register(user, Some(LiveHandle::new(conn, tx)), None)
            .unwrap();
        rx
    }

    fn phase_of(frame: &Frame) -> Option<SessionPhase> {
        match frame {
            Frame::SessionEvent { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let r = rig();
        let err = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SignalError::TargetUnreachable(_)));
        assert_eq!(r.wake.count(), 0);
        // The allocated session is terminal immediately, never Ringing
        assert_eq!(r.sessions.sweep_terminal(Duration::ZERO), 1);
        assert!(r.sessions.active_session("bob").is_none());
    }

    #[tokio::test]
    async fn test_wake_route_rings_optimistically() {
        let r = rig();
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::AudioCall, None)
            .await
            .unwrap();

        assert_eq!(r.wake.count(), 1);
        let snapshot = r.dispatcher.resync("bob").await.unwrap();
        assert_eq!(snapshot.session_id, sid);
        assert_eq!(snapshot.state, SessionState::Ringing);

        let (token, payload) = r.wake.pushes.lock().unwrap()[0].clone();
        assert_eq!(token, "wake-tok");
        assert_eq!(payload.session_id, sid);
        assert_eq!(payload.from_user_id, "alice");
    }

    #[tokio::test]
    async fn test_live_route_no_wake_issued() {
        let r = rig();
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();
        let mut bob_rx = connect(&r, "bob", "conn-bob");

        let dispatcher = r.dispatcher.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .create_and_route("alice", "bob", SessionKind::VideoCall, None)
                .await
        });

        let invite = bob_rx.recv().await.unwrap();
        let Frame::Invite { id, kind, .. } = invite else {
            panic!("expected invite, got {:?}", invite);
        };
        assert_eq!(kind, SessionKind::VideoCall);

        r.dispatcher.resolve_ack(id);
        let sid = task.await.unwrap().unwrap();

        // Live transport is authoritative: no wake while live
        assert_eq!(r.wake.count(), 0);
        let snapshot = r.dispatcher.resync("bob").await.unwrap();
        assert_eq!(snapshot.session_id, sid);
        assert_eq!(snapshot.state, SessionState::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_ack_timeout_times_out_session() {
        let r = rig();
        let mut bob_rx = connect(&r, "bob", "conn-bob");

        // Never acked: the ack timeout elapses under paused time
        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap();

        assert!(matches!(bob_rx.recv().await, Some(Frame::Invite { .. })));
        assert!(r.dispatcher.resync("bob").await.is_none());
        assert!(r.sessions.active_session("bob").is_none());
        assert!(!sid.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_fires_exactly_once() {
        let r = rig();
        let mut alice_rx = connect(&r, "alice", "conn-alice");
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::AudioCall, None)
            .await
            .unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ringing));

        tokio::time::sleep(Duration::from_secs(31)).await;

        let event = alice_rx.recv().await.unwrap();
        assert_eq!(phase_of(&event), Some(SessionPhase::TimedOut));
        assert!(r.dispatcher.resync("bob").await.is_none());

        // A late answer after the timeout is absorbed, not an error
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();
        assert!(alice_rx.try_recv().is_err());
        assert!(r.dispatcher.resync("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_accept_handshake_connects_both() {
        let r = rig();
        let mut alice_rx = connect(&r, "alice", "conn-alice");
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ringing));

        // Bob wakes, reconnects, accepts
        let mut bob_rx = connect(&r, "bob", "conn-bob2");
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Accepted));

        r.dispatcher.join_connected(&sid, "alice").await.unwrap();
        r.dispatcher.join_connected(&sid, "bob").await.unwrap();

        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Connected));
        assert_eq!(phase_of(&bob_rx.recv().await.unwrap()), Some(SessionPhase::Connected));

        let snapshot = r.dispatcher.resync("alice").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);

        r.dispatcher.end(&sid, "alice", None).await.unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ended));
        assert_eq!(phase_of(&bob_rx.recv().await.unwrap()), Some(SessionPhase::Ended));
        assert!(r.dispatcher.resync("alice").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_grace_expiry() {
        let r = rig();
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::VideoCall, None)
            .await
            .unwrap();
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();

        // Only one side joins; the grace window expires
        r.dispatcher.join_connected(&sid, "bob").await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(r.dispatcher.resync("bob").await.is_none());
        let handle = r.sessions.get(&sid).unwrap();
        assert_eq!(handle.lock().await.state, SessionState::TimedOut);
    }

    #[tokio::test]
    async fn test_reject_is_terminal_and_duplicates_absorbed() {
        let r = rig();
        let mut alice_rx = connect(&r, "alice", "conn-alice");
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap();
        alice_rx.recv().await.unwrap(); // ringing

        r.dispatcher.answer(&sid, "bob", false).await.unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Rejected));

        // Duplicate reject and a late accept are both no-ops
        r.dispatcher.answer(&sid, "bob", false).await.unwrap();
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_ring_timer_ignores_accepted_session() {
        let r = rig();
        let mut alice_rx = connect(&r, "alice", "conn-alice");
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        // Ring timer armed here carries generation 1 and guards Ringing
        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::AudioCall, None)
            .await
            .unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ringing));

        let _bob_rx = connect(&r, "bob", "conn-bob");
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Accepted));

        // The ring timer's fire can race the accept: its task may already
        // be past the abort when the handshake timer replaces it. Replay
        // that fire directly; it guards Ringing, so it must not read the
        // accepted session as a handshake timeout.
        r.dispatcher.on_timer_expired(&sid, 1, SessionState::Ringing).await;

        let snapshot = r.dispatcher.resync("bob").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Accepted);
        assert!(alice_rx.try_recv().is_err());
        // The handshake timer's entry survives the stale cleanup
        let entry = r.dispatcher.timers.get(&sid).unwrap();
        assert_eq!(entry.guards, SessionState::Accepted);
        assert_ne!(entry.generation, 1);
    }

    #[tokio::test]
    async fn test_busy_target_rejected_fast() {
        let r = rig();
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        r.dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap();

        let err = r
            .dispatcher
            .create_and_route("carol", "bob", SessionKind::Chat, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::ResourceBusy(_)));
        assert_eq!(r.wake.count(), 1);
    }

    #[tokio::test]
    async fn test_wake_invite_accept_chat_flow() {
        use crate::chat::{MemoryStore, MessageChannel};
        use sandesh_protocol::DeliveryStatus;

        let r = rig();
        let store = Arc::new(MemoryStore::new());
        let channel = MessageChannel::new(r.sessions.clone(), r.registry.clone(), store.clone());

        let mut alice_rx = connect(&r, "alice", "conn-alice");
        r.registry
            .register("bob", None, Some("wake-tok".to_string()))
            .unwrap();

        // Bob is wake-only: exactly one push, optimistic ringing
        let sid = r
            .dispatcher
            .create_and_route("alice", "bob", SessionKind::Chat, None)
            .await
            .unwrap();
        assert_eq!(r.wake.count(), 1);
        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ringing));

        // Bob wakes, registers a live handle, accepts, both connect
        let mut bob_rx = connect(&r, "bob", "conn-bob");
        assert_eq!(
            r.dispatcher.resync("bob").await.unwrap().state,
            SessionState::Ringing
        );
        r.dispatcher.answer(&sid, "bob", true).await.unwrap();
        r.dispatcher.join_connected(&sid, "alice").await.unwrap();
        r.dispatcher.join_connected(&sid, "bob").await.unwrap();
        alice_rx.recv().await.unwrap(); // accepted
        alice_rx.recv().await.unwrap(); // connected
        bob_rx.recv().await.unwrap(); // connected

        // Messaging over the connected session
        channel.send(&sid, "alice", "m1", "namaste", 1_000).await.unwrap();
        assert!(matches!(bob_rx.recv().await.unwrap(), Frame::Chat { .. }));

        channel
            .receipt(&sid, "bob", "m1", DeliveryStatus::Delivered)
            .await
            .unwrap();
        channel
            .receipt(&sid, "bob", "m1", DeliveryStatus::Read)
            .await
            .unwrap();
        // Duplicate delivered after read regresses nothing and relays nothing
        channel
            .receipt(&sid, "bob", "m1", DeliveryStatus::Delivered)
            .await
            .unwrap();

        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            Frame::Receipt { status: DeliveryStatus::Delivered, .. }
        ));
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            Frame::Receipt { status: DeliveryStatus::Read, .. }
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_ends_active_session() {
        let r = rig();
        let mut alice_rx = connect(&r, "alice", "conn-alice");
        let _bob_rx = connect(&r, "bob", "conn-bob");

        let dispatcher = r.dispatcher.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .create_and_route("alice", "bob", SessionKind::AudioCall, None)
                .await
        });
        // Target acks the invite on its own connection
        let registry = r.registry.clone();
        let invite_id = {
            let mut bob_rx = _bob_rx;
            let Frame::Invite { id, .. } = bob_rx.recv().await.unwrap() else {
                panic!("expected invite");
            };
            registry.register("bob", None, Some("tok".to_string())).unwrap();
            id
        };
        r.dispatcher.resolve_ack(invite_id);
        let sid = task.await.unwrap().unwrap();
        alice_rx.recv().await.unwrap(); // ringing

        r.dispatcher.on_disconnect("bob", "conn-bob").await;

        assert_eq!(phase_of(&alice_rx.recv().await.unwrap()), Some(SessionPhase::Ended));
        let handle = r.sessions.get(&sid).unwrap();
        assert_eq!(handle.lock().await.state, SessionState::Ended);
        // Wake token survives the disconnect
        assert_eq!(
            r.registry.lookup("bob").unwrap().wake_token.as_deref(),
            Some("tok")
        );
    }
}
