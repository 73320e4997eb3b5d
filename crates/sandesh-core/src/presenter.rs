//! Client-side presentation of incoming session invites.
//!
//! A small deterministic state machine for the receiving client: it owns
//! the ringing resource (ringtone and vibration) exclusively, enforces a
//! local fail-safe ring timeout, and guarantees the resource is released
//! on every exit path. It is a pure consumer of events; the caller feeds
//! it invites, answers, clock ticks, and session events, and relays the
//! actions it emits back to the coordinator.

use crate::session::SessionId;
use sandesh_protocol::{SessionKind, SessionPhase};
use std::sync::Arc;
use tracing::debug;

/// Local fail-safe ring timeout, milliseconds.
///
/// Slightly above the coordinator's ring timeout so the server-side
/// verdict normally arrives first; this is the last line of defense when
/// it does not.
pub const RING_FAILSAFE_MS: u64 = 35_000;

/// Control surface for the device's ringing resource.
pub trait RingControl: Send + Sync {
    /// Start ringtone and vibration.
    fn start(&self);
    /// Stop ringtone and vibration.
    fn stop(&self);
}

/// Exclusive ownership of the ringing resource.
///
/// Ringing starts on construction and stops on drop, so every exit path
/// out of the ringing state releases the resource without cooperation.
struct RingGuard {
    control: Arc<dyn RingControl>,
}

impl RingGuard {
    fn acquire(control: Arc<dyn RingControl>) -> Self {
        control.start();
        Self { control }
    }
}

impl Drop for RingGuard {
    fn drop(&mut self) {
        self.control.stop();
    }
}

/// What the presenter is currently showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterState {
    /// Nothing presented.
    Idle,
    /// An invite is being presented, ringing resource held.
    Ringing {
        /// Session being offered.
        session_id: SessionId,
        /// Kind of session offered.
        kind: SessionKind,
    },
    /// The invite was accepted and the session is live.
    InSession {
        /// Active session.
        session_id: SessionId,
    },
    /// The presentation reached a terminal visual state.
    Ended {
        /// Session that ended.
        session_id: SessionId,
        /// How it ended.
        outcome: SessionPhase,
    },
}

/// An answer the caller must relay to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterAction {
    /// Send an accepting answer for the session.
    Accept(SessionId),
    /// Send a rejecting answer for the session.
    Reject(SessionId),
}

/// Incoming-invite presentation state machine.
///
/// Timer-agnostic: the owner calls [`Presenter::tick`] with its own clock,
/// which keeps timeout behavior deterministic under test.
pub struct Presenter {
    state: PresenterState,
    ring: Arc<dyn RingControl>,
    guard: Option<RingGuard>,
    deadline: Option<u64>,
    failsafe_ms: u64,
}

impl Presenter {
    /// Create an idle presenter over the given ring control.
    #[must_use]
    pub fn new(ring: Arc<dyn RingControl>) -> Self {
        Self {
            state: PresenterState::Idle,
            ring,
            guard: None,
            deadline: None,
            failsafe_ms: RING_FAILSAFE_MS,
        }
    }

    /// Override the fail-safe ring timeout.
    #[must_use]
    pub fn with_failsafe(mut self, failsafe_ms: u64) -> Self {
        self.failsafe_ms = failsafe_ms;
        self
    }

    /// Current presentation state.
    #[must_use]
    pub fn state(&self) -> &PresenterState {
        &self.state
    }

    /// Present an incoming invite.
    ///
    /// From `Idle` or `Ended` this acquires the ringing resource and arms
    /// the fail-safe deadline. While something is already presented or a
    /// session is active, the new invite is answered with an automatic
    /// busy rejection and the current presentation is untouched.
    pub fn on_invite(
        &mut self,
        session_id: impl Into<SessionId>,
        kind: SessionKind,
        now: u64,
    ) -> Option<PresenterAction> {
        let session_id = session_id.into();
        match self.state {
            PresenterState::Idle | PresenterState::Ended { .. } => {
                debug!(session = %session_id, ?kind, "Presenting invite");
                self.guard = Some(RingGuard::acquire(Arc::clone(&self.ring)));
                self.deadline = Some(now + self.failsafe_ms);
                self.state = PresenterState::Ringing { session_id, kind };
                None
            }
            _ => {
                debug!(session = %session_id, "Busy: auto-rejecting second invite");
                Some(PresenterAction::Reject(session_id))
            }
        }
    }

    /// The user accepted the presented invite.
    ///
    /// Releases the ringing resource and emits the accept to relay. A
    /// no-op outside the ringing state.
    pub fn accept(&mut self) -> Option<PresenterAction> {
        let PresenterState::Ringing { session_id, .. } = &self.state else {
            return None;
        };
        let session_id = session_id.clone();
        self.clear_ring();
        self.state = PresenterState::InSession {
            session_id: session_id.clone(),
        };
        Some(PresenterAction::Accept(session_id))
    }

    /// The user rejected the presented invite.
    ///
    /// Releases the ringing resource and emits the reject to relay. A
    /// no-op outside the ringing state.
    pub fn reject(&mut self) -> Option<PresenterAction> {
        let PresenterState::Ringing { session_id, .. } = &self.state else {
            return None;
        };
        let session_id = session_id.clone();
        self.clear_ring();
        self.state = PresenterState::Ended {
            session_id: session_id.clone(),
            outcome: SessionPhase::Rejected,
        };
        Some(PresenterAction::Reject(session_id))
    }

    /// Advance the local clock.
    ///
    /// If the fail-safe deadline has passed while still ringing, the
    /// invite is auto-rejected and the resource released, so the UI never
    /// rings forever on a lost verdict.
    pub fn tick(&mut self, now: u64) -> Option<PresenterAction> {
        let PresenterState::Ringing { session_id, .. } = &self.state else {
            return None;
        };
        if self.deadline.map_or(true, |d| now < d) {
            return None;
        }
        let session_id = session_id.clone();
        debug!(session = %session_id, "Ring fail-safe expired");
        self.clear_ring();
        self.state = PresenterState::Ended {
            session_id: session_id.clone(),
            outcome: SessionPhase::TimedOut,
        };
        Some(PresenterAction::Reject(session_id))
    }

    /// Apply a session event from the coordinator.
    ///
    /// Terminal phases for the presented session end the presentation
    /// and release the resource; events for other sessions, and
    /// non-terminal phases, are ignored so a stale event cannot re-open
    /// or disturb the UI.
    pub fn on_session_event(&mut self, session_id: &str, phase: SessionPhase) {
        if !phase.is_terminal() {
            return;
        }
        let current = match &self.state {
            PresenterState::Ringing { session_id, .. }
            | PresenterState::InSession { session_id } => session_id.clone(),
            _ => return,
        };
        if current != session_id {
            return;
        }
        self.clear_ring();
        self.state = PresenterState::Ended {
            session_id: current,
            outcome: phase,
        };
    }

    /// Attempt to dismiss the presentation (back navigation).
    ///
    /// Suppressed while ringing or in session: the only exits there are
    /// accept, reject, timeout, or a terminal session event. From a
    /// terminal state this resets to idle.
    pub fn try_dismiss(&mut self) -> bool {
        match self.state {
            PresenterState::Idle => true,
            PresenterState::Ended { .. } => {
                self.state = PresenterState::Idle;
                true
            }
            _ => false,
        }
    }

    fn clear_ring(&mut self) {
        self.guard = None;
        self.deadline = None;
    }
}
