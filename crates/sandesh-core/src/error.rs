//! Error taxonomy for the signaling core.

use thiserror::Error;

/// Errors surfaced by the presence registry, dispatcher, and message
/// channel.
///
/// Transport-level failures (ack timeout, handshake timeout) are normally
/// translated into session-state transitions rather than returned to
/// callers; the variants exist so the transitions can carry a typed
/// reason.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    /// Registration carried neither a live handle nor a wake token.
    #[error("Registration must carry a live handle or a wake token")]
    InvalidRegistration,

    /// Target has neither a live handle nor a wake token.
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    /// Unknown session id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation requires a connected session.
    #[error("Session not connected: {0}")]
    SessionNotConnected(String),

    /// The target is already engaged in a session, or a local ringing
    /// resource is already owned.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// The live transport did not acknowledge within the ack timeout.
    #[error("Transport ack timeout for session {0}")]
    TransportAckTimeout(String),

    /// The session-connect handshake did not complete within the grace
    /// window.
    #[error("Handshake timeout for session {0}")]
    HandshakeTimeout(String),
}
