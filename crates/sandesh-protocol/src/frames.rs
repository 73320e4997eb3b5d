//! Frame types for the sandesh signaling protocol.
//!
//! Frames are the unit of communication between a client and the
//! coordinator. Each frame is serialized using MessagePack for efficient
//! binary encoding.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Register = 0x03,
    CallRequest = 0x04,
    SessionCreated = 0x05,
    Invite = 0x06,
    Answer = 0x07,
    SessionConnect = 0x08,
    SessionEvent = 0x09,
    End = 0x0A,
    Chat = 0x0B,
    Receipt = 0x0C,
    Typing = 0x0D,
    HistoryRequest = 0x0E,
    HistoryPage = 0x0F,
    Ack = 0x10,
    Error = 0x11,
    Ping = 0x12,
    Pong = 0x13,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Welcome),
            0x03 => Ok(FrameType::Register),
            0x04 => Ok(FrameType::CallRequest),
            0x05 => Ok(FrameType::SessionCreated),
            0x06 => Ok(FrameType::Invite),
            0x07 => Ok(FrameType::Answer),
            0x08 => Ok(FrameType::SessionConnect),
            0x09 => Ok(FrameType::SessionEvent),
            0x0A => Ok(FrameType::End),
            0x0B => Ok(FrameType::Chat),
            0x0C => Ok(FrameType::Receipt),
            0x0D => Ok(FrameType::Typing),
            0x0E => Ok(FrameType::HistoryRequest),
            0x0F => Ok(FrameType::HistoryPage),
            0x10 => Ok(FrameType::Ack),
            0x11 => Ok(FrameType::Error),
            0x12 => Ok(FrameType::Ping),
            0x13 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// The kind of consultation session being signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum SessionKind {
    /// Text chat consultation.
    Chat = 0,
    /// Audio call.
    AudioCall = 1,
    /// Video call.
    VideoCall = 2,
}

impl SessionKind {
    /// Whether this kind carries real-time media (audio or video).
    #[must_use]
    pub fn is_call(self) -> bool {
        matches!(self, SessionKind::AudioCall | SessionKind::VideoCall)
    }
}

impl From<SessionKind> for u8 {
    fn from(k: SessionKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for SessionKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionKind::Chat),
            1 => Ok(SessionKind::AudioCall),
            2 => Ok(SessionKind::VideoCall),
            _ => Err("Invalid session kind"),
        }
    }
}

/// Delivery status of a chat message.
///
/// Statuses only advance forward; the numeric ordering is the
/// monotonicity rule (`Sent < Delivered < Read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DeliveryStatus {
    /// Accepted by the coordinator.
    Sent = 0,
    /// Delivered to the recipient's device.
    Delivered = 1,
    /// Read by the recipient.
    Read = 2,
}

impl From<DeliveryStatus> for u8 {
    fn from(s: DeliveryStatus) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for DeliveryStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeliveryStatus::Sent),
            1 => Ok(DeliveryStatus::Delivered),
            2 => Ok(DeliveryStatus::Read),
            _ => Err("Invalid delivery status"),
        }
    }
}

/// Session lifecycle phase as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum SessionPhase {
    Ringing = 0,
    Accepted = 1,
    Rejected = 2,
    TimedOut = 3,
    Connected = 4,
    Ended = 5,
}

impl SessionPhase {
    /// Whether this phase is terminal (no further transitions).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Rejected | SessionPhase::TimedOut | SessionPhase::Ended
        )
    }
}

impl From<SessionPhase> for u8 {
    fn from(p: SessionPhase) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for SessionPhase {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionPhase::Ringing),
            1 => Ok(SessionPhase::Accepted),
            2 => Ok(SessionPhase::Rejected),
            3 => Ok(SessionPhase::TimedOut),
            4 => Ok(SessionPhase::Connected),
            5 => Ok(SessionPhase::Ended),
            _ => Err("Invalid session phase"),
        }
    }
}

/// A chat message as returned by a history page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Message identifier, unique within the session.
    pub message_id: String,
    /// Sender user id.
    pub sender_id: String,
    /// Message text.
    pub text: String,
    /// Send timestamp, epoch milliseconds.
    pub sent_at: u64,
    /// Current delivery status.
    pub status: DeliveryStatus,
    /// Whether the requesting user sent this message. Resolved locally
    /// from the sender id, never trusted from a remote boolean.
    pub mine: bool,
}

/// Well-known error codes carried by [`Frame::Error`].
pub mod codes {
    pub const BAD_REQUEST: u16 = 2000;
    pub const INVALID_REGISTRATION: u16 = 2001;
    pub const TARGET_UNREACHABLE: u16 = 2002;
    pub const SESSION_NOT_FOUND: u16 = 2003;
    pub const SESSION_NOT_CONNECTED: u16 = 2004;
    pub const RESOURCE_BUSY: u16 = 2005;
    pub const INTERNAL: u16 = 2999;
}

/// A protocol frame.
///
/// Frames are the messages exchanged between clients and the coordinator.
/// Each frame type has specific fields relevant to its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol version.
        version: u8,
        /// Optional authentication token.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "welcome")]
    Welcome {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Bind this connection as the user's live handle.
    ///
    /// Repeated registration is an idempotent upsert; a wake token, when
    /// present, rotates the stored one.
    #[serde(rename = "register")]
    Register {
        /// Request ID for acknowledgment.
        id: u64,
        /// User identity to bind.
        user_id: String,
        /// Durable wake token for the notification channel.
        #[serde(skip_serializing_if = "Option::is_none")]
        wake_token: Option<String>,
    },

    /// Client-initiated session invite.
    #[serde(rename = "call-request")]
    CallRequest {
        /// Request ID for the response.
        id: u64,
        /// Target user identity.
        to_user_id: String,
        /// Kind of session requested.
        kind: SessionKind,
        /// Transport-opaque invite metadata (e.g. intake details).
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    /// Response to a successful [`Frame::CallRequest`].
    #[serde(rename = "session-created")]
    SessionCreated {
        /// ID of the originating request.
        id: u64,
        /// Newly allocated session identifier.
        session_id: String,
    },

    /// Routed invite delivered to the callee.
    ///
    /// Requires an application-level [`Frame::Ack`] within the transport
    /// ack timeout when delivered over the live transport.
    #[serde(rename = "invite")]
    Invite {
        /// Request ID to acknowledge.
        id: u64,
        /// Session identifier.
        session_id: String,
        /// Kind of session.
        kind: SessionKind,
        /// Caller user identity.
        from_user_id: String,
        /// Invite metadata attached by the caller.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    /// Callee's accept or reject of a ringing session.
    #[serde(rename = "answer")]
    Answer {
        /// Session identifier.
        session_id: String,
        /// `true` to accept, `false` to reject.
        accepted: bool,
    },

    /// Post-accept handshake join; both parties must send it before the
    /// session is marked connected.
    #[serde(rename = "session-connect")]
    SessionConnect {
        /// Session identifier.
        session_id: String,
    },

    /// Server-to-client session lifecycle notification.
    #[serde(rename = "session-event")]
    SessionEvent {
        /// Session identifier.
        session_id: String,
        /// New session phase.
        phase: SessionPhase,
        /// Optional human-readable reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Explicit hang-up / end of session.
    #[serde(rename = "end")]
    End {
        /// Session identifier.
        session_id: String,
        /// Optional reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Chat message within a session.
    #[serde(rename = "chat")]
    Chat {
        /// Session identifier.
        session_id: String,
        /// Client-generated message identifier.
        message_id: String,
        /// Sender user id (filled by the coordinator on relay).
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        /// Message text.
        text: String,
        /// Send timestamp, epoch milliseconds.
        sent_at: u64,
    },

    /// Delivery or read receipt for a chat message.
    #[serde(rename = "receipt")]
    Receipt {
        /// Session identifier.
        session_id: String,
        /// Message the receipt refers to.
        message_id: String,
        /// New delivery status.
        status: DeliveryStatus,
    },

    /// Ephemeral typing indicator. Never persisted.
    #[serde(rename = "typing")]
    Typing {
        /// Session identifier.
        session_id: String,
        /// Whether the peer is currently typing.
        active: bool,
    },

    /// Backward-paginated history request.
    #[serde(rename = "history-request")]
    HistoryRequest {
        /// Request ID for the response page.
        id: u64,
        /// Session identifier.
        session_id: String,
        /// Maximum number of messages to return.
        limit: u32,
        /// Return messages strictly earlier than this timestamp
        /// (epoch milliseconds); `None` means "from now".
        #[serde(skip_serializing_if = "Option::is_none")]
        before: Option<u64>,
    },

    /// Response page for a history request, oldest-first.
    #[serde(rename = "history-page")]
    HistoryPage {
        /// ID of the originating request.
        id: u64,
        /// Messages in non-decreasing `sent_at` order.
        entries: Vec<ChatRecord>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Register { .. } => FrameType::Register,
            Frame::CallRequest { .. } => FrameType::CallRequest,
            Frame::SessionCreated { .. } => FrameType::SessionCreated,
            Frame::Invite { .. } => FrameType::Invite,
            Frame::Answer { .. } => FrameType::Answer,
            Frame::SessionConnect { .. } => FrameType::SessionConnect,
            Frame::SessionEvent { .. } => FrameType::SessionEvent,
            Frame::End { .. } => FrameType::End,
            Frame::Chat { .. } => FrameType::Chat,
            Frame::Receipt { .. } => FrameType::Receipt,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::HistoryRequest { .. } => FrameType::HistoryRequest,
            Frame::HistoryPage { .. } => FrameType::HistoryPage,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Hello frame.
    #[must_use]
    pub fn hello(version: u8, token: Option<String>) -> Self {
        Frame::Hello { version, token }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Welcome {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Register frame.
    #[must_use]
    pub fn register(id: u64, user_id: impl Into<String>, wake_token: Option<String>) -> Self {
        Frame::Register {
            id,
            user_id: user_id.into(),
            wake_token,
        }
    }

    /// Create a new Invite frame.
    #[must_use]
    pub fn invite(
        id: u64,
        session_id: impl Into<String>,
        kind: SessionKind,
        from_user_id: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Frame::Invite {
            id,
            session_id: session_id.into(),
            kind,
            from_user_id: from_user_id.into(),
            payload,
        }
    }

    /// Create a new SessionEvent frame.
    #[must_use]
    pub fn session_event(
        session_id: impl Into<String>,
        phase: SessionPhase,
        reason: Option<String>,
    ) -> Self {
        Frame::SessionEvent {
            session_id: session_id.into(),
            phase,
            reason,
        }
    }

    /// Create a new Receipt frame.
    #[must_use]
    pub fn receipt(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        status: DeliveryStatus,
    ) -> Self {
        Frame::Receipt {
            session_id: session_id.into(),
            message_id: message_id.into(),
            status,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let register = Frame::register(1, "user-1", None);
        assert_eq!(register.frame_type(), FrameType::Register);

        let invite = Frame::invite(2, "sess-1", SessionKind::AudioCall, "user-1", None);
        assert_eq!(invite.frame_type(), FrameType::Invite);
    }

    #[test]
    fn test_session_kind_conversion() {
        assert_eq!(SessionKind::try_from(0), Ok(SessionKind::Chat));
        assert_eq!(SessionKind::try_from(1), Ok(SessionKind::AudioCall));
        assert_eq!(SessionKind::try_from(2), Ok(SessionKind::VideoCall));
        assert!(SessionKind::try_from(3).is_err());

        assert!(!SessionKind::Chat.is_call());
        assert!(SessionKind::VideoCall.is_call());
    }

    #[test]
    fn test_delivery_status_ordering() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
        assert!(DeliveryStatus::try_from(3).is_err());
    }

    #[test]
    fn test_session_phase_terminal() {
        assert!(SessionPhase::Rejected.is_terminal());
        assert!(SessionPhase::TimedOut.is_terminal());
        assert!(SessionPhase::Ended.is_terminal());
        assert!(!SessionPhase::Ringing.is_terminal());
        assert!(!SessionPhase::Connected.is_terminal());
    }
}
