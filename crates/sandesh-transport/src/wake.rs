//! Wake-channel implementations.
//!
//! The wake channel is the out-of-band path for rousing a client whose
//! live connection is gone. The real push gateway lives outside this
//! repository; what ships here is a local bridge for tests and embedded
//! deployments, and a no-op sink for wake-less setups.

use async_trait::async_trait;
use sandesh_core::{WakeChannel, WakePayload, WakeToken};
use tokio::sync::mpsc;
use tracing::debug;

/// Wake channel that hands payloads to an in-process receiver.
///
/// Honors the at-most-once contract: if the receiver is gone the payload
/// is dropped, never queued for retry.
pub struct MpscWake {
    tx: mpsc::UnboundedSender<(WakeToken, WakePayload)>,
}

impl MpscWake {
    /// Create a wake channel and the receiver it delivers into.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(WakeToken, WakePayload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WakeChannel for MpscWake {
    async fn push(&self, token: &WakeToken, payload: WakePayload) -> bool {
        self.tx.send((token.clone(), payload)).is_ok()
    }
}

/// Wake channel that drops every payload.
///
/// For deployments without a push gateway: wake-routed invites then rely
/// solely on the ring timeout.
#[derive(Debug, Default)]
pub struct NoopWake;

impl NoopWake {
    /// Create a no-op wake channel.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WakeChannel for NoopWake {
    async fn push(&self, token: &WakeToken, payload: WakePayload) -> bool {
        debug!(token = %token, session = %payload.session_id, "Wake dropped (no gateway)");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandesh_protocol::SessionKind;

    fn payload(session_id: &str) -> WakePayload {
        WakePayload {
            session_id: session_id.to_string(),
            kind: SessionKind::AudioCall,
            from_user_id: "caller-1".to_string(),
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_mpsc_wake_delivers() {
        let (wake, mut rx) = MpscWake::channel();

        assert!(wake.push(&"tok-1".to_string(), payload("s1")).await);

        let (token, delivered) = rx.recv().await.unwrap();
        assert_eq!(token, "tok-1");
        assert_eq!(delivered.session_id, "s1");
    }

    #[tokio::test]
    async fn test_mpsc_wake_drops_without_receiver() {
        let (wake, rx) = MpscWake::channel();
        drop(rx);

        assert!(!wake.push(&"tok-1".to_string(), payload("s1")).await);
    }

    #[tokio::test]
    async fn test_noop_wake_always_drops() {
        let wake = NoopWake::new();
        assert!(!wake.push(&"tok-1".to_string(), payload("s1")).await);
    }
}
