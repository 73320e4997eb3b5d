//! Wire version for the hello/welcome handshake.
//!
//! The coordinator advertises [`WIRE_VERSION`] in every `Welcome`; a
//! client's `Hello` carries the version it speaks. The scheme is a single
//! byte with no minor component: any change to frame layout bumps it, and
//! the coordinator keeps serving every byte listed in [`SUPPORTED`] until
//! the old clients age out. A `Hello` outside that list is answered with
//! a bad-request error and the connection is left to the client to close.

/// Wire version the coordinator speaks, advertised in `Welcome`.
pub const WIRE_VERSION: u8 = 1;

/// Wire versions still accepted from a client's `Hello`.
pub const SUPPORTED: &[u8] = &[WIRE_VERSION];

/// Whether a client-advertised wire version can be served.
#[must_use]
pub fn supported(client: u8) -> bool {
    SUPPORTED.contains(&client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_is_served() {
        assert!(supported(WIRE_VERSION));
    }

    #[test]
    fn test_unknown_versions_refused() {
        assert!(!supported(0));
        assert!(!supported(WIRE_VERSION + 1));
    }
}
