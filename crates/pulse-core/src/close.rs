//! WebSocket close codes used by both ends.

/// Normal closure (user-initiated disconnect).
pub const NORMAL: u16 = 1000;
/// Server is shutting down.
pub const GOING_AWAY: u16 = 1001;
/// Connection replaced by a newer one from the same identity.
pub const EVICTED: u16 = 1008;
/// The server could not deliver to this connection.
pub const SEND_FAILED: u16 = 1011;
/// Global connection cap reached; try again later.
pub const TRY_AGAIN_LATER: u16 = 1013;
/// No heartbeat or ping within the timeout.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;
/// Credential rejected. Agents must not auto-reconnect after this.
pub const AUTH_FAILED: u16 = 4001;

/// Whether a close code means the credential is no good.
#[must_use]
pub fn is_auth_failure(code: u16) -> bool {
    code == AUTH_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_4001_is_auth_failure() {
        assert!(is_auth_failure(AUTH_FAILED));
        for code in [
            NORMAL,
            GOING_AWAY,
            EVICTED,
            SEND_FAILED,
            TRY_AGAIN_LATER,
            HEARTBEAT_TIMEOUT,
        ] {
            assert!(!is_auth_failure(code));
        }
    }
}
