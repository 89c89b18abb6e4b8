/// Close codes the voice gateway may end a websocket with.
///
/// The numeric values are fixed by the platform's published protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseCode {
    /// An invalid opcode was sent.
    UnknownOpcode,
    /// An invalid payload was sent.
    FailedToDecodePayload,
    /// A payload was sent prior to identifying.
    NotAuthenticated,
    /// The token used while identifying was invalid.
    AuthenticationFailed,
    /// More than one identify was sent on the same websocket.
    AlreadyAuthenticated,
    /// The session is no longer valid.
    SessionInvalid,
    /// The session timed out; a new one must be started.
    SessionTimeout,
    /// The requested voice server could not be found.
    ServerNotFound,
    /// An unrecognised protocol was selected.
    UnknownProtocol,
    /// The client was forcibly disconnected (kicked, channel deleted, ...).
    ///
    /// Clients should not attempt to reconnect.
    Disconnected,
    /// The voice server crashed; clients should resume.
    VoiceServerCrash,
    /// An unrecognised encryption scheme was selected.
    UnknownEncryptionMode,
}

impl CloseCode {
    /// Parses a wire close code, if it is one of the platform's voice codes.
    pub fn from_u16(value: u16) -> Option<Self> {
        use CloseCode::*;
        Some(match value {
            4001 => UnknownOpcode,
            4002 => FailedToDecodePayload,
            4003 => NotAuthenticated,
            4004 => AuthenticationFailed,
            4005 => AlreadyAuthenticated,
            4006 => SessionInvalid,
            4009 => SessionTimeout,
            4011 => ServerNotFound,
            4012 => UnknownProtocol,
            4014 => Disconnected,
            4015 => VoiceServerCrash,
            4016 => UnknownEncryptionMode,
            _ => return None,
        })
    }

    /// Indicates whether a client should attempt to restore its session in
    /// response to this close code.
    pub fn should_resume(self) -> bool {
        use CloseCode::*;
        matches!(
            self,
            UnknownOpcode | FailedToDecodePayload | SessionTimeout | VoiceServerCrash
        )
    }
}

/// Decides whether a remote closure with the given code may be recovered by
/// reconnecting.
///
/// Codes on the platform's allow-list reconnect; so do abnormal transport
/// closures (e.g. 1006) and codes the platform has not defined. Clean remote
/// closures (1000/1001) and the remaining voice codes are terminal.
pub(crate) fn allows_reconnect(code: Option<u16>) -> bool {
    match code {
        Some(1000) | Some(1001) => false,
        Some(code) => CloseCode::from_u16(code).map_or(true, CloseCode::should_resume),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_matches_protocol() {
        for code in [4001, 4002, 4009, 4015] {
            assert!(allows_reconnect(Some(code)), "{} should reconnect", code);
        }

        for code in [1000, 1001, 4003, 4004, 4005, 4006, 4011, 4012, 4014, 4016] {
            assert!(!allows_reconnect(Some(code)), "{} should be terminal", code);
        }
    }

    #[test]
    fn abnormal_and_unknown_closures_reconnect() {
        assert!(allows_reconnect(Some(1006)));
        assert!(allows_reconnect(Some(4042)));
        assert!(allows_reconnect(None));
    }
}
