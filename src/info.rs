use std::fmt;

/// Parameters needed to open one voice gateway session, as delivered by a
/// voice-server-update on the platform's main gateway.
///
/// A newer `SessionInfo` for the same [`Member`] supersedes any handshake
/// still in flight with an older one.
///
/// [`Member`]: crate::Member
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct SessionInfo {
    /// Unique string describing this session for validation/authentication purposes.
    pub session_id: String,
    /// Host of the voice websocket gateway server assigned to this session.
    pub endpoint: String,
    /// Ephemeral secret used to validate the above session.
    pub token: String,
}

impl SessionInfo {
    /// Builds session parameters from the raw fields of a voice-server-update.
    ///
    /// The gateway communicates endpoints with a vestigial `:80` port which
    /// must not be used for the TLS connection; it is stripped here.
    pub fn new<S, E, T>(session_id: S, endpoint: E, token: T) -> Self
    where
        S: Into<String>,
        E: Into<String>,
        T: Into<String>,
    {
        let mut endpoint = endpoint.into();
        if endpoint.ends_with(":80") {
            let len = endpoint.len();

            endpoint.truncate(len - 3);
        }

        Self {
            session_id: session_id.into(),
            endpoint,
            token: token.into(),
        }
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("session_id", &self.session_id)
            .field("endpoint", &self.endpoint)
            .field("token", &"<secret>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_is_stripped() {
        let info = SessionInfo::new("abc", "region.voice.example.com:80", "tok");
        assert_eq!(info.endpoint, "region.voice.example.com");
    }

    #[test]
    fn portless_endpoint_is_untouched() {
        let info = SessionInfo::new("abc", "region.voice.example.com", "tok");
        assert_eq!(info.endpoint, "region.voice.example.com");
    }
}
