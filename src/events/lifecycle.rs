use crate::{
    events::WebsocketClosed,
    id::Member,
    info::SessionInfo,
    input::AudioSendHandler,
    model::SpeakingMode,
};
use std::fmt;

/// The closed set of events a connection lifecycle is driven by.
///
/// Constructive events create or advance a connection, destructive events
/// tear one down, and neutral events mutate auxiliary state without
/// affecting connection existence.
#[non_exhaustive]
pub enum LifecycleEvent {
    /// Constructive: open the gateway websocket using fresh session
    /// parameters, superseding any handshake still in flight.
    ConnectWebsocket {
        /// Target connection.
        member: Member,
        /// Session parameters from the triggering voice-server-update.
        session: SessionInfo,
    },
    /// Destructive: close the connection, carrying the closure details to
    /// surface to the library's consumer.
    CloseWebsocket {
        /// Target connection.
        member: Member,
        /// Closure details, forwarded to the event stream.
        event: WebsocketClosed,
    },
    /// Neutral: swap the audio source feeding the connection's transport.
    /// `None` pauses outbound audio without tearing the transport down.
    UpdateSendHandler {
        /// Target connection.
        member: Member,
        /// Replacement audio source, if any.
        handler: Option<Box<dyn AudioSendHandler>>,
    },
    /// Neutral: change the advertised speaking state. `None` reduces to an
    /// empty flag set.
    UpdateSpeakingMode {
        /// Target connection.
        member: Member,
        /// Replacement flag set, if any.
        mode: Option<SpeakingMode>,
    },
    /// Destructive and global: tear down every live connection. The only
    /// unkeyed event; it is broadcast rather than routed.
    Shutdown,
}

impl LifecycleEvent {
    /// The connection key this event addresses, or `None` for the global
    /// shutdown broadcast.
    pub fn member(&self) -> Option<&Member> {
        use LifecycleEvent::*;
        match self {
            ConnectWebsocket { member, .. }
            | CloseWebsocket { member, .. }
            | UpdateSendHandler { member, .. }
            | UpdateSpeakingMode { member, .. } => Some(member),
            Shutdown => None,
        }
    }
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use LifecycleEvent::*;
        match self {
            ConnectWebsocket { member, session } => f
                .debug_struct("ConnectWebsocket")
                .field("member", member)
                .field("session", session)
                .finish(),
            CloseWebsocket { member, event } => f
                .debug_struct("CloseWebsocket")
                .field("member", member)
                .field("event", event)
                .finish(),
            UpdateSendHandler { member, handler } => f
                .debug_struct("UpdateSendHandler")
                .field("member", member)
                .field("handler", &handler.as_ref().map(|_| "<handler>"))
                .finish(),
            UpdateSpeakingMode { member, mode } => f
                .debug_struct("UpdateSpeakingMode")
                .field("member", member)
                .field("mode", mode)
                .finish(),
            Shutdown => f.write_str("Shutdown"),
        }
    }
}
