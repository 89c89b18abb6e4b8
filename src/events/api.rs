use crate::id::Member;

/// Externally visible happenings on managed connections, surfaced through
/// the event stream.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ApiEvent {
    /// A connection's gateway websocket closed, remotely or locally.
    WebsocketClosed(WebsocketClosed),
}

/// Description of one websocket closure.
///
/// Terminal connection failures take this shape too: they differ from a
/// caller-requested close only in their `code`/`reason` and `by_remote`
/// values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WebsocketClosed {
    /// Connection the closure happened on.
    pub member: Member,
    /// Numeric close code.
    pub code: u16,
    /// Human-readable close reason.
    pub reason: String,
    /// Whether the remote end initiated the closure.
    pub by_remote: bool,
}
