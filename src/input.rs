//! Boundary trait for user-supplied audio sources.

use parking_lot::Mutex;
use std::sync::Arc;

/// Source of outbound audio for one connection, implemented by the
/// library's user.
///
/// The transport polls the attached handler once per 20 ms tick while the
/// connection is able to send. Frames must be complete Opus frames encoded
/// at 48 kHz; a frame larger than the packet budget is dropped.
///
/// Users **must** ensure that no costly work or blocking occurs within an
/// implementation. *Taking excess time could prevent timely sending of
/// packets, causing audio glitches and delays.*
pub trait AudioSendHandler: Send + 'static {
    /// Produces the next 20 ms Opus frame, or `None` when there is
    /// currently nothing to send.
    fn provide_frame(&mut self) -> Option<Vec<u8>>;
}

/// Handler slot shared between a connection's state machine and its
/// transport task, so the attached source survives transport rebuilds.
pub(crate) type SharedHandler = Arc<Mutex<Option<Box<dyn AudioSendHandler>>>>;
