//! Library construction error handling.

use std::{error::Error as StdError, fmt, io::Error as IoError};

/// Error raised when a library instance cannot be constructed.
///
/// Per-connection failures never take this form; they are surfaced on the
/// [event stream] instead.
///
/// [event stream]: crate::Syrinx::event_stream
#[derive(Debug)]
#[non_exhaustive]
pub enum SetupError {
    /// The shared UDP socket backing every audio transport could not be
    /// acquired.
    Io(IoError),
}

impl From<IoError> for SetupError {
    fn from(e: IoError) -> Self {
        SetupError::Io(e)
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to construct voice library instance: ")?;
        match self {
            SetupError::Io(e) => e.fmt(f),
        }
    }
}

impl StdError for SetupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            SetupError::Io(e) => e.source(),
        }
    }
}

/// Convenience type for library construction error handling.
pub type SetupResult<T> = Result<T, SetupError>;
