//! Connection errors and convenience types.

use crate::ws::Error as WsError;
use crypto_secretbox::{cipher::InvalidLength, Error as CryptoError};
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt, io::Error as IoError};
use tokio::time::error::Elapsed;

/// Errors encountered while connecting to a voice server.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The connection attempt was superseded by a newer session assignment
    /// or by teardown of its state machine.
    AttemptDiscarded,
    /// An error occurred during encryption of voice packets or key generation.
    Crypto(CryptoError),
    /// Invalid length error while generating crypto keys.
    InvalidLength(InvalidLength),
    /// Server did not return the expected crypto mode during negotiation.
    CryptoModeInvalid,
    /// No encryption mode offered by the server is supported locally.
    CryptoModeUnavailable,
    /// An indicator that an endpoint URL was invalid.
    EndpointUrl,
    /// The server failed to correctly respond to IP discovery.
    IllegalDiscoveryResponse,
    /// Could not parse the server's view of our IP.
    IllegalIp,
    /// Miscellaneous I/O error.
    Io(IoError),
    /// JSON (de)serialization error.
    Json(JsonError),
    /// Error communicating with the gateway server over websocket.
    Ws(WsError),
    /// Connection attempt timed out.
    TimedOut,
}

impl From<CryptoError> for ConnectionError {
    fn from(e: CryptoError) -> Self {
        ConnectionError::Crypto(e)
    }
}

impl From<InvalidLength> for ConnectionError {
    fn from(e: InvalidLength) -> Self {
        ConnectionError::InvalidLength(e)
    }
}

impl From<IoError> for ConnectionError {
    fn from(e: IoError) -> ConnectionError {
        ConnectionError::Io(e)
    }
}

impl From<JsonError> for ConnectionError {
    fn from(e: JsonError) -> ConnectionError {
        ConnectionError::Json(e)
    }
}

impl From<WsError> for ConnectionError {
    fn from(e: WsError) -> ConnectionError {
        ConnectionError::Ws(e)
    }
}

impl From<Elapsed> for ConnectionError {
    fn from(_e: Elapsed) -> ConnectionError {
        ConnectionError::TimedOut
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to voice server: ")?;
        use ConnectionError::*;
        match self {
            AttemptDiscarded => write!(f, "connection attempt was aborted/discarded"),
            Crypto(e) => e.fmt(f),
            InvalidLength(e) => e.fmt(f),
            CryptoModeInvalid => write!(f, "server changed negotiated encryption mode"),
            CryptoModeUnavailable => write!(f, "server offered no supported encryption mode"),
            EndpointUrl => write!(f, "endpoint URL received from gateway was invalid"),
            IllegalDiscoveryResponse => write!(f, "IP discovery/NAT punching response was invalid"),
            IllegalIp => write!(f, "IP discovery/NAT punching response had bad IP value"),
            Io(e) => e.fmt(f),
            Json(e) => e.fmt(f),
            Ws(e) => write!(f, "websocket issue ({:?}).", e),
            TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConnectionError::Crypto(e) => e.source(),
            ConnectionError::InvalidLength(e) => e.source(),
            ConnectionError::Io(e) => e.source(),
            ConnectionError::Json(e) => e.source(),
            _ => None,
        }
    }
}

/// Convenience type for voice connection error handling.
pub type Result<T> = std::result::Result<T, ConnectionError>;
