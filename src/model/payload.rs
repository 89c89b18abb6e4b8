//! Payload bodies for each voice gateway opcode.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Sent by the client to begin a new voice session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Identify {
    /// ID of the guild whose voice server is being joined.
    pub server_id: String,
    /// Session ID received over the platform's main gateway.
    pub session_id: String,
    /// Ephemeral token authorising this session.
    pub token: String,
    /// ID of the connecting bot user.
    pub user_id: String,
}

/// Sent by the client once the external UDP address is known, committing to
/// an encryption mode.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SelectProtocol {
    /// The lower-level protocol in use; always `"udp"` here.
    pub protocol: String,
    /// Address and cipher parameters for the audio data plane.
    pub data: ProtocolData,
}

/// Transport parameters carried inside [`SelectProtocol`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtocolData {
    /// External-facing IP address of the client, learnt via IP discovery.
    pub address: IpAddr,
    /// Wire name of the chosen encryption mode.
    pub mode: String,
    /// External-facing UDP port of the client.
    pub port: u16,
}

/// Server handshake response carrying the session's SSRC and UDP endpoint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ready {
    /// Synchronization source identifier tagging this connection's packets.
    pub ssrc: u32,
    /// IP of the server's UDP endpoint.
    pub ip: String,
    /// Port of the server's UDP endpoint.
    pub port: u16,
    /// Encryption modes offered by the server.
    pub modes: Vec<String>,
}

/// Periodic client keepalive; the nonce is echoed back in [`HeartbeatAck`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Heartbeat {
    /// Opaque value matched against the acknowledgement.
    pub nonce: u64,
}

/// Server acknowledgement of a [`Heartbeat`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HeartbeatAck {
    /// Nonce of the heartbeat being acknowledged.
    pub nonce: u64,
}

/// Server confirmation of the negotiated encryption parameters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionDescription {
    /// Wire name of the mode the server committed to.
    pub mode: String,
    /// Shared secret used to encrypt audio packets.
    pub secret_key: Vec<u8>,
}

/// Speaking-state message, sent in both directions.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Speaking {
    /// Duration to delay outgoing audio by; clients should send `0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    /// Bitmask of active [`SpeakingMode`] flags.
    ///
    /// [`SpeakingMode`]: crate::model::SpeakingMode
    pub speaking: u32,
    /// SSRC of the speaking connection.
    pub ssrc: u32,
    /// Populated on inbound messages describing other session members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Sent by the client to re-attach to an interrupted session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resume {
    /// ID of the guild whose session is being resumed.
    pub server_id: String,
    /// Session ID of the interrupted session.
    pub session_id: String,
    /// Token of the interrupted session.
    pub token: String,
}

/// First server message on a fresh websocket, carrying the heartbeat cadence.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hello {
    /// Interval between client heartbeats, in milliseconds.
    pub heartbeat_interval: f64,
}

/// Server notice that a user left the voice session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClientDisconnect {
    /// ID of the departing user.
    pub user_id: String,
}
