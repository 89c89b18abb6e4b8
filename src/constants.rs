//! Constants affecting voice connection and packet pacing behaviour.

use discortp::rtp::RtpType;
use std::time::Duration;

/// The voice gateway version spoken by the library.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Sample rate of audio to be sent to the voice server.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames/packets to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length of time between any two audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Number of samples in one complete frame of audio per channel.
///
/// This is equally the RTP timestamp increment between packets.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Maximum packet size for a voice packet.
///
/// Set a safe amount below the Ethernet MTU to avoid fragmentation/rejection.
pub const VOICE_PACKET_MAX: usize = 1460;

/// Delay between sends of UDP keepalive frames.
///
/// Passive monitoring of the platform shows that these fire every 5 seconds
/// irrespective of outgoing UDP traffic.
pub const UDP_KEEPALIVE_GAP_MS: u64 = 5_000;

/// Type-converted delay between sends of UDP keepalive frames.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_millis(UDP_KEEPALIVE_GAP_MS);

/// Opus silent frame, used to signal speech start and end (and prevent audio glitching).
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Number of explicit silence frames sent after an audio source runs dry.
pub const SILENCE_FRAME_COUNT: u8 = 5;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Profile type used by the platform's Opus audio traffic.
pub const RTP_PROFILE_TYPE: RtpType = RtpType::Dynamic(120);

/// Close code sent when the library's user asks for a connection to be closed.
pub const CLIENT_CLOSE_CODE: u16 = 1000;

/// Close reason sent when the library's user asks for a connection to be closed.
pub const CLIENT_CLOSE_REASON: &str = "Closed by client";

/// Number of consecutively missed heartbeat acknowledgements after which a
/// gateway websocket is considered dead.
pub(crate) const MISSED_HEARTBEAT_LIMIT: u8 = 2;

/// Number of IP discovery request retransmissions before a handshake is failed.
pub(crate) const IP_DISCOVERY_RETRY_LIMIT: usize = 5;

/// How long to wait for a single IP discovery response before retransmitting.
pub(crate) const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);
