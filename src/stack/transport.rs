//! Data-plane task emitting encrypted, framed audio over the shared UDP
//! socket on a fixed cadence.

use crate::{
    constants::*,
    crypto::{CryptoMode, CryptoState, TAG_SIZE},
    input::SharedHandler,
};
use crypto_secretbox::XSalsa20Poly1305 as Cipher;
use discortp::{
    discord::MutableKeepalivePacket,
    rtp::{MutableRtpPacket, RtpPacket},
    MutablePacket,
};
use flume::Receiver;
use rand::random;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};
use tracing::{error, instrument, trace, warn};

pub(crate) enum TransportMessage {
    /// The handler slot changed; re-arm the frame cadence.
    HandlerUpdated,
    /// Stop the cadence, keeping all negotiated parameters.
    Pause,
    /// Restart the cadence after a [`Pause`].
    ///
    /// [`Pause`]: TransportMessage::Pause
    Resume,
    /// Stop the task. The shared UDP socket is left open.
    Poison,
}

pub(crate) struct AudioTransport {
    rx: Receiver<TransportMessage>,
    udp: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    cipher: Cipher,
    crypto_state: CryptoState,
    handler: SharedHandler,
    paused: bool,
    silence_frames: u8,
    packet: [u8; VOICE_PACKET_MAX],
    frame_time: Instant,
    keepalive_time: Instant,
}

impl AudioTransport {
    pub(crate) fn new(
        rx: Receiver<TransportMessage>,
        udp: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        ssrc: u32,
        mode: CryptoMode,
        cipher: Cipher,
        handler: SharedHandler,
    ) -> Self {
        let mut packet = [0u8; VOICE_PACKET_MAX];

        let mut rtp = MutableRtpPacket::new(&mut packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );
        rtp.set_version(RTP_VERSION);
        rtp.set_payload_type(RTP_PROFILE_TYPE);
        rtp.set_sequence(random::<u16>().into());
        rtp.set_timestamp(random::<u32>().into());
        rtp.set_ssrc(ssrc);

        let now = Instant::now();

        Self {
            rx,
            udp,
            remote_addr,
            cipher,
            crypto_state: CryptoState::from(mode),
            handler,
            paused: false,
            silence_frames: 0,
            packet,
            frame_time: now,
            keepalive_time: now + UDP_KEEPALIVE_GAP,
        }
    }

    fn ssrc(&self) -> u32 {
        RtpPacket::new(&self.packet[..])
            .expect("FATAL: Too few bytes in self.packet for RTP header.")
            .get_ssrc()
    }

    /// Whether the 20ms frame cadence is currently live, as opposed to the
    /// reduced keepalive-only cadence.
    fn sending_audio(&self) -> bool {
        !self.paused && (self.handler.lock().is_some() || self.silence_frames > 0)
    }

    async fn run(&mut self) {
        let mut keepalive_bytes = [0u8; MutableKeepalivePacket::minimum_packet_size()];
        let mut ka = MutableKeepalivePacket::new(&mut keepalive_bytes[..])
            .expect("FATAL: Insufficient bytes given to keepalive packet.");
        ka.set_ssrc(self.ssrc());

        loop {
            let deadline = if self.sending_audio() {
                self.frame_time.min(self.keepalive_time)
            } else {
                self.keepalive_time
            };

            match timeout_at(deadline, self.rx.recv_async()).await {
                Err(_) => {
                    if let Err(e) = self.tick(&keepalive_bytes).await {
                        error!("Fatal UDP packet send error: {:?}.", e);
                        break;
                    }
                },
                Ok(Ok(TransportMessage::HandlerUpdated)) => {
                    self.frame_time = Instant::now();
                },
                Ok(Ok(TransportMessage::Pause)) => {
                    self.paused = true;
                },
                Ok(Ok(TransportMessage::Resume)) => {
                    self.paused = false;
                    self.frame_time = Instant::now();
                },
                Ok(Ok(TransportMessage::Poison)) | Ok(Err(flume::RecvError::Disconnected)) => {
                    break;
                },
            }
        }
    }

    async fn tick(&mut self, keepalive_bytes: &[u8]) -> std::io::Result<()> {
        let now = Instant::now();

        if now >= self.keepalive_time {
            trace!("Sending UDP keepalive.");
            self.udp.send_to(keepalive_bytes, self.remote_addr).await?;
            self.keepalive_time += UDP_KEEPALIVE_GAP;
        }

        if self.sending_audio() && now >= self.frame_time {
            self.send_frame().await?;
            self.frame_time += TIMESTEP_LENGTH;
        }

        Ok(())
    }

    async fn send_frame(&mut self) -> std::io::Result<()> {
        let frame = self.handler.lock().as_mut().and_then(|h| h.provide_frame());

        let opus_len = match frame {
            Some(opus) => {
                let mode = self.crypto_state.kind();
                let budget =
                    VOICE_PACKET_MAX - RtpPacket::minimum_packet_size() - mode.payload_overhead();

                if opus.len() > budget {
                    warn!("Audio frame of {} bytes exceeds packet budget; dropped.", opus.len());
                    return Ok(());
                }

                let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
                    "FATAL: Too few bytes in self.packet for RTP header.\
                        (Blame: VOICE_PACKET_MAX?)",
                );
                let payload = rtp.payload_mut();
                payload[TAG_SIZE..TAG_SIZE + opus.len()].copy_from_slice(&opus[..]);

                self.silence_frames = SILENCE_FRAME_COUNT;
                opus.len()
            },
            None if self.silence_frames > 0 => {
                // Explicit "Silence" frames mark the end of transmission.
                self.silence_frames -= 1;

                let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
                    "FATAL: Too few bytes in self.packet for RTP header.\
                        (Blame: VOICE_PACKET_MAX?)",
                );
                let payload = rtp.payload_mut();
                payload[TAG_SIZE..TAG_SIZE + SILENT_FRAME.len()].copy_from_slice(&SILENT_FRAME[..]);

                SILENT_FRAME.len()
            },
            None => return Ok(()),
        };

        let index = match self.prep_packet(opus_len) {
            Ok(index) => index,
            Err(()) => {
                warn!("Failed to encrypt audio packet; dropped.");
                return Ok(());
            },
        };

        self.udp.send_to(&self.packet[..index], self.remote_addr).await?;
        self.advance_rtp_counters();

        Ok(())
    }

    /// Nonce-stamps and encrypts the staged payload, returning the final
    /// packet length.
    fn prep_packet(&mut self, opus_len: usize) -> Result<usize, ()> {
        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );

        let final_payload_size = self
            .crypto_state
            .write_packet_nonce(&mut rtp, TAG_SIZE + opus_len);

        self.crypto_state
            .kind()
            .encrypt_in_place(&mut rtp, &self.cipher, final_payload_size)
            .map_err(|_| ())?;

        Ok(RtpPacket::minimum_packet_size() + final_payload_size)
    }

    fn advance_rtp_counters(&mut self) {
        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );
        rtp.set_sequence(rtp.get_sequence() + 1);
        rtp.set_timestamp(rtp.get_timestamp() + MONO_FRAME_SIZE as u32);
    }
}

#[instrument(skip(transport))]
pub(crate) async fn runner(mut transport: AudioTransport) {
    trace!("Audio transport task started.");
    transport.run().await;
    trace!("Audio transport task stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NONCE_SIZE;
    use crypto_secretbox::{KeyInit, SecretBox};

    fn dummy_transport(mode: CryptoMode) -> (AudioTransport, flume::Sender<TransportMessage>) {
        let (tx, rx) = flume::unbounded();
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_nonblocking(true).unwrap();
        let udp = Arc::new(UdpSocket::from_std(udp).unwrap());
        let remote_addr = udp.local_addr().unwrap();

        let cipher =
            Cipher::new_from_slice(&[7u8; SecretBox::<()>::KEY_SIZE]).unwrap();
        let handler: SharedHandler = Arc::new(parking_lot::Mutex::new(None));

        (
            AudioTransport::new(rx, udp, remote_addr, 0xDEAD_BEEF, mode, cipher, handler),
            tx,
        )
    }

    #[tokio::test]
    async fn packet_header_is_prepared() {
        let (transport, _tx) = dummy_transport(CryptoMode::Normal);
        let rtp = RtpPacket::new(&transport.packet[..]).unwrap();

        assert_eq!(rtp.get_version(), RTP_VERSION);
        assert_eq!(rtp.get_ssrc(), 0xDEAD_BEEF);
    }

    #[tokio::test]
    async fn prep_packet_accounts_for_crypto_overhead() {
        let cases = [
            (CryptoMode::Normal, 0),
            (CryptoMode::Lite, 4),
            (CryptoMode::Suffix, NONCE_SIZE),
        ];

        for (mode, suffix) in cases {
            let (mut transport, _tx) = dummy_transport(mode);
            let len = transport.prep_packet(SILENT_FRAME.len()).unwrap();

            assert_eq!(
                len,
                RtpPacket::minimum_packet_size() + TAG_SIZE + SILENT_FRAME.len() + suffix,
            );
        }
    }

    #[tokio::test]
    async fn rtp_counters_advance_by_one_frame() {
        let (mut transport, _tx) = dummy_transport(CryptoMode::Normal);

        let (seq, ts) = {
            let rtp = RtpPacket::new(&transport.packet[..]).unwrap();
            (rtp.get_sequence(), rtp.get_timestamp())
        };

        transport.advance_rtp_counters();

        let rtp = RtpPacket::new(&transport.packet[..]).unwrap();
        assert_eq!(rtp.get_sequence(), seq + 1);
        assert_eq!(rtp.get_timestamp(), ts + MONO_FRAME_SIZE as u32);
    }

    #[tokio::test]
    async fn dry_handler_sends_silence_burst_then_stops() {
        let (mut transport, _tx) = dummy_transport(CryptoMode::Normal);

        // An attached-then-drained source leaves a silence burst behind.
        transport.silence_frames = SILENCE_FRAME_COUNT;

        for _ in 0..SILENCE_FRAME_COUNT {
            assert!(transport.sending_audio());
            transport.send_frame().await.unwrap();
        }

        assert!(!transport.sending_audio());
    }
}
