//! Handshake stages of the voice gateway protocol.

use super::error::{ConnectionError, Result};
use crate::{
    constants::*,
    crypto::CryptoMode,
    id::Member,
    info::SessionInfo,
    model::{
        payload::{Identify, ProtocolData, Resume, SelectProtocol},
        Event,
    },
    ws::WsStream,
};
use crypto_secretbox::{KeyInit, XSalsa20Poly1305 as Cipher};
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket};
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, instrument};
use url::Url;

/// Output of the websocket half of the handshake: the server has accepted
/// our identify and told us where its UDP endpoint lives.
pub(crate) struct GatewayNegotiation {
    pub client: WsStream,
    pub ssrc: u32,
    pub remote_addr: SocketAddr,
    pub mode: CryptoMode,
    pub heartbeat_interval: Duration,
}

/// A fully established connection: the UDP path is proven and the packet
/// cipher has been derived from the session description.
pub(crate) struct Established {
    pub client: WsStream,
    pub ssrc: u32,
    pub remote_addr: SocketAddr,
    pub mode: CryptoMode,
    pub cipher: Cipher,
    pub heartbeat_interval: Duration,
}

/// Opens a fresh websocket and negotiates up to (not including) UDP
/// establishment.
pub(crate) async fn open_gateway(
    member: &Member,
    session: &SessionInfo,
    attempt_timeout: Option<Duration>,
) -> Result<GatewayNegotiation> {
    if let Some(t) = attempt_timeout {
        timeout(t, open_gateway_inner(member, session)).await?
    } else {
        open_gateway_inner(member, session).await
    }
}

#[instrument(skip(session))]
async fn open_gateway_inner(member: &Member, session: &SessionInfo) -> Result<GatewayNegotiation> {
    let url = generate_url(&session.endpoint)?;

    let mut client = WsStream::connect(url).await?;

    client
        .send_json(&Event::from(Identify {
            server_id: member.guild_id.to_string(),
            session_id: session.session_id.clone(),
            token: session.token.clone(),
            user_id: member.user_id.to_string(),
        }))
        .await?;

    let mut hello = None;
    let mut ready = None;

    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        match value {
            Event::Ready(r) => {
                ready = Some(r);
                if hello.is_some() {
                    break;
                }
            },
            Event::Hello(h) => {
                hello = Some(h);
                if ready.is_some() {
                    break;
                }
            },
            other => {
                debug!("Expected ready/hello; got: {:?}", other);
            },
        }
    }

    let hello = hello.expect("Hello packet expected in connection initialisation, but not found.");
    let ready = ready.expect("Ready packet expected in connection initialisation, but not found.");

    let mode = CryptoMode::negotiate(&ready.modes).ok_or(ConnectionError::CryptoModeUnavailable)?;
    let ip = IpAddr::from_str(&ready.ip).map_err(|_| ConnectionError::IllegalIp)?;

    info!("Voice websocket negotiated with {}.", session.endpoint);

    Ok(GatewayNegotiation {
        client,
        ssrc: ready.ssrc,
        remote_addr: SocketAddr::new(ip, ready.port),
        mode,
        heartbeat_interval: Duration::from_secs_f64(hello.heartbeat_interval / 1000.0),
    })
}

/// Proves the UDP path via IP discovery, commits to an encryption mode, and
/// awaits the server's session description.
pub(crate) async fn establish_udp(
    udp: &Arc<UdpSocket>,
    negotiation: GatewayNegotiation,
    attempt_timeout: Option<Duration>,
) -> Result<Established> {
    if let Some(t) = attempt_timeout {
        timeout(t, establish_udp_inner(udp, negotiation)).await?
    } else {
        establish_udp_inner(udp, negotiation).await
    }
}

async fn establish_udp_inner(
    udp: &Arc<UdpSocket>,
    negotiation: GatewayNegotiation,
) -> Result<Established> {
    let GatewayNegotiation {
        mut client,
        ssrc,
        remote_addr,
        mode,
        heartbeat_interval,
    } = negotiation;

    let external_addr = ip_discovery(udp, ssrc, remote_addr).await?;

    client
        .send_json(&Event::from(SelectProtocol {
            protocol: "udp".into(),
            data: ProtocolData {
                address: external_addr.ip(),
                mode: mode.to_request_str().into(),
                port: external_addr.port(),
            },
        }))
        .await?;

    let cipher = init_cipher(&mut client, mode).await?;

    info!("Voice connection established.");

    Ok(Established {
        client,
        ssrc,
        remote_addr,
        mode,
        cipher,
        heartbeat_interval,
    })
}

/// Re-attaches to an interrupted session on a fresh websocket.
///
/// On success the negotiated SSRC, UDP endpoint, and cipher all remain
/// valid; only the websocket and its heartbeat cadence are renewed.
pub(crate) async fn resume(
    member: &Member,
    session: &SessionInfo,
    attempt_timeout: Option<Duration>,
) -> Result<(WsStream, Duration)> {
    if let Some(t) = attempt_timeout {
        timeout(t, resume_inner(member, session)).await?
    } else {
        resume_inner(member, session).await
    }
}

#[instrument(skip(session))]
async fn resume_inner(member: &Member, session: &SessionInfo) -> Result<(WsStream, Duration)> {
    let url = generate_url(&session.endpoint)?;

    let mut client = WsStream::connect(url).await?;

    client
        .send_json(&Event::from(Resume {
            server_id: member.guild_id.to_string(),
            session_id: session.session_id.clone(),
            token: session.token.clone(),
        }))
        .await?;

    let mut hello = None;
    let mut resumed = None;

    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        match value {
            Event::Resumed => {
                resumed = Some(());
                if hello.is_some() {
                    break;
                }
            },
            Event::Hello(h) => {
                hello = Some(h);
                if resumed.is_some() {
                    break;
                }
            },
            other => {
                debug!("Expected resumed/hello; got: {:?}", other);
            },
        }
    }

    let hello = hello.expect("Hello packet expected in session resumption, but not found.");

    info!("Voice websocket resumed with {}.", session.endpoint);

    Ok((
        client,
        Duration::from_secs_f64(hello.heartbeat_interval / 1000.0),
    ))
}

fn generate_url(endpoint: &str) -> Result<Url> {
    Url::parse(&format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION))
        .or(Err(ConnectionError::EndpointUrl))
}

/// Follows the platform's IP discovery procedure over the shared UDP socket,
/// in case NAT tunnelling is needed.
///
/// The socket is shared by every connection, so responses meant for other
/// handshakes may surface here; anything whose SSRC or source address does
/// not match is skipped, and the request is retransmitted on timeout.
async fn ip_discovery(udp: &UdpSocket, ssrc: u32, remote_addr: SocketAddr) -> Result<SocketAddr> {
    let mut bytes = [0; IpDiscoveryPacket::const_packet_size()];
    {
        let mut view = MutableIpDiscoveryPacket::new(&mut bytes[..]).expect(
            "Too few bytes in 'bytes' for IPDiscovery packet.\
                (Blame: IpDiscoveryPacket::const_packet_size()?)",
        );
        view.set_pkt_type(IpDiscoveryType::Request);
        view.set_length(70);
        view.set_ssrc(ssrc);
    }

    for _ in 0..IP_DISCOVERY_RETRY_LIMIT {
        udp.send_to(&bytes, remote_addr).await?;

        let deadline = Instant::now() + IP_DISCOVERY_TIMEOUT;
        let mut reply = [0u8; IpDiscoveryPacket::const_packet_size()];

        loop {
            let (len, addr) = match timeout_at(deadline, udp.recv_from(&mut reply)).await {
                Ok(Ok(recvd)) => recvd,
                Ok(Err(e)) => return Err(e.into()),
                // Retransmit the request.
                Err(_) => break,
            };

            if addr != remote_addr {
                continue;
            }

            let view = match IpDiscoveryPacket::new(&reply[..len]) {
                Some(view) => view,
                None => continue,
            };

            if view.get_pkt_type() != IpDiscoveryType::Response || view.get_ssrc() != ssrc {
                continue;
            }

            // We could do something clever like binary search,
            // but possibility of UDP spoofing precludes us from
            // making the assumption we can find a "left edge" of '\0's.
            let nul_byte_index = view
                .get_address_raw()
                .iter()
                .position(|&b| b == 0)
                .ok_or(ConnectionError::IllegalIp)?;

            let address_str = std::str::from_utf8(&view.get_address_raw()[..nul_byte_index])
                .map_err(|_| ConnectionError::IllegalIp)?;

            let address =
                IpAddr::from_str(address_str).map_err(|_| ConnectionError::IllegalIp)?;

            return Ok(SocketAddr::new(address, view.get_port()));
        }
    }

    Err(ConnectionError::TimedOut)
}

#[inline]
async fn init_cipher(client: &mut WsStream, mode: CryptoMode) -> Result<Cipher> {
    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        match value {
            Event::SessionDescription(desc) => {
                if desc.mode != mode.to_request_str() {
                    return Err(ConnectionError::CryptoModeInvalid);
                }

                return Cipher::new_from_slice(&desc.secret_key)
                    .map_err(ConnectionError::InvalidLength);
            },
            other => {
                debug!(
                    "Expected session description; got: op{}/v{:?}",
                    other.kind() as u8,
                    other
                );
            },
        }
    }
}
