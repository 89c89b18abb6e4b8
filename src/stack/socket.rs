//! Long-lived task owning one gateway websocket after its handshake.
//!
//! Relays speaking-state sends, keeps the heartbeat alive, and classifies
//! closures: reconnect-eligible ones are fed straight back to the owning
//! state machine, terminal ones re-enter the lifecycle pipeline so they
//! surface on the API event stream first.

use super::StackMessage;
use crate::{
    constants::MISSED_HEARTBEAT_LIMIT,
    events::{LifecycleEvent, WebsocketClosed},
    id::Member,
    model::{
        allows_reconnect,
        payload::{Heartbeat, Speaking},
        Event,
    },
    ws::{Error as WsError, WsStream},
};
use flume::{Receiver, Sender};
use rand::random;
use std::time::Duration;
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, instrument, trace, warn};

pub(crate) enum SocketMessage {
    /// Send a speaking-state update carrying the given mask.
    Speaking(u32),
    /// Close the websocket with the given code and reason, then stop.
    Close(u16, String),
    /// Stop without touching the wire.
    Poison,
}

pub(crate) struct GatewaySocket {
    rx: Receiver<SocketMessage>,
    ws: WsStream,
    member: Member,
    ssrc: u32,
    attempt: u64,
    heartbeat_interval: Duration,
    last_heartbeat_nonce: Option<u64>,
    missed_acks: u8,
    stack_tx: Sender<StackMessage>,
    lifecycle_tx: Sender<LifecycleEvent>,
}

impl GatewaySocket {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rx: Receiver<SocketMessage>,
        ws: WsStream,
        member: Member,
        ssrc: u32,
        attempt: u64,
        heartbeat_interval: Duration,
        stack_tx: Sender<StackMessage>,
        lifecycle_tx: Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            rx,
            ws,
            member,
            ssrc,
            attempt,
            heartbeat_interval,
            last_heartbeat_nonce: None,
            missed_acks: 0,
            stack_tx,
            lifecycle_tx,
        }
    }

    #[instrument(skip(self), fields(member = %self.member))]
    async fn run(&mut self) {
        let mut next_heartbeat = Instant::now() + self.heartbeat_interval;

        loop {
            let hb = sleep_until(next_heartbeat);

            select! {
                () = hb => {
                    if self.last_heartbeat_nonce.take().is_some() {
                        self.missed_acks += 1;

                        if self.missed_acks >= MISSED_HEARTBEAT_LIMIT {
                            warn!("Gateway stopped acknowledging heartbeats.");
                            self.report_terminal(1006, "heartbeat acknowledgement timeout".into());
                            break;
                        }
                    }

                    if let Err(e) = self.send_heartbeat().await {
                        self.report_ws_error(e);
                        break;
                    }

                    next_heartbeat = Instant::now() + self.heartbeat_interval;
                }
                ws_msg = self.ws.recv_json_no_timeout() => {
                    match ws_msg {
                        Ok(Some(msg)) => self.process_ws(msg),
                        Ok(None) => {},
                        Err(e) => {
                            self.report_ws_error(e);
                            break;
                        },
                    }
                }
                inner_msg = self.rx.recv_async() => {
                    match inner_msg {
                        Ok(SocketMessage::Speaking(mask)) => {
                            let status = self.ws
                                .send_json(&Event::from(Speaking {
                                    delay: Some(0),
                                    speaking: mask,
                                    ssrc: self.ssrc,
                                    user_id: None,
                                }))
                                .await;

                            if let Err(e) = status {
                                self.report_ws_error(e);
                                break;
                            }
                        },
                        Ok(SocketMessage::Close(code, reason)) => {
                            let frame = CloseFrame {
                                code: code.into(),
                                reason: reason.into(),
                            };
                            let _ = self.ws.close(Some(frame)).await;
                            break;
                        },
                        Ok(SocketMessage::Poison) | Err(flume::RecvError::Disconnected) => {
                            break;
                        },
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), WsError> {
        let nonce = random::<u64>();
        self.last_heartbeat_nonce = Some(nonce);

        trace!("Sending heartbeat.");

        self.ws.send_json(&Event::from(Heartbeat { nonce })).await
    }

    fn process_ws(&mut self, value: Event) {
        match value {
            Event::HeartbeatAck(ev) => {
                if let Some(nonce) = self.last_heartbeat_nonce.take() {
                    if ev.nonce == nonce {
                        trace!("Heartbeat ACK received.");
                        self.missed_acks = 0;
                    } else {
                        warn!("Heartbeat nonce mismatch! Expected {}, saw {}.", nonce, ev.nonce);
                    }
                }
            },
            Event::Speaking(ev) => {
                trace!("Received speaking update: {:?}", ev);
            },
            Event::ClientDisconnect(ev) => {
                debug!("Client disconnected from session: {:?}", ev);
            },
            other => {
                trace!("Received other websocket data: {:?}", other);
            },
        }
    }

    /// Classifies a websocket failure and hands the consequence on.
    fn report_ws_error(&self, e: WsError) {
        match e {
            WsError::WsClosed(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };

                if allows_reconnect(code) {
                    debug!("Voice websocket closed ({:?}); reconnecting.", code);
                    let _ = self.stack_tx.send(StackMessage::Reconnect {
                        attempt: self.attempt,
                    });
                } else {
                    self.report_remote_terminal(code.unwrap_or(1005), reason);
                }
            },
            e => {
                debug!("Error sending/receiving ws {:?}; reconnecting.", e);
                let _ = self.stack_tx.send(StackMessage::Reconnect {
                    attempt: self.attempt,
                });
            },
        }
    }

    /// Submits a remote terminal closure through the lifecycle pipeline, so
    /// the API notification precedes the state machine's teardown.
    fn report_remote_terminal(&self, code: u16, reason: String) {
        let _ = self.lifecycle_tx.send(LifecycleEvent::CloseWebsocket {
            member: self.member.clone(),
            event: WebsocketClosed {
                member: self.member.clone(),
                code,
                reason,
                by_remote: true,
            },
        });
    }

    /// As [`report_remote_terminal`], for failures detected locally.
    ///
    /// [`report_remote_terminal`]: GatewaySocket::report_remote_terminal
    fn report_terminal(&self, code: u16, reason: String) {
        let _ = self.lifecycle_tx.send(LifecycleEvent::CloseWebsocket {
            member: self.member.clone(),
            event: WebsocketClosed {
                member: self.member.clone(),
                code,
                reason,
                by_remote: false,
            },
        });
    }
}

#[instrument(skip(socket))]
pub(crate) async fn runner(mut socket: GatewaySocket) {
    trace!("Gateway socket task started.");
    socket.run().await;
    trace!("Gateway socket task finished.");
}
