//! Per-connection state machine.
//!
//! Each connection key owns one `AudioStack`: a task consuming an ordered
//! mailbox of lifecycle events and handshake continuations. Handshake I/O
//! runs on spawned tasks whose completions are posted back to the same
//! mailbox, tagged with an attempt index; bumping the index is how newer
//! session assignments abort superseded work without dangling callbacks.

pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod socket;
pub(crate) mod transport;

use connection::{Established, GatewayNegotiation};
use error::ConnectionError;
use socket::{GatewaySocket, SocketMessage};
use transport::{AudioTransport, TransportMessage};

use crate::{
    constants::{CLIENT_CLOSE_CODE, CLIENT_CLOSE_REASON},
    events::{ApiEvent, LifecycleEvent, WebsocketClosed},
    id::Member,
    info::SessionInfo,
    input::SharedHandler,
    model::{allows_reconnect, SpeakingMode},
    pipeline::Registry,
    ws::WsStream,
    Config,
};
use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::UdpSocket, select, sync::watch};
use tracing::{debug, trace, warn};

/// Externally observable lifecycle state of one voice connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionPhase {
    /// No connection work has begun for this key.
    Uninitialized,
    /// The gateway websocket handshake is in flight.
    ConnectingWebsocket,
    /// The websocket is negotiated; the UDP path is being established.
    ConnectingUdp,
    /// Audio can be sent.
    Connected,
    /// A recoverable closure occurred; the websocket is being re-opened
    /// while the negotiated transport is kept on standby.
    ReconnectingWebsocket,
    /// Teardown is in progress.
    Disconnecting,
    /// Terminal. Late events for this key are dropped, never resurrected.
    Destroyed,
}

/// Messages processed by one stack, strictly in order.
pub(crate) enum StackMessage {
    /// An externally submitted event, routed here by the pipeline.
    Lifecycle(LifecycleEvent),
    /// Continuation of the websocket handshake stage.
    GatewayReady {
        attempt: u64,
        result: error::Result<GatewayNegotiation>,
    },
    /// Continuation of the UDP establishment stage.
    UdpReady {
        attempt: u64,
        result: error::Result<Established>,
    },
    /// Continuation of a session resume.
    SessionResumed {
        attempt: u64,
        result: error::Result<(WsStream, Duration)>,
    },
    /// A live socket saw a reconnect-eligible closure.
    Reconnect { attempt: u64 },
}

/// Shared face of one stack: its mailbox, phase cell, and teardown markers.
#[derive(Clone)]
pub(crate) struct StackHandle {
    pub tx: Sender<StackMessage>,
    pub phase: Arc<RwLock<ConnectionPhase>>,
    pub terminating: Arc<AtomicBool>,
    pub done: Receiver<()>,
}

enum Step {
    Continue,
    Terminal,
}

struct LiveConnection {
    socket_tx: Sender<SocketMessage>,
    transport_tx: Sender<TransportMessage>,
    ssrc: u32,
}

struct AudioStack {
    member: Member,
    config: Config,
    udp: Arc<UdpSocket>,
    api_tx: Sender<ApiEvent>,
    lifecycle_tx: Sender<LifecycleEvent>,
    registry: Arc<Registry>,
    tx: Sender<StackMessage>,
    phase: Arc<RwLock<ConnectionPhase>>,
    terminating: Arc<AtomicBool>,
    session: Option<SessionInfo>,
    attempt: u64,
    handler: SharedHandler,
    speaking: Option<SpeakingMode>,
    live: Option<LiveConnection>,
}

/// Creates a stack and starts its mailbox task.
pub(crate) fn launch(
    member: Member,
    config: Config,
    udp: Arc<UdpSocket>,
    api_tx: Sender<ApiEvent>,
    lifecycle_tx: Sender<LifecycleEvent>,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
) -> StackHandle {
    let (tx, rx) = flume::unbounded();
    let (done_tx, done_rx) = flume::bounded(1);
    let phase = Arc::new(RwLock::new(ConnectionPhase::Uninitialized));
    let terminating = Arc::new(AtomicBool::new(false));

    let stack = AudioStack {
        member,
        config,
        udp,
        api_tx,
        lifecycle_tx,
        registry,
        tx: tx.clone(),
        phase: Arc::clone(&phase),
        terminating: Arc::clone(&terminating),
        session: None,
        attempt: 0,
        handler: Arc::new(Mutex::new(None)),
        speaking: None,
        live: None,
    };

    tokio::spawn(runner(stack, rx, shutdown_rx, done_tx));

    StackHandle {
        tx,
        phase,
        terminating,
        done: done_rx,
    }
}

async fn runner(
    mut stack: AudioStack,
    rx: Receiver<StackMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    _done_tx: Sender<()>,
) {
    trace!("Audio stack for {} started.", stack.member);

    loop {
        select! {
            // Shutdown is force-broadcast: it preempts queued mailbox work.
            _ = shutdown_rx.changed() => {
                stack.destroy();
                break;
            }
            msg = rx.recv_async() => match msg {
                Ok(msg) => {
                    if let Step::Terminal = stack.handle(msg) {
                        break;
                    }
                },
                Err(flume::RecvError::Disconnected) => {
                    stack.destroy();
                    break;
                },
            }
        }
    }

    trace!("Audio stack for {} finished.", stack.member);
}

impl AudioStack {
    fn handle(&mut self, msg: StackMessage) -> Step {
        match msg {
            StackMessage::Lifecycle(event) => self.handle_lifecycle(event),
            StackMessage::GatewayReady { attempt, result } => {
                if attempt != self.attempt {
                    debug!("Discarding superseded websocket negotiation for {}.", self.member);
                    return Step::Continue;
                }

                match result {
                    Ok(negotiation) => {
                        self.establish(negotiation);
                        Step::Continue
                    },
                    Err(e) => self.fail_connection(&e),
                }
            },
            StackMessage::UdpReady { attempt, result } => {
                if attempt != self.attempt {
                    debug!("Discarding superseded UDP establishment for {}.", self.member);
                    return Step::Continue;
                }

                match result {
                    Ok(established) => {
                        self.go_live(established);
                        Step::Continue
                    },
                    Err(e) => self.fail_connection(&e),
                }
            },
            StackMessage::SessionResumed { attempt, result } => {
                if attempt != self.attempt {
                    debug!("Discarding superseded session resume for {}.", self.member);
                    return Step::Continue;
                }

                match result {
                    Ok((ws, heartbeat_interval)) => {
                        self.resume_live(ws, heartbeat_interval);
                        Step::Continue
                    },
                    Err(e) => {
                        debug!("Session resume failed ({}); running a full handshake.", e);
                        self.full_reconnect()
                    },
                }
            },
            StackMessage::Reconnect { attempt } => {
                if attempt != self.attempt {
                    debug!("Discarding reconnect signal from a superseded socket.");
                    return Step::Continue;
                }

                self.begin_reconnect()
            },
        }
    }

    fn handle_lifecycle(&mut self, event: LifecycleEvent) -> Step {
        match event {
            LifecycleEvent::ConnectWebsocket { session, .. } => {
                self.connect(session);
                Step::Continue
            },
            LifecycleEvent::UpdateSendHandler { handler, .. } => {
                *self.handler.lock() = handler;
                if let Some(live) = &self.live {
                    let _ = live.transport_tx.send(TransportMessage::HandlerUpdated);
                }
                Step::Continue
            },
            LifecycleEvent::UpdateSpeakingMode { mode, .. } => {
                self.speaking = mode;
                if self.current_phase() == ConnectionPhase::Connected {
                    self.send_speaking();
                }
                Step::Continue
            },
            LifecycleEvent::CloseWebsocket { event, .. } => self.handle_close(&event),
            LifecycleEvent::Shutdown => {
                self.destroy();
                Step::Terminal
            },
        }
    }

    /// Starts a full handshake against a fresh session assignment,
    /// superseding any connection or handshake currently in flight.
    fn connect(&mut self, session: SessionInfo) {
        self.attempt += 1;
        self.halt_live_tasks();
        self.session = Some(session.clone());
        self.set_phase(ConnectionPhase::ConnectingWebsocket);

        let member = self.member.clone();
        let attempt = self.attempt;
        let attempt_timeout = self.config.handshake_timeout;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = connection::open_gateway(&member, &session, attempt_timeout).await;
            let _ = tx.send(StackMessage::GatewayReady { attempt, result });
        });
    }

    fn establish(&mut self, negotiation: GatewayNegotiation) {
        self.set_phase(ConnectionPhase::ConnectingUdp);

        let udp = Arc::clone(&self.udp);
        let attempt = self.attempt;
        let attempt_timeout = self.config.handshake_timeout;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = connection::establish_udp(&udp, negotiation, attempt_timeout).await;
            let _ = tx.send(StackMessage::UdpReady { attempt, result });
        });
    }

    fn go_live(&mut self, established: Established) {
        let (socket_tx, socket_rx) = flume::unbounded();
        let (transport_tx, transport_rx) = flume::unbounded();

        let gateway = GatewaySocket::new(
            socket_rx,
            established.client,
            self.member.clone(),
            established.ssrc,
            self.attempt,
            established.heartbeat_interval,
            self.tx.clone(),
            self.lifecycle_tx.clone(),
        );
        tokio::spawn(socket::runner(gateway));

        let transport = AudioTransport::new(
            transport_rx,
            Arc::clone(&self.udp),
            established.remote_addr,
            established.ssrc,
            established.mode,
            established.cipher,
            Arc::clone(&self.handler),
        );
        tokio::spawn(transport::runner(transport));

        self.live = Some(LiveConnection {
            socket_tx,
            transport_tx,
            ssrc: established.ssrc,
        });

        self.set_phase(ConnectionPhase::Connected);
        self.send_speaking();
    }

    /// Swaps a resumed websocket under the existing (paused) transport.
    fn resume_live(&mut self, ws: WsStream, heartbeat_interval: Duration) {
        let live = match self.live.as_mut() {
            Some(live) => live,
            // The transport is gone; nothing to rejoin onto.
            None => {
                let _ = self.full_reconnect();
                return;
            },
        };

        let (socket_tx, socket_rx) = flume::unbounded();
        let gateway = GatewaySocket::new(
            socket_rx,
            ws,
            self.member.clone(),
            live.ssrc,
            self.attempt,
            heartbeat_interval,
            self.tx.clone(),
            self.lifecycle_tx.clone(),
        );
        tokio::spawn(socket::runner(gateway));

        live.socket_tx = socket_tx;
        let _ = live.transport_tx.send(TransportMessage::Resume);

        self.set_phase(ConnectionPhase::Connected);
        self.send_speaking();
    }

    /// Pauses the transport and re-opens the websocket using the last known
    /// session assignment.
    fn begin_reconnect(&mut self) -> Step {
        let session = match self.session.clone() {
            Some(session) => session,
            None => return self.fail_connection(&ConnectionError::AttemptDiscarded),
        };

        self.set_phase(ConnectionPhase::ReconnectingWebsocket);

        if let Some(live) = &self.live {
            let _ = live.socket_tx.send(SocketMessage::Poison);
            let _ = live.transport_tx.send(TransportMessage::Pause);
        }

        self.attempt += 1;

        let member = self.member.clone();
        let attempt = self.attempt;
        let attempt_timeout = self.config.handshake_timeout;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = connection::resume(&member, &session, attempt_timeout).await;
            let _ = tx.send(StackMessage::SessionResumed { attempt, result });
        });

        Step::Continue
    }

    /// Falls back to a complete re-identify, discarding the old transport.
    fn full_reconnect(&mut self) -> Step {
        match self.session.clone() {
            Some(session) => {
                self.connect(session);
                Step::Continue
            },
            None => self.fail_connection(&ConnectionError::AttemptDiscarded),
        }
    }

    fn handle_close(&mut self, event: &WebsocketClosed) -> Step {
        if event.by_remote && allows_reconnect(Some(event.code)) && self.session.is_some() {
            debug!("Remote closure {} of {} is reconnect-eligible.", event.code, self.member);
            // The pipeline marked this stack as terminating when it routed
            // the close; surviving it re-arms future closes.
            self.terminating.store(false, Ordering::Release);
            self.begin_reconnect()
        } else {
            self.destroy();
            Step::Terminal
        }
    }

    /// Surfaces a failed connection attempt, then tears the stack down.
    ///
    /// The notification is emitted before any internal disposal happens.
    fn fail_connection(&mut self, e: &ConnectionError) -> Step {
        warn!("Voice connection for {} failed: {}", self.member, e);

        let _ = self.api_tx.send(ApiEvent::WebsocketClosed(WebsocketClosed {
            member: self.member.clone(),
            code: 1006,
            reason: e.to_string(),
            by_remote: false,
        }));

        self.destroy();
        Step::Terminal
    }

    /// Terminal transition: releases the socket and transport, detaches the
    /// registry entry so the key can be recreated later.
    fn destroy(&mut self) {
        self.set_phase(ConnectionPhase::Disconnecting);

        // Invalidate every in-flight continuation.
        self.attempt += 1;

        if let Some(live) = self.live.take() {
            let _ = live.socket_tx.send(SocketMessage::Close(
                CLIENT_CLOSE_CODE,
                CLIENT_CLOSE_REASON.into(),
            ));
            let _ = live.transport_tx.send(TransportMessage::Poison);
        }

        self.registry.remove(&self.member);
        self.set_phase(ConnectionPhase::Destroyed);
    }

    fn halt_live_tasks(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.socket_tx.send(SocketMessage::Poison);
            let _ = live.transport_tx.send(TransportMessage::Poison);
        }
    }

    fn send_speaking(&self) {
        if let (Some(mode), Some(live)) = (self.speaking, &self.live) {
            let _ = live
                .socket_tx
                .send(SocketMessage::Speaking(SpeakingMode::to_mask(Some(mode))));
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        trace!("{} entering phase {:?}.", self.member, phase);
        *self.phase.write() = phase;
    }

    fn current_phase(&self) -> ConnectionPhase {
        *self.phase.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRig {
        stack: AudioStack,
        api_rx: Receiver<ApiEvent>,
        #[allow(dead_code)]
        mailbox_rx: Receiver<StackMessage>,
        registry: Arc<Registry>,
    }

    async fn rig() -> TestRig {
        let member = Member::new("user", "guild");
        let registry = Arc::new(Registry::new());
        let (api_tx, api_rx) = flume::unbounded();
        let (lifecycle_tx, _lifecycle_rx) = flume::unbounded();
        let (tx, mailbox_rx) = flume::unbounded();
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        // Seed a registry entry so terminal transitions have one to remove.
        registry.resolve(&member, || StackHandle {
            tx: tx.clone(),
            phase: Arc::new(RwLock::new(ConnectionPhase::Uninitialized)),
            terminating: Arc::new(AtomicBool::new(false)),
            done: flume::bounded(1).1,
        });

        let stack = AudioStack {
            member,
            config: Config::default(),
            udp,
            api_tx,
            lifecycle_tx,
            registry: Arc::clone(&registry),
            tx,
            phase: Arc::new(RwLock::new(ConnectionPhase::Uninitialized)),
            terminating: Arc::new(AtomicBool::new(false)),
            session: None,
            attempt: 0,
            handler: Arc::new(Mutex::new(None)),
            speaking: None,
            live: None,
        };

        TestRig {
            stack,
            api_rx,
            mailbox_rx,
            registry,
        }
    }

    fn session(n: &str) -> SessionInfo {
        SessionInfo::new(n, "voice.invalid", "token")
    }

    #[tokio::test]
    async fn superseded_handshake_is_discarded() {
        let mut rig = rig().await;

        rig.stack
            .handle(StackMessage::Lifecycle(LifecycleEvent::ConnectWebsocket {
                member: rig.stack.member.clone(),
                session: session("first"),
            }));
        assert_eq!(rig.stack.current_phase(), ConnectionPhase::ConnectingWebsocket);
        let first_attempt = rig.stack.attempt;

        rig.stack
            .handle(StackMessage::Lifecycle(LifecycleEvent::ConnectWebsocket {
                member: rig.stack.member.clone(),
                session: session("second"),
            }));
        assert!(rig.stack.attempt > first_attempt);

        // The stale continuation must neither fail the stack nor notify.
        let step = rig.stack.handle(StackMessage::GatewayReady {
            attempt: first_attempt,
            result: Err(ConnectionError::TimedOut),
        });
        assert!(matches!(step, Step::Continue));
        assert_eq!(rig.stack.current_phase(), ConnectionPhase::ConnectingWebsocket);
        assert!(rig.api_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_handshake_notifies_before_destruction() {
        let mut rig = rig().await;

        rig.stack
            .handle(StackMessage::Lifecycle(LifecycleEvent::ConnectWebsocket {
                member: rig.stack.member.clone(),
                session: session("only"),
            }));

        let step = rig.stack.handle(StackMessage::GatewayReady {
            attempt: rig.stack.attempt,
            result: Err(ConnectionError::TimedOut),
        });

        assert!(matches!(step, Step::Terminal));
        match rig.api_rx.try_recv().unwrap() {
            ApiEvent::WebsocketClosed(ev) => {
                assert!(!ev.by_remote);
                assert!(ev.reason.contains("timed out"));
            },
        }
        assert_eq!(rig.stack.current_phase(), ConnectionPhase::Destroyed);
        assert!(rig.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn local_close_is_terminal() {
        let mut rig = rig().await;
        let member = rig.stack.member.clone();

        let step = rig.stack.handle(StackMessage::Lifecycle(LifecycleEvent::CloseWebsocket {
            member: member.clone(),
            event: WebsocketClosed {
                member,
                code: CLIENT_CLOSE_CODE,
                reason: CLIENT_CLOSE_REASON.into(),
                by_remote: false,
            },
        }));

        assert!(matches!(step, Step::Terminal));
        assert_eq!(rig.stack.current_phase(), ConnectionPhase::Destroyed);
    }

    #[tokio::test]
    async fn eligible_remote_close_reconnects() {
        let mut rig = rig().await;
        let member = rig.stack.member.clone();

        rig.stack
            .handle(StackMessage::Lifecycle(LifecycleEvent::ConnectWebsocket {
                member: member.clone(),
                session: session("live"),
            }));

        let step = rig.stack.handle(StackMessage::Lifecycle(LifecycleEvent::CloseWebsocket {
            member: member.clone(),
            event: WebsocketClosed {
                member,
                code: 4015,
                reason: "voice server crashed".into(),
                by_remote: true,
            },
        }));

        assert!(matches!(step, Step::Continue));
        assert_eq!(
            rig.stack.current_phase(),
            ConnectionPhase::ReconnectingWebsocket
        );
    }

    #[tokio::test]
    async fn buffered_speaking_state_is_sent_on_connect() {
        let mut rig = rig().await;
        let member = rig.stack.member.clone();

        rig.stack
            .handle(StackMessage::Lifecycle(LifecycleEvent::UpdateSpeakingMode {
                member: member.clone(),
                mode: Some(SpeakingMode::MICROPHONE | SpeakingMode::PRIORITY),
            }));

        // Nothing live yet: the desired state is only buffered.
        assert_eq!(rig.stack.speaking.map(|m| m.bits()), Some(5));

        let (socket_tx, socket_rx) = flume::unbounded();
        let (transport_tx, _transport_rx) = flume::unbounded();
        rig.stack.live = Some(LiveConnection {
            socket_tx,
            transport_tx,
            ssrc: 1,
        });
        rig.stack.set_phase(ConnectionPhase::Connected);

        rig.stack.send_speaking();

        match socket_rx.try_recv().unwrap() {
            SocketMessage::Speaking(mask) => assert_eq!(mask, 5),
            _ => panic!("expected speaking message"),
        }
    }
}
