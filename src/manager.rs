use crate::{
    constants::{CLIENT_CLOSE_CODE, CLIENT_CLOSE_REASON},
    error::SetupResult,
    events::{ApiEvent, LifecycleEvent, WebsocketClosed},
    id::Member,
    info::SessionInfo,
    input::AudioSendHandler,
    model::SpeakingMode,
    pipeline::LifecyclePipeline,
    stack::ConnectionPhase,
    Config,
};
use flume::Receiver;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::instrument;

/// A manager for any number of simultaneous voice connections, keyed by
/// [`Member`].
///
/// One instance is enough for any number of bot accounts and guilds: every
/// connection gets its own websocket and state machine, all audio shares a
/// single process-wide UDP socket, and events for different connections are
/// handled concurrently while each connection sees its own events strictly
/// in submission order.
///
/// All methods are fire-and-forget: they enqueue a lifecycle event and
/// return immediately. Outcomes that matter to the caller arrive on
/// [`event_stream`].
///
/// [`event_stream`]: Syrinx::event_stream
pub struct Syrinx {
    pipeline: Arc<LifecyclePipeline>,
    api_rx: Receiver<ApiEvent>,
    udp: Arc<UdpSocket>,
}

impl Syrinx {
    /// Creates a new manager with default configuration.
    ///
    /// Fails only if the shared UDP socket cannot be acquired.
    pub async fn new() -> SetupResult<Arc<Self>> {
        Self::from_config(Config::default()).await
    }

    /// Creates a new manager using the given configuration.
    pub async fn from_config(config: Config) -> SetupResult<Arc<Self>> {
        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let (api_tx, api_rx) = flume::unbounded();

        let pipeline = LifecyclePipeline::new(config, Arc::clone(&udp), api_tx);

        Ok(Arc::new(Self {
            pipeline,
            api_rx,
            udp,
        }))
    }

    /// Hands over a voice-server-update received on the platform's main
    /// gateway, triggering connection (or migration) of the member's stack.
    ///
    /// A newer update for a member supersedes any handshake still in flight
    /// with older session parameters.
    #[instrument(skip(self, session))]
    pub fn provide_voice_server_update(&self, member: Member, session: SessionInfo) {
        self.pipeline
            .submit(LifecycleEvent::ConnectWebsocket { member, session });
    }

    /// Attaches an audio source to a member's connection.
    ///
    /// May be called before the connection exists; sending begins as soon as
    /// the connection can transmit.
    #[instrument(skip(self, handler))]
    pub fn set_send_handler<H: AudioSendHandler>(&self, member: Member, handler: H) {
        self.pipeline.submit(LifecycleEvent::UpdateSendHandler {
            member,
            handler: Some(Box::new(handler)),
        });
    }

    /// Detaches a member's audio source. The transport stays alive and
    /// keeps the UDP path open with keepalives.
    #[instrument(skip(self))]
    pub fn remove_send_handler(&self, member: Member) {
        self.pipeline.submit(LifecycleEvent::UpdateSendHandler {
            member,
            handler: None,
        });
    }

    /// Sets the speaking flags advertised by a member's connection.
    ///
    /// Takes effect immediately when connected, otherwise as soon as the
    /// connection next reaches its connected state. `None` reduces to an
    /// empty flag set.
    #[instrument(skip(self))]
    pub fn set_speaking_mode(&self, member: Member, mode: Option<SpeakingMode>) {
        self.pipeline
            .submit(LifecycleEvent::UpdateSpeakingMode { member, mode });
    }

    /// Closes a member's connection.
    ///
    /// The closure is surfaced on [`event_stream`] before the stack is
    /// destroyed. Closing an unknown or already-destroyed member is a no-op.
    ///
    /// [`event_stream`]: Syrinx::event_stream
    #[instrument(skip(self))]
    pub fn close_connection(&self, member: Member) {
        let event = WebsocketClosed {
            member: member.clone(),
            code: CLIENT_CLOSE_CODE,
            reason: CLIENT_CLOSE_REASON.to_string(),
            by_remote: false,
        };

        self.pipeline
            .submit(LifecycleEvent::CloseWebsocket { member, event });
    }

    /// Point-in-time phases of every live connection.
    pub fn connection_states(&self) -> Vec<(Member, ConnectionPhase)> {
        self.pipeline.registry.snapshot()
    }

    /// A stream of outward notifications.
    ///
    /// The stream is closed once [`shutdown`] completes. Receivers may be
    /// cloned freely; each event is delivered to one receiver.
    ///
    /// [`shutdown`]: Syrinx::shutdown
    pub fn event_stream(&self) -> Receiver<ApiEvent> {
        self.api_rx.clone()
    }

    /// Releases all resources held.
    ///
    /// Stops accepting events, tears down every connection, waits up to the
    /// configured grace period for acknowledgement, then closes the event
    /// stream. The shared UDP socket is released last, when the final
    /// reference to it drops.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }

    /// The shared UDP socket used for all audio traffic and NAT hole
    /// punching. Closed by [`shutdown`].
    ///
    /// [`shutdown`]: Syrinx::shutdown
    pub fn udp_socket(&self) -> &UdpSocket {
        &self.udp
    }
}

impl Drop for Syrinx {
    /// Signals teardown of all connections, without waiting for it.
    fn drop(&mut self) {
        self.pipeline.signal_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_connection_surfaces_close_event() {
        let manager = Syrinx::new().await.unwrap();
        let events = manager.event_stream();
        let member = Member::new("user", "guild");

        // Nothing listens on this endpoint: the websocket connect fails and
        // the stack must tear itself down, notifying first.
        manager.provide_voice_server_update(
            member.clone(),
            SessionInfo::new("sess", "127.0.0.1:1", "token"),
        );

        let event = timeout(Duration::from_secs(30), events.recv_async())
            .await
            .expect("no close notification arrived")
            .unwrap();

        match event {
            ApiEvent::WebsocketClosed(closed) => {
                assert_eq!(closed.member, member);
                assert!(!closed.by_remote);
                assert!(!closed.reason.is_empty());
            },
        }

        wait_for(|| manager.connection_states().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_empties_connection_states() {
        let manager = Syrinx::new().await.unwrap();

        // Neutral events lazily create idle stacks.
        manager.set_speaking_mode(Member::new("user", "guild-a"), Some(SpeakingMode::MICROPHONE));
        manager.set_speaking_mode(Member::new("user", "guild-b"), None);

        wait_for(|| manager.connection_states().len() == 2).await;

        for (_, phase) in manager.connection_states() {
            assert_eq!(phase, ConnectionPhase::Uninitialized);
        }

        manager.shutdown().await;

        assert!(manager.connection_states().is_empty());

        // The event stream ends once all stacks have acknowledged teardown.
        let events = manager.event_stream();
        let _ = timeout(Duration::from_secs(5), async {
            while events.recv_async().await.is_ok() {}
        })
        .await
        .expect("event stream did not close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_unknown_connection_is_a_noop() {
        let manager = Syrinx::new().await.unwrap();
        let events = manager.event_stream();

        manager.close_connection(Member::new("user", "guild"));
        manager.close_connection(Member::new("user", "guild"));

        sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(manager.connection_states().is_empty());
    }
}
