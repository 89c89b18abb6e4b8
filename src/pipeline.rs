//! Lifecycle sequencing and the connection registry.
//!
//! All externally submitted events funnel through one ingress channel and a
//! single dispatch loop, which preserves submission order into each stack's
//! mailbox; the stacks themselves run in parallel. The registry is the
//! two-level (user, guild) map of live stacks, created lazily and removed
//! only by their own terminal transitions.

use crate::{
    events::{ApiEvent, LifecycleEvent},
    id::{GuildId, Member, UserId},
    stack::{self, ConnectionPhase, StackHandle, StackMessage},
    Config,
};
use dashmap::DashMap;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    net::UdpSocket,
    select,
    sync::watch,
    time::{timeout_at, Instant},
};
use tracing::{debug, trace, warn};

/// Two-level map of live stacks: outer key user, inner key guild.
pub(crate) struct Registry {
    stacks: DashMap<UserId, DashMap<GuildId, StackHandle>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            stacks: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, member: &Member) -> Option<StackHandle> {
        self.stacks
            .get(&member.user_id)
            .and_then(|inner| inner.get(&member.guild_id).map(|handle| handle.clone()))
    }

    /// Atomic get-or-create: concurrent resolves for one key observe exactly
    /// one created stack, and the factory runs at most once.
    pub(crate) fn resolve(
        &self,
        member: &Member,
        factory: impl FnOnce() -> StackHandle,
    ) -> StackHandle {
        let inner = self
            .stacks
            .entry(member.user_id.clone())
            .or_insert_with(DashMap::new);

        let handle = inner
            .entry(member.guild_id.clone())
            .or_insert_with(factory)
            .value()
            .clone();
        handle
    }

    /// Detaches one entry so a later resolve for the same key starts fresh.
    ///
    /// Invoked only by the owning stack upon its terminal transition.
    pub(crate) fn remove(&self, member: &Member) {
        if let Some(inner) = self.stacks.get(&member.user_id) {
            inner.remove(&member.guild_id);
        }
    }

    /// Point-in-time phases of every live connection. Reads only the shared
    /// phase cells, never a stack mailbox, so in-flight connection work is
    /// not blocked on.
    pub(crate) fn snapshot(&self) -> Vec<(Member, ConnectionPhase)> {
        self.stacks
            .iter()
            .flat_map(|outer| {
                let user_id = outer.key().clone();
                outer
                    .value()
                    .iter()
                    .map(|entry| {
                        (
                            Member {
                                user_id: user_id.clone(),
                                guild_id: entry.key().clone(),
                            },
                            *entry.value().phase.read(),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn handles(&self) -> Vec<StackHandle> {
        self.stacks
            .iter()
            .flat_map(|outer| {
                outer
                    .value()
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn clear(&self) {
        self.stacks.clear();
    }
}

/// The single ingress point for all lifecycle events.
pub(crate) struct LifecyclePipeline {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: Config,
    udp: Arc<UdpSocket>,
    ingress_tx: Sender<LifecycleEvent>,
    api_tx: Mutex<Option<Sender<ApiEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    accepting: AtomicBool,
}

impl LifecyclePipeline {
    pub(crate) fn new(
        config: Config,
        udp: Arc<UdpSocket>,
        api_tx: Sender<ApiEvent>,
    ) -> Arc<Self> {
        let (ingress_tx, ingress_rx) = flume::unbounded();
        let (shutdown_tx, _) = watch::channel(false);

        let pipeline = Arc::new(Self {
            registry: Arc::new(Registry::new()),
            config,
            udp,
            ingress_tx,
            api_tx: Mutex::new(Some(api_tx)),
            shutdown_tx,
            accepting: AtomicBool::new(true),
        });

        tokio::spawn(Self::run(Arc::clone(&pipeline), ingress_rx));

        pipeline
    }

    /// Fire-and-forget submission. Never blocks, never fails observably:
    /// unroutable events are logged and dropped.
    pub(crate) fn submit(&self, event: LifecycleEvent) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!("Dropping lifecycle event submitted after shutdown: {:?}", event);
            return;
        }

        if self.ingress_tx.send(event).is_err() {
            warn!("Lifecycle pipeline is gone; event dropped.");
        }
    }

    async fn run(self: Arc<Self>, rx: Receiver<LifecycleEvent>) {
        trace!("Lifecycle pipeline started.");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            select! {
                _ = shutdown_rx.changed() => break,
                event = rx.recv_async() => match event {
                    Ok(event) => self.dispatch(event),
                    Err(flume::RecvError::Disconnected) => break,
                },
            }
        }

        trace!("Lifecycle pipeline finished.");
    }

    fn dispatch(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Shutdown => {
                self.signal_shutdown();
            },
            LifecycleEvent::CloseWebsocket { member, event } => {
                // Destructive events never create a stack: a close for an
                // absent or already-terminating key is dropped, which also
                // keeps repeated closes to a single notification.
                match self.registry.get(&member) {
                    Some(handle) if !handle.terminating.swap(true, Ordering::AcqRel) => {
                        // The outward notification precedes the stack's own
                        // teardown, always.
                        if let Some(api_tx) = &*self.api_tx.lock() {
                            let _ = api_tx.send(ApiEvent::WebsocketClosed(event.clone()));
                        }

                        let _ = handle
                            .tx
                            .send(StackMessage::Lifecycle(LifecycleEvent::CloseWebsocket {
                                member,
                                event,
                            }));
                    },
                    Some(_) => debug!("Dropping close for terminating connection {}.", member),
                    None => debug!("Dropping close for unknown connection {}.", member),
                }
            },
            event => {
                // Constructive and neutral events lazily create their stack.
                let member = match event.member() {
                    Some(member) => member.clone(),
                    None => return,
                };

                let api_tx = match self.api_tx.lock().clone() {
                    Some(api_tx) => api_tx,
                    None => {
                        debug!("Dropping lifecycle event during shutdown: {:?}", event);
                        return;
                    },
                };

                let handle = self.resolve(&member, api_tx);

                if handle.tx.send(StackMessage::Lifecycle(event)).is_err() {
                    warn!("Mailbox of destroyed connection {}; event dropped.", member);
                }
            },
        }
    }

    fn resolve(&self, member: &Member, api_tx: Sender<ApiEvent>) -> StackHandle {
        self.registry.resolve(member, || {
            stack::launch(
                member.clone(),
                self.config.clone(),
                Arc::clone(&self.udp),
                api_tx,
                self.ingress_tx.clone(),
                Arc::clone(&self.registry),
                self.shutdown_tx.subscribe(),
            )
        })
    }

    /// Stops intake and force-broadcasts teardown to every stack, bypassing
    /// per-key mailbox ordering.
    pub(crate) fn signal_shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    /// Full shutdown protocol: stop intake, broadcast, wait for every stack
    /// to acknowledge destruction within the grace period, then close the
    /// API event stream.
    pub(crate) async fn shutdown(&self) {
        self.signal_shutdown();

        let deadline = Instant::now() + self.config.shutdown_grace;

        for handle in self.registry.handles() {
            // Acknowledged by each stack dropping its end on exit.
            let _ = timeout_at(deadline, handle.done.recv_async()).await;
        }

        self.registry.clear();
        self.api_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::WebsocketClosed, model::SpeakingMode};
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicUsize;

    fn dummy_handle() -> (StackHandle, Receiver<StackMessage>) {
        let (tx, rx) = flume::unbounded();
        (
            StackHandle {
                tx,
                phase: Arc::new(RwLock::new(ConnectionPhase::Uninitialized)),
                terminating: Arc::new(AtomicBool::new(false)),
                done: flume::bounded(1).1,
            },
            rx,
        )
    }

    fn member() -> Member {
        Member::new("1", "100")
    }

    #[test]
    fn concurrent_resolve_creates_exactly_one_stack() {
        let registry = Arc::new(Registry::new());
        let built = Arc::new(AtomicUsize::new(0));
        let (handle, rx) = dummy_handle();

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let built = Arc::clone(&built);
                let handle = handle.clone();

                std::thread::spawn(move || {
                    let resolved = registry.resolve(&member(), || {
                        built.fetch_add(1, Ordering::SeqCst);
                        handle
                    });
                    let _ = resolved.tx.send(StackMessage::Lifecycle(LifecycleEvent::Shutdown));
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        // Every resolve returned the same stack: all sends hit one mailbox.
        assert_eq!(rx.len(), 16);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn removed_keys_resolve_fresh() {
        let registry = Registry::new();
        let m = member();

        registry.resolve(&m, || dummy_handle().0);
        registry.remove(&m);
        assert!(registry.get(&m).is_none());

        let built = AtomicUsize::new(0);
        registry.resolve(&m, || {
            built.fetch_add(1, Ordering::SeqCst);
            dummy_handle().0
        });
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    async fn test_pipeline() -> (Arc<LifecyclePipeline>, Receiver<ApiEvent>) {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (api_tx, api_rx) = flume::unbounded();
        (LifecyclePipeline::new(Config::default(), udp, api_tx), api_rx)
    }

    fn speaking_event(member: Member, mask: u32) -> LifecycleEvent {
        LifecycleEvent::UpdateSpeakingMode {
            member,
            mode: SpeakingMode::from_bits(mask),
        }
    }

    #[tokio::test]
    async fn events_for_one_key_stay_ordered() {
        let (pipeline, _api_rx) = test_pipeline().await;

        let m = member();
        let other = Member::new("1", "200");
        let (handle, rx) = dummy_handle();
        let (other_handle, _other_rx) = dummy_handle();

        pipeline.registry.resolve(&m, || handle);
        pipeline.registry.resolve(&other, || other_handle);

        for mask in 0..8 {
            pipeline.submit(speaking_event(m.clone(), mask));
            // Unrelated-key traffic interleaved with ours.
            pipeline.submit(speaking_event(other.clone(), 1));
        }

        for expected in 0..8 {
            match rx.recv_async().await.unwrap() {
                StackMessage::Lifecycle(LifecycleEvent::UpdateSpeakingMode { mode, .. }) => {
                    assert_eq!(SpeakingMode::to_mask(mode), expected);
                },
                _ => panic!("expected speaking update"),
            }
        }
    }

    #[tokio::test]
    async fn repeated_close_notifies_once() {
        let (pipeline, api_rx) = test_pipeline().await;

        let m = member();
        let (handle, rx) = dummy_handle();
        pipeline.registry.resolve(&m, || handle);

        let close = || LifecycleEvent::CloseWebsocket {
            member: m.clone(),
            event: WebsocketClosed {
                member: m.clone(),
                code: 1000,
                reason: "Closed by client".into(),
                by_remote: false,
            },
        };

        pipeline.submit(close());
        pipeline.submit(close());

        // The notification must arrive, and arrive exactly once.
        let evt = api_rx.recv_async().await.unwrap();
        assert!(matches!(evt, ApiEvent::WebsocketClosed(_)));

        // One forwarded close on the mailbox, nothing more on either channel.
        assert!(matches!(
            rx.recv_async().await.unwrap(),
            StackMessage::Lifecycle(LifecycleEvent::CloseWebsocket { .. })
        ));
        tokio::task::yield_now().await;
        assert!(api_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_for_unknown_key_is_a_noop() {
        let (pipeline, api_rx) = test_pipeline().await;

        pipeline.submit(LifecycleEvent::CloseWebsocket {
            member: member(),
            event: WebsocketClosed {
                member: member(),
                code: 1000,
                reason: "Closed by client".into(),
                by_remote: false,
            },
        });

        tokio::task::yield_now().await;
        assert!(api_rx.try_recv().is_err());
        assert!(pipeline.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_dropped() {
        let (pipeline, _api_rx) = test_pipeline().await;

        pipeline.signal_shutdown();
        pipeline.submit(speaking_event(member(), 1));

        tokio::task::yield_now().await;
        assert!(pipeline.registry.snapshot().is_empty());
    }
}
