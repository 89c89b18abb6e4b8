use std::time::Duration;

/// Configuration shared by every connection a library instance manages.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Maximum time one gateway handshake stage (websocket negotiation, UDP
    /// establishment, session resume) may take before the attempt is failed.
    ///
    /// Defaults to 10 seconds. If set to `None`, handshakes will never time out.
    pub handshake_timeout: Option<Duration>,

    /// How long [`shutdown`] waits for live connections to acknowledge their
    /// teardown before the event stream is closed regardless.
    ///
    /// Defaults to 5 seconds.
    ///
    /// [`shutdown`]: crate::Syrinx::shutdown
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(10)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Sets this `Config`'s handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, handshake_timeout: Option<Duration>) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Sets this `Config`'s shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
}
