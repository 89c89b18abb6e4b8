#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Syrinx is an async voice connection manager for Discord-style voice
//! infrastructure, written in Rust. The library offers:
//!  * Any number of simultaneous voice connections, one per (user, guild)
//!  pair, each with its own control websocket and state machine.
//!  * A single fire-and-forget event surface: feed in voice-server updates,
//!  audio sources, and speaking state; observe closures and failures on an
//!  outward event stream.
//!  * Strict per-connection event ordering with full cross-connection
//!  concurrency, automatic reconnection on recoverable closures, and one
//!  shared UDP socket carrying every connection's encrypted RTP traffic.
//!
//! ## Feeding the library
//! Syrinx deliberately contains no main-gateway client: your bot already
//! has one. Forward each voice-server-update you receive to
//! [`Syrinx::provide_voice_server_update`], attach an [`AudioSendHandler`]
//! producing 48 kHz Opus frames, and the library does the rest.
//!
//! ## Shutdown
//! A single [`Syrinx::shutdown`] tears down every connection, closes the
//! event stream, and releases the shared UDP socket.

#![warn(clippy::pedantic)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
)]

mod config;
pub mod constants;
mod crypto;
pub mod error;
pub mod events;
mod id;
mod info;
pub mod input;
mod manager;
pub mod model;
mod pipeline;
mod stack;
mod ws;

pub use crate::{
    config::Config,
    crypto::CryptoMode,
    error::{SetupError, SetupResult},
    events::{ApiEvent, LifecycleEvent, WebsocketClosed},
    id::{GuildId, Member, UserId},
    info::SessionInfo,
    input::AudioSendHandler,
    manager::Syrinx,
    model::SpeakingMode,
    stack::ConnectionPhase,
};
