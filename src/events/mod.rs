//! Events driving and observing connection lifecycles.
//!
//! [`LifecycleEvent`]s flow *into* the library, one ordered stream per
//! connection key; [`ApiEvent`]s flow *out* to the library's consumer via
//! [`Syrinx::event_stream`].
//!
//! [`Syrinx::event_stream`]: crate::Syrinx::event_stream

mod api;
mod lifecycle;

pub use self::{
    api::{ApiEvent, WebsocketClosed},
    lifecycle::LifecycleEvent,
};
