//! Asterisk REST Interface (ARI) control-plane client.
//!
//! `client` carries the request/response commands, `events` the typed
//! event model, `ws` the persistent event stream, and `retry` the
//! transient-error retry policy shared by callers.

pub mod client;
pub mod events;
pub(crate) mod retry;
pub mod ws;

pub use client::{AriClient, AriError, AriResult};
pub use events::{AriEvent, Bridge, CallerId, Channel, Playback};
pub use ws::AriEventStream;
