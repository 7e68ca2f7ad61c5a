//! Parlance Core - shared library for the Parlance voice agent.
//!
//! Parlance bridges an Asterisk PBX (controlled over ARI) with pluggable
//! STT → LLM → TTS pipelines: it answers inbound calls, extracts the
//! caller's media stream, runs it through a configurable AI pipeline and
//! plays synthesized responses back with conversational turn-taking.
//!
//! # Architecture
//!
//! - [`audio`]: codec conversion, stateful resampling, framing and VAD
//! - [`session`]: per-call state and its atomic store
//! - [`ari`]: ARI REST commands and the persistent event stream
//! - [`transport`]: RTP/UDP and AudioSocket media transports
//! - [`pipeline`]: adapter traits, concrete adapters, pipeline resolution
//! - [`playback`]: file-based and streaming downstream playback
//! - [`coordinator`]: the per-call conversation state machine
//! - [`engine`]: top-level call lifecycle bound to PBX events
//! - [`bootstrap`]: composition root wiring all of the above

#![warn(clippy::all)]

pub mod ari;
pub mod audio;
pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod playback;
pub mod session;
pub mod transport;

// Re-export commonly used types at the crate root
pub use ari::{AriClient, AriError, AriEvent, AriEventStream};
pub use audio::{AudioEncoding, Resampler, UtteranceDetector, VadMode};
pub use bootstrap::{bootstrap, BootstrappedServices};
pub use config::{AudioTransport, Config, DownstreamMode, PipelineEntry, StreamingConfig};
pub use coordinator::{ConversationCoordinator, CoordEvent};
pub use engine::CallEngine;
pub use error::{ErrorCode, ParlanceError, ParlanceResult};
pub use metrics::Metrics;
pub use pipeline::{PipelineOrchestrator, PipelineResolution};
pub use playback::{PlaybackManager, StreamingPlaybackManager, TtsGate};
pub use session::{CallSession, ConversationState, SessionStore};
pub use transport::{AudioSocketServer, MediaTransport, RtpPacketizer, RtpTransport};
