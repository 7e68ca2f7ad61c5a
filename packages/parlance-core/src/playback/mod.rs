//! Downstream playback: file-based via the PBX and chunked streaming
//! with file fallback.

pub mod manager;
pub mod streaming;

use async_trait::async_trait;

pub use manager::PlaybackManager;
pub use streaming::StreamingPlaybackManager;

/// Minimal capability the playback managers need from the conversation
/// coordinator. Injected after construction to break the lifecycle cycle;
/// without a coordinator the managers gate through the session store
/// directly.
#[async_trait]
pub trait TtsGate: Send + Sync {
    /// TTS playback is starting under `token`. Returns false when gating
    /// could not be established (unknown call).
    async fn on_tts_start(&self, call_id: &str, token: &str) -> bool;

    /// TTS playback under `token` ended (finished, cancelled or failed).
    async fn on_tts_end(&self, call_id: &str, token: &str, reason: &str);
}
