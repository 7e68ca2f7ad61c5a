//! Typed per-call session state.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Conversation FSM state, mirrored into the session for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Greeting,
    Listening,
    Processing,
    Speaking,
    Ended,
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

/// One turn of the rolling conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: ConversationRole,
    pub content: String,
    /// Unix milliseconds when the entry was recorded.
    pub timestamp_ms: u64,
}

/// How downstream audio reaches this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportBinding {
    /// No media leg yet.
    None,
    /// RTP destination (Asterisk's external-media port) and our SSRC.
    Rtp { dest: SocketAddr, ssrc: u32 },
    /// AudioSocket connection id.
    AudioSocket { conn_id: String },
}

impl Default for TransportBinding {
    fn default() -> Self {
        Self::None
    }
}

/// Reference to an active PBX playback started by this engine.
#[derive(Debug, Clone)]
pub struct PlaybackRef {
    /// Deterministic id of the form `<type>:<call_id>:<ms>`.
    pub playback_id: String,
    pub call_id: String,
    pub channel_id: String,
    pub bridge_id: Option<String>,
    /// `sound:` URI handed to the PBX.
    pub media_uri: String,
    /// File backing the playback, when file-based.
    pub audio_file: Option<std::path::PathBuf>,
    pub created_at_ms: u64,
}

/// Streaming playback counters, kept on the session for observability.
#[derive(Debug, Clone, Default)]
pub struct StreamingStats {
    pub started: bool,
    pub current_stream_id: Option<String>,
    pub bytes_queued: u64,
    pub jitter_buffer_depth: usize,
    pub fallback_count: u64,
    pub keepalives_sent: u64,
    pub keepalive_timeouts: u64,
    pub last_error: Option<String>,
}

/// Complete state for one call, keyed by the canonical call id.
///
/// The canonical call id equals the caller channel id. The gating fields
/// maintain the invariant `tts_playing == !audio_capture_enabled ==
/// (tts_tokens non-empty)`; only [`super::SessionStore`] mutates them.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub caller_channel_id: String,
    pub local_channel_id: Option<String>,
    pub external_media_channel_id: Option<String>,
    pub bridge_id: Option<String>,

    /// Pipeline chosen at call start; immutable for the call's life.
    pub pipeline_name: String,
    pub conversation_state: ConversationState,

    /// When false, inbound audio is dropped before VAD.
    pub audio_capture_enabled: bool,
    pub tts_playing: bool,
    pub tts_tokens: HashSet<String>,

    /// Raised by gating activation; the inbound pump consumes it and
    /// resets its utterance detector.
    pub vad_reset_pending: bool,

    pub streaming: StreamingStats,
    pub transport: TransportBinding,

    /// Rolling history; index 0 is the system message.
    pub history: Vec<HistoryEntry>,

    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

impl CallSession {
    /// Creates a session for a newly arrived caller channel.
    pub fn new(caller_channel_id: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        let caller_channel_id = caller_channel_id.into();
        let now = now_ms();
        Self {
            call_id: caller_channel_id.clone(),
            caller_channel_id,
            local_channel_id: None,
            external_media_channel_id: None,
            bridge_id: None,
            pipeline_name: pipeline_name.into(),
            conversation_state: ConversationState::default(),
            audio_capture_enabled: true,
            tts_playing: false,
            tts_tokens: HashSet::new(),
            vad_reset_pending: false,
            streaming: StreamingStats::default(),
            transport: TransportBinding::None,
            history: Vec::new(),
            created_at_ms: now,
            last_activity_ms: now,
        }
    }

    /// Refcount of active TTS gating tokens.
    pub fn tts_refcount(&self) -> usize {
        self.tts_tokens.len()
    }

    /// All channel ids this session is known by.
    pub fn channel_ids(&self) -> Vec<&str> {
        let mut ids = vec![self.caller_channel_id.as_str()];
        if let Some(id) = &self.local_channel_id {
            ids.push(id);
        }
        if let Some(id) = &self.external_media_channel_id {
            ids.push(id);
        }
        ids
    }
}

/// Current Unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_uses_caller_channel_as_call_id() {
        let session = CallSession::new("chan-123", "default");
        assert_eq!(session.call_id, "chan-123");
        assert_eq!(session.caller_channel_id, "chan-123");
        assert!(session.audio_capture_enabled);
        assert!(!session.tts_playing);
        assert_eq!(session.tts_refcount(), 0);
    }

    #[test]
    fn channel_ids_lists_all_known_identifiers() {
        let mut session = CallSession::new("caller", "default");
        session.local_channel_id = Some("local".to_string());
        session.external_media_channel_id = Some("media".to_string());
        assert_eq!(session.channel_ids(), vec!["caller", "local", "media"]);
    }
}
