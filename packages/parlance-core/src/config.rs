//! Core application configuration.
//!
//! The server binary loads a YAML document and converts it into these types;
//! everything here is immutable after startup. Validation of pipeline keys
//! against the adapter registry happens in the pipeline orchestrator.

use std::net::IpAddr;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::audio::AudioEncoding;
use crate::error::{ParlanceError, ParlanceResult};

/// Which media transport carries call audio between Asterisk and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioTransport {
    /// ExternalMedia channel speaking RTP over UDP.
    #[default]
    Rtp,
    /// Framed TCP AudioSocket connection.
    Audiosocket,
}

/// How synthesized audio reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamMode {
    /// Chunked streaming over the media transport with file fallback.
    #[default]
    Stream,
    /// File-based playback through the PBX only.
    File,
}

/// Connection settings for the Asterisk ARI control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsteriskConfig {
    /// Asterisk host name or IP.
    pub host: String,
    /// ARI HTTP port.
    pub port: u16,
    /// ARI username.
    pub username: String,
    /// ARI password.
    pub password: String,
    /// Stasis application name. Channels entering this app are ours.
    pub app_name: String,
}

impl Default for AsteriskConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            username: "parlance".to_string(),
            password: String::new(),
            app_name: "parlance".to_string(),
        }
    }
}

impl AsteriskConfig {
    /// Base URL for ARI REST requests.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/ari", self.host, self.port)
    }

    /// WebSocket URL for the ARI event stream.
    pub fn events_url(&self) -> String {
        format!(
            "ws://{}:{}/ari/events?app={}&api_key={}:{}",
            self.host, self.port, self.app_name, self.username, self.password
        )
    }
}

/// RTP transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    /// IP address advertised to Asterisk as the external-media host.
    /// When unset, the local IP is auto-detected.
    pub advertise_ip: Option<IpAddr>,
}

/// AudioSocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSocketConfig {
    /// Address the AudioSocket TCP server binds to.
    pub bind_addr: String,
    /// The AudioSocket endpoint Asterisk dials, as seen from Asterisk
    /// (host:port half of the `AudioSocket/...` dial string).
    pub asterisk_endpoint: String,
}

impl Default for AudioSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".to_string(),
            asterisk_endpoint: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Streaming playback tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Sample rate of the downstream audio in Hz.
    pub sample_rate: u32,
    /// Jitter buffer depth in milliseconds.
    pub jitter_buffer_ms: u64,
    /// Interval between keepalive checks in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Silence on the chunk stream longer than this is a dead connection.
    pub connection_timeout_ms: u64,
    /// Waiting longer than this for the next chunk triggers file fallback.
    pub fallback_timeout_ms: u64,
    /// Downstream chunk duration in milliseconds.
    pub chunk_size_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            jitter_buffer_ms: 50,
            keepalive_interval_ms: 5000,
            connection_timeout_ms: 10000,
            fallback_timeout_ms: 2000,
            chunk_size_ms: 20,
        }
    }
}

impl StreamingConfig {
    /// Jitter buffer capacity in chunks (floor of one chunk).
    pub fn jitter_buffer_chunks(&self) -> usize {
        let chunk_ms = self.chunk_size_ms.max(1);
        (self.jitter_buffer_ms.div_ceil(chunk_ms)).max(1) as usize
    }
}

/// Conversation behavior: greeting, prompt, history and barge-in tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Greeting synthesized when a call is answered.
    pub greeting: String,
    /// System prompt pinned at index 0 of the conversation history.
    pub system_prompt: String,
    /// Maximum history entries before the oldest user/assistant pair is trimmed.
    pub max_context: usize,
    /// Sustained caller speech above the threshold for this long cancels TTS.
    pub barge_in_ms: u64,
    /// Mean absolute PCM16 amplitude that counts as caller speech for barge-in.
    pub barge_in_threshold: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            greeting: "Hello, how can I help?".to_string(),
            system_prompt:
                "You are a helpful voice assistant. Keep responses concise and natural for speech."
                    .to_string(),
            max_context: 50,
            barge_in_ms: 150,
            barge_in_threshold: 1500,
        }
    }
}

/// Per-role adapter options carried by a pipeline entry.
///
/// Free-form `extra` keys are passed to the adapter untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub sample_rate: Option<u32>,
    pub encoding: Option<AudioEncoding>,
    /// Per-request timeout in seconds.
    pub response_timeout_sec: Option<u64>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl AdapterOptions {
    /// Effective per-request timeout, with a role-appropriate default.
    pub fn timeout_sec(&self, default: u64) -> u64 {
        self.response_timeout_sec.unwrap_or(default)
    }
}

/// Options for all three roles of one pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub stt: AdapterOptions,
    pub llm: AdapterOptions,
    pub tts: AdapterOptions,
}

/// One named STT/LLM/TTS pipeline. Keys are `<provider>_<role>`,
/// e.g. `deepgram_stt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEntry {
    pub stt: String,
    pub llm: String,
    pub tts: String,
    #[serde(default)]
    pub options: PipelineOptions,
}

/// Deepgram provider settings (streaming STT + REST TTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepgramProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub tts_model: String,
}

impl Default for DeepgramProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "api.deepgram.com".to_string(),
            model: "nova-2".to_string(),
            tts_model: "aura-asteria-en".to_string(),
        }
    }
}

/// Local multi-role AI server settings (one WebSocket, mode handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    /// WebSocket URL of the local AI server.
    pub ws_url: String,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8765".to_string(),
        }
    }
}

/// Webhook LLM settings (POST transcript + context, read text back).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookProviderConfig {
    /// URL the transcript is POSTed to.
    pub url: String,
    /// JSON key holding the response text; plain-text bodies are used as-is.
    pub response_key: String,
}

impl Default for WebhookProviderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            response_key: "response".to_string(),
        }
    }
}

/// Provider-specific configuration blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub deepgram: Option<DeepgramProviderConfig>,
    pub local: Option<LocalProviderConfig>,
    pub webhook: Option<WebhookProviderConfig>,
}

/// Top-level application configuration. Immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub asterisk: AsteriskConfig,
    pub audio_transport: AudioTransport,
    pub downstream_mode: DownstreamMode,
    /// Directory shared with Asterisk for file-based playback.
    pub media_dir: PathBuf,
    pub rtp: RtpConfig,
    pub audiosocket: AudioSocketConfig,
    pub streaming: StreamingConfig,
    pub conversation: ConversationConfig,
    /// Named pipelines; iteration order is insertion order.
    pub pipelines: IndexMap<String, PipelineEntry>,
    /// Pipeline used when a call arrives without an explicit selection.
    pub active_pipeline: Option<String>,
    pub providers: ProvidersConfig,
    /// Sessions older than this are swept.
    pub session_ttl_secs: u64,
    /// Port for the metrics/health HTTP surface.
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asterisk: AsteriskConfig::default(),
            audio_transport: AudioTransport::default(),
            downstream_mode: DownstreamMode::default(),
            media_dir: PathBuf::from("/mnt/asterisk_media/parlance"),
            rtp: RtpConfig::default(),
            audiosocket: AudioSocketConfig::default(),
            streaming: StreamingConfig::default(),
            conversation: ConversationConfig::default(),
            pipelines: IndexMap::new(),
            active_pipeline: None,
            providers: ProvidersConfig::default(),
            session_ttl_secs: 3600,
            http_port: 9410,
        }
    }
}

impl Config {
    /// Structural validation that does not need the adapter registry.
    ///
    /// Key resolution against registered factories is validated by the
    /// pipeline orchestrator at startup.
    pub fn validate(&self) -> ParlanceResult<()> {
        if self.pipelines.is_empty() {
            return Err(ParlanceError::Configuration(
                "at least one pipeline must be configured".to_string(),
            ));
        }

        if let Some(active) = &self.active_pipeline {
            if !self.pipelines.contains_key(active) {
                return Err(ParlanceError::Configuration(format!(
                    "active_pipeline '{}' is not a configured pipeline",
                    active
                )));
            }
        }

        if self.asterisk.password.is_empty() {
            return Err(ParlanceError::Configuration(
                "asterisk.password must be set".to_string(),
            ));
        }

        for (name, entry) in &self.pipelines {
            for key in [&entry.stt, &entry.llm, &entry.tts] {
                if key.rsplit_once('_').is_none() {
                    return Err(ParlanceError::Configuration(format!(
                        "pipeline '{}' component key '{}' is not of the form <provider>_<role>",
                        name, key
                    )));
                }
            }
        }

        Ok(())
    }

    /// The pipeline used when a call does not request one explicitly:
    /// `active_pipeline` if set, else the first configured pipeline.
    pub fn default_pipeline(&self) -> Option<&str> {
        self.active_pipeline
            .as_deref()
            .or_else(|| self.pipelines.keys().next().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_pipeline() -> Config {
        let mut config = Config {
            asterisk: AsteriskConfig {
                password: "secret".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.pipelines.insert(
            "default".to_string(),
            PipelineEntry {
                stt: "deepgram_stt".to_string(),
                llm: "webhook_llm".to_string(),
                tts: "deepgram_tts".to_string(),
                options: PipelineOptions::default(),
            },
        );
        config
    }

    #[test]
    fn validate_rejects_empty_pipelines() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_active_pipeline() {
        let mut config = config_with_pipeline();
        config.active_pipeline = Some("missing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_component_key() {
        let mut config = config_with_pipeline();
        config.pipelines.get_mut("default").unwrap().stt = "deepgram".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_pipeline_prefers_active_then_insertion_order() {
        let mut config = config_with_pipeline();
        config.pipelines.insert(
            "second".to_string(),
            PipelineEntry {
                stt: "local_stt".to_string(),
                llm: "local_llm".to_string(),
                tts: "local_tts".to_string(),
                options: PipelineOptions::default(),
            },
        );
        assert_eq!(config.default_pipeline(), Some("default"));

        config.active_pipeline = Some("second".to_string());
        assert_eq!(config.default_pipeline(), Some("second"));
    }

    #[test]
    fn events_url_carries_app_and_credentials() {
        let asterisk = AsteriskConfig {
            host: "pbx".to_string(),
            port: 8088,
            username: "user".to_string(),
            password: "pw".to_string(),
            app_name: "agent".to_string(),
        };
        assert_eq!(
            asterisk.events_url(),
            "ws://pbx:8088/ari/events?app=agent&api_key=user:pw"
        );
    }

    #[test]
    fn jitter_buffer_chunks_has_floor_of_one() {
        let streaming = StreamingConfig {
            jitter_buffer_ms: 0,
            chunk_size_ms: 20,
            ..Default::default()
        };
        assert_eq!(streaming.jitter_buffer_chunks(), 1);

        let streaming = StreamingConfig {
            jitter_buffer_ms: 50,
            chunk_size_ms: 20,
            ..Default::default()
        };
        assert_eq!(streaming.jitter_buffer_chunks(), 3);
    }
}
