//! Configurable STT/LLM/TTS pipelines.
//!
//! A pipeline names three component adapters by `<provider>_<role>` key.
//! The orchestrator resolves keys to adapter instances per call; adapters
//! implement the role traits in `traits` against concrete backends.

pub mod deepgram;
pub mod local;
pub mod orchestrator;
pub mod traits;
pub mod webhook;

pub use orchestrator::{PipelineOrchestrator, PipelineResolution};
pub use traits::{
    AdapterError, AdapterResult, ComponentAdapter, LlmAdapter, SttAdapter, TtsAdapter,
};

/// The three adapter roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Stt,
    Llm,
    Tts,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }
}

/// Splits a component key into (provider, role).
///
/// Keys are `<provider>_<role>`; the provider part may itself contain
/// underscores, so the split is on the last one.
pub fn split_component_key(key: &str) -> Option<(&str, Role)> {
    let (provider, role) = key.rsplit_once('_')?;
    let role = match role {
        "stt" => Role::Stt,
        "llm" => Role::Llm,
        "tts" => Role::Tts,
        _ => return None,
    };
    Some((provider, role))
}
