//! Role interfaces for component adapters.
//!
//! All adapters must be safe to call concurrently across different
//! call_ids; within one call the coordinator uses them sequentially.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AdapterOptions;
use crate::session::HistoryEntry;

/// Errors from component adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backend did not answer within the configured timeout.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// The per-call session is gone (closed socket, cancelled call).
    #[error("Session closed: {0}")]
    Closed(String),

    /// The backend sent something outside its protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The backend rejected the request (auth, quota, bad arguments).
    #[error("Backend refused: {0}")]
    Refused(String),

    /// Placeholder adapter invoked for an unimplemented component key.
    #[error("Component '{0}' is not implemented")]
    NotImplemented(String),

    /// The backend answered with nothing usable.
    #[error("Empty response from {0}")]
    EmptyResponse(String),
}

/// Convenient Result alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Process- and call-level lifecycle common to all roles.
#[async_trait]
pub trait ComponentAdapter: Send + Sync {
    /// The `<provider>_<role>` key this instance serves.
    fn key(&self) -> &str;

    /// Process-level warm-up. Most adapters need none.
    async fn start(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Process-level teardown; closes any lingering call sessions.
    async fn stop(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Opens the per-call backend session (e.g. a WebSocket handshake).
    async fn open_call(&self, _call_id: &str, _options: &AdapterOptions) -> AdapterResult<()> {
        Ok(())
    }

    /// Closes the per-call backend session. Idempotent.
    async fn close_call(&self, _call_id: &str) -> AdapterResult<()> {
        Ok(())
    }
}

/// Speech-to-text.
#[async_trait]
pub trait SttAdapter: ComponentAdapter {
    /// Transcribes one utterance of PCM16 audio, returning the final text.
    async fn transcribe(
        &self,
        call_id: &str,
        pcm16_audio: &[u8],
        sample_rate: u32,
        options: &AdapterOptions,
    ) -> AdapterResult<String>;
}

/// Language model.
#[async_trait]
pub trait LlmAdapter: ComponentAdapter {
    /// Generates a reply to `transcript` given the rolling history.
    async fn generate(
        &self,
        call_id: &str,
        transcript: &str,
        history: &[HistoryEntry],
        options: &AdapterOptions,
    ) -> AdapterResult<String>;
}

/// Text-to-speech.
#[async_trait]
pub trait TtsAdapter: ComponentAdapter {
    /// Synthesizes `text` into a finite sequence of audio chunks
    /// (µ-law 8 kHz unless the options say otherwise). The channel closes
    /// at end of stream.
    async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        options: &AdapterOptions,
    ) -> AdapterResult<mpsc::Receiver<Bytes>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Placeholders
// ─────────────────────────────────────────────────────────────────────────────

/// Adapter bound to a component key no concrete implementation serves.
/// Resolving it succeeds; invoking it fails.
pub struct PlaceholderAdapter {
    key: String,
}

impl PlaceholderAdapter {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl ComponentAdapter for PlaceholderAdapter {
    fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl SttAdapter for PlaceholderAdapter {
    async fn transcribe(
        &self,
        _call_id: &str,
        _pcm16_audio: &[u8],
        _sample_rate: u32,
        _options: &AdapterOptions,
    ) -> AdapterResult<String> {
        Err(AdapterError::NotImplemented(self.key.clone()))
    }
}

#[async_trait]
impl LlmAdapter for PlaceholderAdapter {
    async fn generate(
        &self,
        _call_id: &str,
        _transcript: &str,
        _history: &[HistoryEntry],
        _options: &AdapterOptions,
    ) -> AdapterResult<String> {
        Err(AdapterError::NotImplemented(self.key.clone()))
    }
}

#[async_trait]
impl TtsAdapter for PlaceholderAdapter {
    async fn synthesize(
        &self,
        _call_id: &str,
        _text: &str,
        _options: &AdapterOptions,
    ) -> AdapterResult<mpsc::Receiver<Bytes>> {
        Err(AdapterError::NotImplemented(self.key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_resolves_but_refuses_invocation() {
        let adapter = PlaceholderAdapter::new("acme_stt");
        assert_eq!(adapter.key(), "acme_stt");
        assert!(adapter.open_call("c1", &AdapterOptions::default()).await.is_ok());

        let err = adapter
            .transcribe("c1", &[], 16000, &AdapterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotImplemented(_)));
    }
}
