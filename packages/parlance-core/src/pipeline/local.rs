//! Adapters for the local multi-role AI server.
//!
//! One WebSocket per call per role. The server multiplexes STT, LLM and
//! TTS behind a mode handshake: `open_call` sends `set_mode` and waits
//! (best-effort) for `mode_ready`; the role adapters differ only in mode
//! and message schema. Audio travels base64-encoded in JSON or as raw
//! binary frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::traits::{AdapterError, AdapterResult, ComponentAdapter, LlmAdapter, SttAdapter, TtsAdapter};
use crate::audio::{chunk_by_ms, AudioEncoding};
use crate::config::{AdapterOptions, LocalProviderConfig};
use crate::session::HistoryEntry;

const DEFAULT_TIMEOUT_SEC: u64 = 5;
const TTS_DEFAULT_TIMEOUT_SEC: u64 = 8;
/// How long to wait for `mode_ready` before proceeding without it.
const MODE_READY_TIMEOUT_MS: u64 = 2000;
const TTS_CHANNEL_DEPTH: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Shared per-call session handling for all three roles.
struct LocalAdapterCore {
    key: String,
    mode: &'static str,
    provider: LocalProviderConfig,
    // Arc so callers clone the session out and never hold a map guard
    // across an await.
    sessions: DashMap<String, Arc<Mutex<WsStream>>>,
}

impl LocalAdapterCore {
    fn new(key: impl Into<String>, mode: &'static str, provider: LocalProviderConfig) -> Self {
        Self {
            key: key.into(),
            mode,
            provider,
            sessions: DashMap::new(),
        }
    }

    async fn open_call(&self, call_id: &str, options: &AdapterOptions) -> AdapterResult<()> {
        let url = options
            .base_url
            .as_deref()
            .unwrap_or(self.provider.ws_url.as_str());

        log::info!(
            "[Local] {} opening session for call {} via {}",
            self.key,
            call_id,
            url
        );
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| AdapterError::Refused(format!("local connect failed: {}", e)))?;

        let handshake = serde_json::json!({
            "type": "set_mode",
            "mode": self.mode,
            "call_id": call_id,
        });
        ws.send(Message::Text(handshake.to_string()))
            .await
            .map_err(|e| AdapterError::Closed(e.to_string()))?;

        // Best-effort: older servers never send mode_ready.
        let ready = tokio::time::timeout(Duration::from_millis(MODE_READY_TIMEOUT_MS), async {
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) {
                    if payload.get("type").and_then(|t| t.as_str()) == Some("mode_ready") {
                        return true;
                    }
                }
            }
            false
        })
        .await;
        if !matches!(ready, Ok(true)) {
            log::warn!(
                "[Local] {} handshake not confirmed for call {}; proceeding without mode_ready",
                self.key,
                call_id
            );
        }

        self.sessions
            .insert(call_id.to_string(), Arc::new(Mutex::new(ws)));
        Ok(())
    }

    async fn close_call(&self, call_id: &str) -> AdapterResult<()> {
        if let Some((_, ws)) = self.sessions.remove(call_id) {
            let mut ws = ws.lock().await;
            let _ = ws.close(None).await;
            log::info!("[Local] {} session closed for call {}", self.key, call_id);
        }
        Ok(())
    }

    async fn stop(&self) -> AdapterResult<()> {
        let call_ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for call_id in call_ids {
            let _ = self.close_call(&call_id).await;
        }
        Ok(())
    }

    /// Sends one JSON request and waits for the first message satisfying
    /// `pick`, bounded by `timeout_sec`.
    async fn round_trip<T>(
        &self,
        call_id: &str,
        request: serde_json::Value,
        timeout_sec: u64,
        mut pick: impl FnMut(WsReply<'_>) -> Option<T> + Send,
    ) -> AdapterResult<T> {
        let session = self
            .sessions
            .get(call_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| AdapterError::Closed(format!("no {} session for {}", self.key, call_id)))?;
        let mut ws = session.lock().await;

        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| AdapterError::Closed(e.to_string()))?;

        let wait = async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) {
                            if let Some(value) = pick(WsReply::Json(&payload)) {
                                return Ok(value);
                            }
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Some(value) = pick(WsReply::Binary(&data)) {
                            return Ok(value);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(AdapterError::Closed("local socket closed".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(AdapterError::Closed(e.to_string())),
                }
            }
            Err(AdapterError::Closed("local stream ended".to_string()))
        };

        match tokio::time::timeout(Duration::from_secs(timeout_sec), wait).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout_sec)),
        }
    }
}

/// One message from the local server, JSON or binary.
enum WsReply<'a> {
    Json(&'a serde_json::Value),
    Binary(&'a [u8]),
}

// ─────────────────────────────────────────────────────────────────────────────
// Role adapters
// ─────────────────────────────────────────────────────────────────────────────

/// STT against the local AI server.
pub struct LocalStt {
    core: LocalAdapterCore,
}

impl LocalStt {
    pub fn new(key: impl Into<String>, provider: LocalProviderConfig) -> Self {
        Self {
            core: LocalAdapterCore::new(key, "stt", provider),
        }
    }
}

#[async_trait]
impl ComponentAdapter for LocalStt {
    fn key(&self) -> &str {
        &self.core.key
    }
    async fn open_call(&self, call_id: &str, options: &AdapterOptions) -> AdapterResult<()> {
        self.core.open_call(call_id, options).await
    }
    async fn close_call(&self, call_id: &str) -> AdapterResult<()> {
        self.core.close_call(call_id).await
    }
    async fn stop(&self) -> AdapterResult<()> {
        self.core.stop().await
    }
}

#[async_trait]
impl SttAdapter for LocalStt {
    async fn transcribe(
        &self,
        call_id: &str,
        pcm16_audio: &[u8],
        sample_rate: u32,
        options: &AdapterOptions,
    ) -> AdapterResult<String> {
        let request = serde_json::json!({
            "type": "audio",
            "mode": "stt",
            "call_id": call_id,
            "rate": sample_rate,
            "data": b64().encode(pcm16_audio),
        });
        let timeout = options.timeout_sec(DEFAULT_TIMEOUT_SEC);

        self.core
            .round_trip(call_id, request, timeout, |reply| match reply {
                WsReply::Json(payload)
                    if payload.get("type").and_then(|t| t.as_str()) == Some("stt_result") =>
                {
                    Some(
                        payload
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    )
                }
                _ => None,
            })
            .await
    }
}

/// LLM against the local AI server.
pub struct LocalLlm {
    core: LocalAdapterCore,
}

impl LocalLlm {
    pub fn new(key: impl Into<String>, provider: LocalProviderConfig) -> Self {
        Self {
            core: LocalAdapterCore::new(key, "llm", provider),
        }
    }
}

#[async_trait]
impl ComponentAdapter for LocalLlm {
    fn key(&self) -> &str {
        &self.core.key
    }
    async fn open_call(&self, call_id: &str, options: &AdapterOptions) -> AdapterResult<()> {
        self.core.open_call(call_id, options).await
    }
    async fn close_call(&self, call_id: &str) -> AdapterResult<()> {
        self.core.close_call(call_id).await
    }
    async fn stop(&self) -> AdapterResult<()> {
        self.core.stop().await
    }
}

#[async_trait]
impl LlmAdapter for LocalLlm {
    async fn generate(
        &self,
        call_id: &str,
        transcript: &str,
        history: &[HistoryEntry],
        options: &AdapterOptions,
    ) -> AdapterResult<String> {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "role": match entry.role {
                        crate::session::ConversationRole::System => "system",
                        crate::session::ConversationRole::User => "user",
                        crate::session::ConversationRole::Assistant => "assistant",
                    },
                    "content": entry.content,
                })
            })
            .collect();

        let request = serde_json::json!({
            "type": "llm_request",
            "mode": "llm",
            "call_id": call_id,
            "text": transcript,
            "context": messages,
        });
        let timeout = options.timeout_sec(DEFAULT_TIMEOUT_SEC);

        self.core
            .round_trip(call_id, request, timeout, |reply| match reply {
                WsReply::Json(payload)
                    if payload.get("type").and_then(|t| t.as_str()) == Some("llm_response") =>
                {
                    Some(
                        payload
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    )
                }
                _ => None,
            })
            .await
    }
}

/// TTS against the local AI server.
pub struct LocalTts {
    core: LocalAdapterCore,
}

impl LocalTts {
    pub fn new(key: impl Into<String>, provider: LocalProviderConfig) -> Self {
        Self {
            core: LocalAdapterCore::new(key, "tts", provider),
        }
    }
}

#[async_trait]
impl ComponentAdapter for LocalTts {
    fn key(&self) -> &str {
        &self.core.key
    }
    async fn open_call(&self, call_id: &str, options: &AdapterOptions) -> AdapterResult<()> {
        self.core.open_call(call_id, options).await
    }
    async fn close_call(&self, call_id: &str) -> AdapterResult<()> {
        self.core.close_call(call_id).await
    }
    async fn stop(&self) -> AdapterResult<()> {
        self.core.stop().await
    }
}

#[async_trait]
impl TtsAdapter for LocalTts {
    async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        options: &AdapterOptions,
    ) -> AdapterResult<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(TTS_CHANNEL_DEPTH);
        if text.is_empty() {
            return Ok(rx);
        }

        let request = serde_json::json!({
            "type": "tts_request",
            "mode": "tts",
            "call_id": call_id,
            "text": text,
        });
        let timeout = options.timeout_sec(TTS_DEFAULT_TIMEOUT_SEC);
        let encoding = options.encoding.unwrap_or(AudioEncoding::Ulaw);
        let sample_rate = options.sample_rate.unwrap_or(8000);

        // The local server answers with a single audio payload: either a
        // base64 `tts_response` or one binary frame.
        let audio = self
            .core
            .round_trip(call_id, request, timeout, |reply| match reply {
                WsReply::Json(payload)
                    if payload.get("type").and_then(|t| t.as_str()) == Some("tts_response") =>
                {
                    payload
                        .get("audio_data")
                        .and_then(|d| d.as_str())
                        .and_then(|d| b64().decode(d).ok())
                }
                WsReply::Binary(data) => Some(data.to_vec()),
                _ => None,
            })
            .await?;

        if audio.is_empty() {
            return Err(AdapterError::EmptyResponse(self.core.key.clone()));
        }

        let chunks = chunk_by_ms(&audio, encoding, sample_rate, 20);
        log::info!(
            "[Local] TTS produced {} bytes ({} chunks) for call {}",
            audio.len(),
            chunks.len(),
            call_id
        );

        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip_matches_wire_format() {
        let audio = vec![1u8, 2, 3, 255];
        let encoded = b64().encode(&audio);
        assert_eq!(b64().decode(encoded).unwrap(), audio);
    }
}
