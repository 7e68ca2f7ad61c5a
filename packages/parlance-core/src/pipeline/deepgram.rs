//! Deepgram cloud adapters: WebSocket streaming STT and REST TTS.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use std::sync::Arc;

use super::traits::{AdapterError, AdapterResult, ComponentAdapter, SttAdapter, TtsAdapter};
use crate::audio::{chunk_by_ms, codec, AudioEncoding};
use crate::config::{AdapterOptions, DeepgramProviderConfig};

const DEFAULT_STT_TIMEOUT_SEC: u64 = 5;
const DEFAULT_TTS_TIMEOUT_SEC: u64 = 10;
/// Sample rate we send to / request from Deepgram.
const CLOUD_SAMPLE_RATE: u32 = 16_000;
/// Chunk channel depth; synthesis backpressures beyond this.
const TTS_CHANNEL_DEPTH: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn normalize_ws_url(base: &str) -> String {
    if base.starts_with("ws://") || base.starts_with("wss://") {
        format!("{}/v1/listen", base.trim_end_matches('/'))
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}/v1/listen", rest.trim_end_matches('/'))
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}/v1/listen", rest.trim_end_matches('/'))
    } else {
        format!("wss://{}/v1/listen", base.trim_end_matches('/'))
    }
}

fn normalize_rest_url(base: &str) -> String {
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}/v1/speak", base.trim_end_matches('/'))
    } else {
        format!("https://{}/v1/speak", base.trim_end_matches('/'))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// STT
// ─────────────────────────────────────────────────────────────────────────────

/// Streaming STT over a per-call WebSocket.
///
/// `transcribe` sends one utterance of PCM16 followed by an explicit
/// flush, then waits for the first final non-empty transcript.
pub struct DeepgramStt {
    key: String,
    provider: DeepgramProviderConfig,
    // Arc so callers clone the session out and never hold a map guard
    // across an await.
    sessions: DashMap<String, Arc<Mutex<WsStream>>>,
}

impl DeepgramStt {
    pub fn new(key: impl Into<String>, provider: DeepgramProviderConfig) -> Self {
        Self {
            key: key.into(),
            provider,
            sessions: DashMap::new(),
        }
    }

    fn api_key<'a>(&'a self, options: &'a AdapterOptions) -> AdapterResult<&'a str> {
        let key = options
            .api_key
            .as_deref()
            .unwrap_or(self.provider.api_key.as_str());
        if key.is_empty() {
            return Err(AdapterError::Refused(
                "Deepgram STT requires an API key".to_string(),
            ));
        }
        Ok(key)
    }

    fn build_url(&self, options: &AdapterOptions) -> String {
        let base = options
            .base_url
            .as_deref()
            .unwrap_or(self.provider.base_url.as_str());
        let model = options
            .model
            .as_deref()
            .unwrap_or(self.provider.model.as_str());
        let sample_rate = options.sample_rate.unwrap_or(CLOUD_SAMPLE_RATE);
        let mut url = format!(
            "{}?model={}&encoding=linear16&sample_rate={}&smart_format=true",
            normalize_ws_url(base),
            model,
            sample_rate
        );
        if let Some(language) = &options.language {
            url.push_str("&language=");
            url.push_str(language);
        }
        url
    }

    /// Extracts a final, non-empty transcript from one server message.
    fn extract_transcript(text: &str) -> Option<String> {
        let payload: serde_json::Value = serde_json::from_str(text).ok()?;
        if !payload.get("is_final").and_then(|v| v.as_bool()).unwrap_or(true) {
            return None;
        }
        let transcript = payload
            .get("channel")?
            .get("alternatives")?
            .get(0)?
            .get("transcript")?
            .as_str()?;
        if transcript.is_empty() {
            return None;
        }
        Some(transcript.to_string())
    }
}

#[async_trait]
impl ComponentAdapter for DeepgramStt {
    fn key(&self) -> &str {
        &self.key
    }

    async fn open_call(&self, call_id: &str, options: &AdapterOptions) -> AdapterResult<()> {
        let api_key = self.api_key(options)?.to_string();
        let url = self.build_url(options);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AdapterError::Protocol(format!("bad STT url: {}", e)))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", api_key))
                .map_err(|e| AdapterError::Protocol(e.to_string()))?,
        );

        log::info!("[Deepgram] STT session opening for call {}", call_id);
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| AdapterError::Refused(format!("STT connect failed: {}", e)))?;

        self.sessions
            .insert(call_id.to_string(), Arc::new(Mutex::new(ws)));
        Ok(())
    }

    async fn close_call(&self, call_id: &str) -> AdapterResult<()> {
        if let Some((_, ws)) = self.sessions.remove(call_id) {
            let mut ws = ws.lock().await;
            let _ = ws.close(None).await;
            log::info!("[Deepgram] STT session closed for call {}", call_id);
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
}

#[async_trait]
impl SttAdapter for DeepgramStt {
    async fn transcribe(
        &self,
        call_id: &str,
        pcm16_audio: &[u8],
        sample_rate: u32,
        options: &AdapterOptions,
    ) -> AdapterResult<String> {
        let timeout_sec = options.timeout_sec(DEFAULT_STT_TIMEOUT_SEC);
        let session = self
            .sessions
            .get(call_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| AdapterError::Closed(format!("no STT session for {}", call_id)))?;
        let mut ws = session.lock().await;

        log::debug!(
            "[Deepgram] STT sending {} bytes at {} Hz for call {}",
            pcm16_audio.len(),
            sample_rate,
            call_id
        );

        ws.send(Message::Binary(pcm16_audio.to_vec()))
            .await
            .map_err(|e| AdapterError::Closed(e.to_string()))?;
        ws.send(Message::Text(r#"{"type":"flush"}"#.to_string()))
            .await
            .map_err(|e| AdapterError::Closed(e.to_string()))?;

        let wait = async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(transcript) = Self::extract_transcript(&text) {
                            return Ok(transcript);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(AdapterError::Closed("STT socket closed".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(AdapterError::Closed(e.to_string())),
                }
            }
            Err(AdapterError::Closed("STT stream ended".to_string()))
        };

        match tokio::time::timeout(Duration::from_secs(timeout_sec), wait).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout_sec)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TTS
// ─────────────────────────────────────────────────────────────────────────────

/// REST TTS: one POST per synthesis, converted to the target encoding and
/// emitted as a finite chunk stream.
pub struct DeepgramTts {
    key: String,
    provider: DeepgramProviderConfig,
    http: Client,
}

impl DeepgramTts {
    pub fn new(key: impl Into<String>, provider: DeepgramProviderConfig) -> Self {
        Self {
            key: key.into(),
            provider,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl ComponentAdapter for DeepgramTts {
    fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl TtsAdapter for DeepgramTts {
    async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        options: &AdapterOptions,
    ) -> AdapterResult<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(TTS_CHANNEL_DEPTH);
        if text.is_empty() {
            return Ok(rx); // closes immediately: empty, finite stream
        }

        let api_key = options
            .api_key
            .as_deref()
            .unwrap_or(self.provider.api_key.as_str());
        if api_key.is_empty() {
            return Err(AdapterError::Refused(
                "Deepgram TTS requires an API key".to_string(),
            ));
        }

        let base = options
            .base_url
            .as_deref()
            .unwrap_or(self.provider.base_url.as_str());
        let model = options
            .voice
            .as_deref()
            .or(options.model.as_deref())
            .unwrap_or(self.provider.tts_model.as_str());
        let timeout_sec = options.timeout_sec(DEFAULT_TTS_TIMEOUT_SEC);
        let target_encoding = options.encoding.unwrap_or(AudioEncoding::Ulaw);
        let target_rate = options.sample_rate.unwrap_or(8000);
        let url = normalize_rest_url(base);

        log::info!(
            "[Deepgram] TTS synthesis for call {}: {} chars via {}",
            call_id,
            text.len(),
            model
        );

        let cloud_rate = CLOUD_SAMPLE_RATE.to_string();
        let response = self
            .http
            .post(&url)
            .query(&[
                ("model", model),
                ("encoding", "linear16"),
                ("sample_rate", cloud_rate.as_str()),
            ])
            .header("Authorization", format!("Token {}", api_key))
            .header("Accept", "audio/*")
            .json(&serde_json::json!({ "text": text }))
            .timeout(Duration::from_secs(timeout_sec))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout(timeout_sec)
                } else {
                    AdapterError::Refused(format!("TTS request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Refused(format!(
                "TTS HTTP {}: {}",
                status, body
            )));
        }

        let raw = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Protocol(format!("TTS body read failed: {}", e)))?;
        if raw.is_empty() {
            return Err(AdapterError::EmptyResponse(self.key.clone()));
        }

        // linear16 @16k from the cloud -> target encoding/rate.
        let mut resampler = codec::Resampler::new();
        let resampled = resampler.resample(&raw, CLOUD_SAMPLE_RATE, target_rate);
        let converted = codec::convert_pcm16_to(&resampled, target_encoding);

        let chunks = chunk_by_ms(&converted, target_encoding, target_rate, 20);
        log::info!(
            "[Deepgram] TTS produced {} bytes ({} chunks) for call {}",
            converted.len(),
            chunks.len(),
            call_id
        );

        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break; // receiver dropped: playback cancelled
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
    fn ws_url_normalization() {
        assert_eq!(
            normalize_ws_url("api.deepgram.com"),
            "wss://api.deepgram.com/v1/listen"
        );
        assert_eq!(
            normalize_ws_url("https://dg.example.com"),
            "wss://dg.example.com/v1/listen"
        );
        assert_eq!(
            normalize_ws_url("ws://127.0.0.1:9000"),
            "ws://127.0.0.1:9000/v1/listen"
        );
    }

    #[test]
    fn rest_url_normalization() {
        assert_eq!(
            normalize_rest_url("api.deepgram.com"),
            "https://api.deepgram.com/v1/speak"
        );
        assert_eq!(
            normalize_rest_url("http://127.0.0.1:9000/"),
            "http://127.0.0.1:9000/v1/speak"
        );
    }

    #[test]
    fn transcript_extraction_requires_final_and_non_empty() {
        let final_msg = r#"{"is_final": true, "channel": {"alternatives": [{"transcript": "hello there"}]}}"#;
        assert_eq!(
            DeepgramStt::extract_transcript(final_msg),
            Some("hello there".to_string())
        );

        let interim = r#"{"is_final": false, "channel": {"alternatives": [{"transcript": "hel"}]}}"#;
        assert_eq!(DeepgramStt::extract_transcript(interim), None);

        let empty = r#"{"is_final": true, "channel": {"alternatives": [{"transcript": ""}]}}"#;
        assert_eq!(DeepgramStt::extract_transcript(empty), None);

        assert_eq!(DeepgramStt::extract_transcript("not json"), None);
    }

    #[test]
    fn stt_url_carries_model_and_rate() {
        let stt = DeepgramStt::new("deepgram_stt", DeepgramProviderConfig::default());
        let url = stt.build_url(&AdapterOptions::default());
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-2"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("encoding=linear16"));
    }
}
