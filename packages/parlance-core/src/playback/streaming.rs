//! Streaming playback: low-latency chunked TTS with a file-based safety net.
//!
//! Chunks arrive µ-law 8 kHz on a bounded channel that closes at end of
//! stream. The streaming loop feeds them through a jitter buffer to the
//! media transport, transcoding per transport; a keepalive loop watches
//! for dead upstreams. Any stall, transport failure or timeout hands the
//! remaining buffered audio to the file-based manager.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::manager::PlaybackManager;
use super::TtsGate;
use crate::audio::{codec, AudioEncoding};
use crate::config::StreamingConfig;
use crate::error::{ParlanceError, ParlanceResult};
use crate::metrics::Metrics;
use crate::session::types::now_ms;
use crate::session::SessionStore;
use crate::transport::MediaTransport;

struct ActiveStream {
    stream_id: String,
    /// Cancels both loops; used by stop/barge-in and session teardown.
    cancel: CancellationToken,
    /// Raised by the keepalive loop when the upstream goes quiet.
    keepalive_timeout: CancellationToken,
    last_chunk_at: Arc<Mutex<Instant>>,
    started_at: Instant,
}

/// Manages chunked streaming playback with automatic file fallback.
pub struct StreamingPlaybackManager {
    store: Arc<SessionStore>,
    transport: Arc<dyn MediaTransport>,
    fallback: Arc<PlaybackManager>,
    config: StreamingConfig,
    metrics: Arc<Metrics>,
    gate: parking_lot::RwLock<Option<Arc<dyn TtsGate>>>,
    streams: DashMap<String, ActiveStream>,
}

impl StreamingPlaybackManager {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn MediaTransport>,
        fallback: Arc<PlaybackManager>,
        config: StreamingConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            transport,
            fallback,
            config,
            metrics,
            gate: parking_lot::RwLock::new(None),
            streams: DashMap::new(),
        }
    }

    /// Injects the coordinator-backed gate. Called once during bootstrap.
    pub fn set_gate(&self, gate: Arc<dyn TtsGate>) {
        *self.gate.write() = Some(gate);
    }

    async fn gate_start(&self, call_id: &str, token: &str) -> bool {
        let gate = self.gate.read().clone();
        match gate {
            Some(gate) => gate.on_tts_start(call_id, token).await,
            None => self.store.set_gating_token(call_id, token),
        }
    }

    async fn gate_end(&self, call_id: &str, token: &str, reason: &str) {
        let gate = self.gate.read().clone();
        match gate {
            Some(gate) => gate.on_tts_end(call_id, token, reason).await,
            None => {
                self.store.clear_gating_token(call_id, token);
            }
        }
    }

    /// Starts streaming `chunks` (µ-law 8 kHz) to the caller.
    ///
    /// Returns the deterministic stream id. The chunk channel closing is
    /// the normal end of stream.
    pub async fn start_streaming(
        self: &Arc<Self>,
        call_id: &str,
        chunks: mpsc::Receiver<Bytes>,
        playback_type: &str,
    ) -> ParlanceResult<String> {
        if self.store.get_by_call_id(call_id).is_none() {
            return Err(ParlanceError::CallNotFound(call_id.to_string()));
        }

        // A new response replaces any stream still running for the call.
        if let Some(existing) = self.streams.get(call_id) {
            log::warn!(
                "[Streaming] Call {} already streaming {}; cancelling it",
                call_id,
                existing.stream_id
            );
            existing.cancel.cancel();
            drop(existing);
        }

        let stream_id = format!("stream:{}:{}:{}", playback_type, call_id, now_ms());

        if !self.gate_start(call_id, &stream_id).await {
            return Err(ParlanceError::Playback(format!(
                "gating failed for call {}",
                call_id
            )));
        }

        let cancel = CancellationToken::new();
        let keepalive_timeout = CancellationToken::new();
        let last_chunk_at = Arc::new(Mutex::new(Instant::now()));

        self.streams.insert(
            call_id.to_string(),
            ActiveStream {
                stream_id: stream_id.clone(),
                cancel: cancel.clone(),
                keepalive_timeout: keepalive_timeout.clone(),
                last_chunk_at: Arc::clone(&last_chunk_at),
                started_at: Instant::now(),
            },
        );

        self.metrics
            .streaming_active
            .with_label_values(&[call_id])
            .set(1);
        self.store.with_session_mut(call_id, |s| {
            s.streaming.started = true;
            s.streaming.current_stream_id = Some(stream_id.clone());
        });

        log::info!(
            "[Streaming] Started {} for call {} ({} chunk jitter buffer)",
            stream_id,
            call_id,
            self.config.jitter_buffer_chunks()
        );

        tokio::spawn(Arc::clone(self).streaming_loop(
            call_id.to_string(),
            stream_id.clone(),
            chunks,
            cancel.clone(),
            keepalive_timeout.clone(),
            Arc::clone(&last_chunk_at),
        ));
        tokio::spawn(Arc::clone(self).keepalive_loop(
            call_id.to_string(),
            stream_id.clone(),
            cancel,
            keepalive_timeout,
            last_chunk_at,
        ));

        Ok(stream_id)
    }

    /// Stops the call's active stream (barge-in, teardown). The streaming
    /// loop performs the cleanup.
    pub fn stop_streaming(&self, call_id: &str) -> bool {
        match self.streams.get(call_id) {
            Some(stream) => {
                log::info!(
                    "[Streaming] Stopping {} for call {}",
                    stream.stream_id,
                    call_id
                );
                stream.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a stream is active for the call.
    pub fn is_streaming(&self, call_id: &str) -> bool {
        self.streams.contains_key(call_id)
    }

    /// Cancels streams older than `max_age`. Returns how many were hit.
    pub fn cleanup_expired_streams(&self, max_age: Duration) -> usize {
        let expired: Vec<String> = self
            .streams
            .iter()
            .filter(|r| r.value().started_at.elapsed() > max_age)
            .map(|r| r.key().clone())
            .collect();
        for call_id in &expired {
            log::info!("[Streaming] Expiring stale stream for call {}", call_id);
            self.stop_streaming(call_id);
        }
        expired.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loops
    // ─────────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn streaming_loop(
        self: Arc<Self>,
        call_id: String,
        stream_id: String,
        mut chunks: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        keepalive_timeout: CancellationToken,
        last_chunk_at: Arc<Mutex<Instant>>,
    ) {
        let fallback_timeout = Duration::from_millis(self.config.fallback_timeout_ms.max(1));
        let chunk_pace = Duration::from_millis(self.config.chunk_size_ms.max(1));
        let jitter_capacity = self.config.jitter_buffer_chunks();
        let mut jitter: VecDeque<Bytes> = VecDeque::with_capacity(jitter_capacity);

        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break "cancelled",
                _ = keepalive_timeout.cancelled() => {
                    self.record_fallback(&call_id, "keepalive-timeout").await;
                    self.fallback_to_file(&call_id, &stream_id, &mut jitter).await;
                    break "keepalive-timeout";
                }
                next = tokio::time::timeout(fallback_timeout, chunks.recv()) => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    *last_chunk_at.lock() = Instant::now();
                    self.metrics
                        .streaming_bytes_total
                        .with_label_values(&[&call_id])
                        .inc_by(chunk.len() as u64);
                    self.metrics
                        .streaming_last_chunk_age_seconds
                        .with_label_values(&[&call_id])
                        .set(0.0);
                    self.store.with_session_mut(&call_id, |s| {
                        s.streaming.bytes_queued += chunk.len() as u64;
                        s.streaming.jitter_buffer_depth = jitter.len() + 1;
                    });

                    jitter.push_back(chunk);
                    self.metrics
                        .streaming_jitter_buffer_depth
                        .with_label_values(&[&call_id])
                        .set(jitter.len() as i64);

                    if !self.drain_jitter(&call_id, &mut jitter, chunk_pace, &cancel).await {
                        self.record_fallback(&call_id, "transport-failure").await;
                        self.fallback_to_file(&call_id, &stream_id, &mut jitter).await;
                        break "transport-failure";
                    }
                }
                Ok(None) => {
                    // End of stream: flush whatever is buffered.
                    let _ = self.drain_jitter(&call_id, &mut jitter, chunk_pace, &cancel).await;
                    break "end-of-stream";
                }
                Err(_) => {
                    self.record_fallback(&call_id, "chunk-timeout").await;
                    self.fallback_to_file(&call_id, &stream_id, &mut jitter).await;
                    break "chunk-timeout";
                }
            }
        };

        self.cleanup_stream(&call_id, &stream_id, reason).await;
    }

    /// Sends everything in the jitter buffer, paced at chunk cadence.
    /// Returns false on the first transport failure.
    async fn drain_jitter(
        &self,
        call_id: &str,
        jitter: &mut VecDeque<Bytes>,
        pace: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        while let Some(chunk) = jitter.pop_front() {
            if cancel.is_cancelled() {
                return true;
            }

            // Chunks are µ-law 8 kHz; AudioSocket wants PCM16, RTP takes
            // µ-law through untouched.
            let wire: Bytes = match self.transport.outbound_encoding() {
                AudioEncoding::Pcm16 => Bytes::from(codec::ulaw_to_pcm16(&chunk)),
                _ => chunk,
            };

            if !self.transport.send(call_id, &wire).await {
                return false;
            }

            self.metrics
                .streaming_jitter_buffer_depth
                .with_label_values(&[call_id])
                .set(jitter.len() as i64);

            // Hold the 50 packets/s cadence the PBX expects.
            tokio::time::sleep(pace).await;
        }
        true
    }

    async fn keepalive_loop(
        self: Arc<Self>,
        call_id: String,
        stream_id: String,
        cancel: CancellationToken,
        keepalive_timeout: CancellationToken,
        last_chunk_at: Arc<Mutex<Instant>>,
    ) {
        let interval = Duration::from_millis(self.config.keepalive_interval_ms.max(1));
        let connection_timeout = Duration::from_millis(self.config.connection_timeout_ms.max(1));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let age = last_chunk_at.lock().elapsed();
            self.metrics
                .streaming_last_chunk_age_seconds
                .with_label_values(&[&call_id])
                .set(age.as_secs_f64());
            self.metrics
                .streaming_keepalives_sent_total
                .with_label_values(&[&call_id])
                .inc();
            self.store.with_session_mut(&call_id, |s| {
                s.streaming.keepalives_sent += 1;
            });

            if age > connection_timeout {
                log::warn!(
                    "[Streaming] Keepalive timeout on {} for call {} ({}s since last chunk)",
                    stream_id,
                    call_id,
                    age.as_secs()
                );
                self.metrics
                    .streaming_keepalive_timeouts_total
                    .with_label_values(&[&call_id])
                    .inc();
                self.store.with_session_mut(&call_id, |s| {
                    s.streaming.keepalive_timeouts += 1;
                    s.streaming.last_error =
                        Some(format!("keepalive-timeout>{}s", age.as_secs()));
                });
                keepalive_timeout.cancel();
                return;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fallback & cleanup
    // ─────────────────────────────────────────────────────────────────────────

    async fn record_fallback(&self, call_id: &str, reason: &str) {
        self.metrics
            .streaming_fallbacks_total
            .with_label_values(&[call_id])
            .inc();
        self.store.with_session_mut(call_id, |s| {
            s.streaming.fallback_count += 1;
            s.streaming.last_error = Some(reason.to_string());
        });
        log::warn!("[Streaming] Fallback for call {}: {}", call_id, reason);
    }

    /// Concatenates whatever is still buffered and plays it as a file.
    async fn fallback_to_file(
        &self,
        call_id: &str,
        stream_id: &str,
        jitter: &mut VecDeque<Bytes>,
    ) {
        let remaining: Vec<u8> = jitter.drain(..).flatten().collect();
        if remaining.is_empty() {
            return;
        }

        match self
            .fallback
            .play_audio(call_id, &remaining, "streaming-fallback")
            .await
        {
            Ok(fallback_id) => {
                log::info!(
                    "[Streaming] {} fell back to file playback {} ({} bytes)",
                    stream_id,
                    fallback_id,
                    remaining.len()
                );
            }
            Err(e) => {
                log::error!(
                    "[Streaming] File fallback failed for call {}: {}",
                    call_id,
                    e
                );
            }
        }
    }

    /// Runs exactly once per stream, at the end of the streaming loop.
    async fn cleanup_stream(&self, call_id: &str, stream_id: &str, reason: &str) {
        // Only remove the entry if it still belongs to this stream; a
        // replacement stream may already be registered.
        self.streams
            .remove_if(call_id, |_, s| s.stream_id == stream_id);

        self.gate_end(call_id, stream_id, reason).await;

        // A replacement stream may already be running; only zero the
        // gauge when the call has no stream left.
        if !self.streams.contains_key(call_id) {
            self.metrics
                .streaming_active
                .with_label_values(&[call_id])
                .set(0);
        }
        self.metrics
            .streaming_jitter_buffer_depth
            .with_label_values(&[call_id])
            .set(0);
        self.metrics
            .streaming_last_chunk_age_seconds
            .with_label_values(&[call_id])
            .set(0.0);

        self.store.with_session_mut(call_id, |s| {
            if s.streaming.current_stream_id.as_deref() == Some(stream_id) {
                s.streaming.started = false;
                s.streaming.current_stream_id = None;
                s.streaming.jitter_buffer_depth = 0;
            }
        });

        log::info!(
            "[Streaming] Cleaned up {} for call {} ({})",
            stream_id,
            call_id,
            reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ari::AriClient;
    use crate::config::AsteriskConfig;
    use crate::session::CallSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport stub recording everything sent to it.
    struct StubTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        healthy: AtomicBool,
        encoding: AudioEncoding,
    }

    impl StubTransport {
        fn new(encoding: AudioEncoding) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                healthy: AtomicBool::new(true),
                encoding,
            })
        }
    }

    #[async_trait]
    impl MediaTransport for StubTransport {
        async fn send(&self, _call_id: &str, audio: &[u8]) -> bool {
            if !self.healthy.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(audio.to_vec());
            true
        }
        fn unregister(&self, _call_id: &str) {}
        fn outbound_encoding(&self) -> AudioEncoding {
            self.encoding
        }
    }

    fn fast_config() -> StreamingConfig {
        StreamingConfig {
            sample_rate: 8000,
            jitter_buffer_ms: 20,
            keepalive_interval_ms: 20,
            connection_timeout_ms: 100,
            fallback_timeout_ms: 80,
            chunk_size_ms: 1,
        }
    }

    fn build_manager(
        transport: Arc<dyn MediaTransport>,
        config: StreamingConfig,
    ) -> (Arc<StreamingPlaybackManager>, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new());
        store.upsert(CallSession::new("c1", "default"));
        let ari = Arc::new(AriClient::new(&AsteriskConfig::default()));
        // Leaked so the directory outlives the manager for the test's life.
        let media_dir = Box::leak(Box::new(tempfile::tempdir().unwrap()))
            .path()
            .to_path_buf();
        let fallback = Arc::new(PlaybackManager::new(
            Arc::clone(&store),
            ari,
            media_dir,
        ));
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(StreamingPlaybackManager::new(
            Arc::clone(&store),
            transport,
            fallback,
            config,
            metrics,
        ));
        (manager, store)
    }

    #[tokio::test]
    async fn stream_sends_chunks_and_cleans_up_on_close() {
        let transport = StubTransport::new(AudioEncoding::Ulaw);
        let (manager, store) = build_manager(transport.clone(), fast_config());

        let (tx, rx) = mpsc::channel(8);
        let stream_id = manager.start_streaming("c1", rx, "response").await.unwrap();
        assert!(stream_id.starts_with("stream:response:c1:"));
        assert!(store.get_by_call_id("c1").unwrap().tts_playing);

        tx.send(Bytes::from(vec![0xFFu8; 160])).await.unwrap();
        tx.send(Bytes::from(vec![0xFFu8; 160])).await.unwrap();
        drop(tx); // end of stream

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_streaming("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stream should end");

        assert_eq!(transport.sent.lock().len(), 2);
        let session = store.get_by_call_id("c1").unwrap();
        assert!(!session.tts_playing, "gating cleared after end of stream");
        assert!(session.audio_capture_enabled);
        assert_eq!(session.streaming.bytes_queued, 320);
    }

    #[tokio::test]
    async fn audiosocket_path_transcodes_to_pcm16() {
        let transport = StubTransport::new(AudioEncoding::Pcm16);
        let (manager, _store) = build_manager(transport.clone(), fast_config());

        let (tx, rx) = mpsc::channel(8);
        manager.start_streaming("c1", rx, "response").await.unwrap();
        tx.send(Bytes::from(vec![0xFFu8; 160])).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_streaming("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        // µ-law 160 bytes -> PCM16 320 bytes.
        assert_eq!(sent[0].len(), 320);
    }

    #[tokio::test]
    async fn stalled_stream_records_fallback_and_clears_gating() {
        let transport = StubTransport::new(AudioEncoding::Ulaw);
        let (manager, store) = build_manager(transport, fast_config());

        let (tx, rx) = mpsc::channel(8);
        manager.start_streaming("c1", rx, "response").await.unwrap();
        // Send nothing: the loop must hit the fallback timeout.

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_streaming("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(tx);

        let session = store.get_by_call_id("c1").unwrap();
        assert_eq!(session.streaming.fallback_count, 1);
        assert!(!session.tts_playing);
        assert_eq!(session.streaming.last_error.as_deref(), Some("chunk-timeout"));
    }

    #[tokio::test]
    async fn transport_failure_triggers_fallback() {
        let transport = StubTransport::new(AudioEncoding::Ulaw);
        transport.healthy.store(false, Ordering::SeqCst);
        let (manager, store) = build_manager(transport, fast_config());

        let (tx, rx) = mpsc::channel(8);
        manager.start_streaming("c1", rx, "response").await.unwrap();
        tx.send(Bytes::from(vec![0u8; 160])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_streaming("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(tx);

        let session = store.get_by_call_id("c1").unwrap();
        assert_eq!(session.streaming.fallback_count, 1);
        assert_eq!(
            session.streaming.last_error.as_deref(),
            Some("transport-failure")
        );
    }

    #[tokio::test]
    async fn stop_streaming_cancels_without_fallback() {
        let transport = StubTransport::new(AudioEncoding::Ulaw);
        let (manager, store) = build_manager(transport, fast_config());

        let (tx, rx) = mpsc::channel(8);
        manager.start_streaming("c1", rx, "response").await.unwrap();
        assert!(manager.stop_streaming("c1"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_streaming("c1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(tx);

        let session = store.get_by_call_id("c1").unwrap();
        assert_eq!(session.streaming.fallback_count, 0);
        assert!(!session.tts_playing);
    }

    #[tokio::test]
    async fn missing_session_fails_to_start() {
        let transport = StubTransport::new(AudioEncoding::Ulaw);
        let (manager, _store) = build_manager(transport, fast_config());
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        assert!(manager.start_streaming("ghost", rx, "response").await.is_err());
    }
}
