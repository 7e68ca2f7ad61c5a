//! Conversation coordinator: the per-call turn-taking state machine.
//!
//! Each call gets one task consuming typed events from the inbound pump
//! and the playback managers. The task owns the greeting → listening →
//! processing → speaking cycle, wires utterances through STT → LLM → TTS,
//! and handles barge-in. Playback managers reach the coordinator only
//! through the [`TtsGate`] capability; the coordinator never reaches back
//! into the engine.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ari::AriClient;
use crate::audio::{codec, Utterance};
use crate::config::{Config, DownstreamMode};
use crate::pipeline::{AdapterError, PipelineOrchestrator};
use crate::playback::{PlaybackManager, StreamingPlaybackManager, TtsGate};
use crate::session::{ConversationRole, ConversationState, SessionStore};

/// Events a call's coordinator task consumes.
#[derive(Debug)]
pub enum CoordEvent {
    /// A complete caller utterance (PCM16 at the pump's rate).
    Utterance(Utterance),
    /// The last TTS gating token cleared; the agent finished speaking.
    TtsIdle,
    /// Sustained caller speech detected while the agent was speaking.
    BargeIn,
    /// The engine is tearing the call down.
    Hangup,
}

/// Sample rate the pump delivers utterances at.
pub const PUMP_SAMPLE_RATE: u32 = 16_000;
/// Per-call event queue depth.
const EVENT_QUEUE: usize = 32;
/// Collecting a file-mode synthesis is bounded by this many seconds.
const FILE_COLLECT_TIMEOUT_SEC: u64 = 30;

struct CallHandle {
    tx: mpsc::Sender<CoordEvent>,
    cancel: CancellationToken,
}

/// Creates and drives per-call conversation tasks.
pub struct ConversationCoordinator {
    store: Arc<SessionStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    playback: Arc<PlaybackManager>,
    streaming: Arc<StreamingPlaybackManager>,
    ari: Arc<AriClient>,
    config: Arc<Config>,
    calls: DashMap<String, CallHandle>,
}

impl ConversationCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        orchestrator: Arc<PipelineOrchestrator>,
        playback: Arc<PlaybackManager>,
        streaming: Arc<StreamingPlaybackManager>,
        ari: Arc<AriClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            playback,
            streaming,
            ari,
            config,
            calls: DashMap::new(),
        }
    }

    /// Starts the conversation for a fully set-up call: idle → greeting.
    pub fn start_call(self: &Arc<Self>, call_id: &str) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        self.calls.insert(
            call_id.to_string(),
            CallHandle {
                tx,
                cancel: cancel.clone(),
            },
        );

        log::info!("[Coordinator] Starting conversation for call {}", call_id);
        tokio::spawn(Arc::clone(self).run_call(call_id.to_string(), rx, cancel));
    }

    /// Stops the call's conversation task. Idempotent.
    pub fn stop_call(&self, call_id: &str) {
        if let Some((_, handle)) = self.calls.remove(call_id) {
            handle.cancel.cancel();
            log::info!("[Coordinator] Stopped conversation for call {}", call_id);
        }
    }

    /// Delivers an event to a call's task. Unknown calls drop the event.
    pub fn dispatch(&self, call_id: &str, event: CoordEvent) {
        if let Some(handle) = self.calls.get(call_id) {
            if handle.tx.try_send(event).is_err() {
                log::warn!("[Coordinator] Event queue full for call {}", call_id);
            }
        } else {
            log::debug!("[Coordinator] Event for unknown call {} dropped", call_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-call task
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_call(
        self: Arc<Self>,
        call_id: String,
        mut rx: mpsc::Receiver<CoordEvent>,
        cancel: CancellationToken,
    ) {
        let mut state = ConversationState::Greeting;
        self.store
            .set_conversation_state(&call_id, ConversationState::Greeting);

        // Seed the history with the system prompt.
        self.store.push_history(
            &call_id,
            ConversationRole::System,
            self.config.conversation.system_prompt.clone(),
            self.config.conversation.max_context,
        );

        let greeting = self.config.conversation.greeting.clone();
        if let Err(e) = self.speak(&call_id, &greeting, "greeting").await {
            log::error!("[Coordinator] Greeting failed for call {}: {}", call_id, e);
            self.fail_call(&call_id).await;
            self.calls.remove(&call_id);
            return;
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                CoordEvent::Utterance(utterance) => {
                    if state != ConversationState::Listening {
                        log::debug!(
                            "[Coordinator] Utterance {} ignored in state {:?} for call {}",
                            utterance.id,
                            state,
                            call_id
                        );
                        continue;
                    }
                    state = self.process_turn(&call_id, utterance).await;
                    if state == ConversationState::Ended {
                        self.fail_call(&call_id).await;
                        break;
                    }
                    self.store.set_conversation_state(&call_id, state);
                }
                CoordEvent::TtsIdle => {
                    if matches!(
                        state,
                        ConversationState::Greeting | ConversationState::Speaking
                    ) {
                        state = ConversationState::Listening;
                        self.store.set_conversation_state(&call_id, state);
                        log::info!("[Coordinator] Call {} listening", call_id);
                    }
                }
                CoordEvent::BargeIn => {
                    if matches!(
                        state,
                        ConversationState::Greeting | ConversationState::Speaking
                    ) {
                        log::info!("[Coordinator] Barge-in on call {}", call_id);
                        self.cancel_current_tts(&call_id).await;
                        state = ConversationState::Listening;
                        self.store.set_conversation_state(&call_id, state);
                    }
                }
                CoordEvent::Hangup => break,
            }
        }

        self.store
            .set_conversation_state(&call_id, ConversationState::Ended);
        self.calls.remove(&call_id);
        log::info!("[Coordinator] Conversation ended for call {}", call_id);
    }

    /// One full STT → LLM → TTS turn. Returns the next state.
    async fn process_turn(&self, call_id: &str, utterance: Utterance) -> ConversationState {
        self.store
            .set_conversation_state(call_id, ConversationState::Processing);
        log::info!(
            "[Coordinator] Processing utterance {} ({} ms) for call {}",
            utterance.id,
            utterance.duration_ms,
            call_id
        );

        let resolution = match self.orchestrator.get_pipeline(call_id, None) {
            Ok(resolution) => resolution,
            Err(e) => {
                log::error!("[Coordinator] No pipeline for call {}: {}", call_id, e);
                return ConversationState::Ended;
            }
        };

        // STT, at the adapter's preferred rate.
        let stt_rate = resolution.stt_options.sample_rate.unwrap_or(PUMP_SAMPLE_RATE);
        let audio = if stt_rate == PUMP_SAMPLE_RATE {
            utterance.audio
        } else {
            codec::Resampler::new().resample(&utterance.audio, PUMP_SAMPLE_RATE, stt_rate)
        };

        let transcript = match resolution
            .stt
            .transcribe(call_id, &audio, stt_rate, &resolution.stt_options)
            .await
        {
            Ok(text) => text,
            Err(e) => return self.turn_error(call_id, "STT", e),
        };
        if transcript.trim().is_empty() {
            log::info!("[Coordinator] Empty transcript for call {}; skipping turn", call_id);
            return ConversationState::Listening;
        }
        log::info!("[Coordinator] Call {} user said: {}", call_id, transcript);

        self.store.push_history(
            call_id,
            ConversationRole::User,
            transcript.clone(),
            self.config.conversation.max_context,
        );

        // LLM, with the rolling history.
        let history = self.store.history(call_id);
        let response = match resolution
            .llm
            .generate(call_id, &transcript, &history, &resolution.llm_options)
            .await
        {
            Ok(text) => text,
            Err(e) => return self.turn_error(call_id, "LLM", e),
        };
        if response.trim().is_empty() {
            // Empty LLM reply: skip the turn without a response.
            log::info!("[Coordinator] Empty LLM response for call {}; skipping turn", call_id);
            return ConversationState::Listening;
        }
        log::info!("[Coordinator] Call {} assistant: {}", call_id, response);

        self.store.push_history(
            call_id,
            ConversationRole::Assistant,
            response.clone(),
            self.config.conversation.max_context,
        );

        // TTS.
        match self.speak(call_id, &response, "response").await {
            Ok(()) => ConversationState::Speaking,
            Err(e) => {
                log::warn!("[Coordinator] TTS failed for call {}: {}", call_id, e);
                // Canned fallback so the caller hears something.
                if self
                    .playback
                    .play_audio(call_id, &canned_fallback_audio(), "tts-fallback")
                    .await
                    .is_ok()
                {
                    ConversationState::Speaking
                } else {
                    ConversationState::Listening
                }
            }
        }
    }

    /// Maps an adapter failure to the next state: per-request errors skip
    /// the turn, everything else is call-fatal.
    fn turn_error(&self, call_id: &str, stage: &str, error: AdapterError) -> ConversationState {
        match error {
            AdapterError::Timeout(_) | AdapterError::EmptyResponse(_) => {
                log::warn!(
                    "[Coordinator] {} error on call {}; skipping turn: {}",
                    stage,
                    call_id,
                    error
                );
                ConversationState::Listening
            }
            other => {
                log::error!(
                    "[Coordinator] {} failure on call {}; failing call: {}",
                    stage,
                    call_id,
                    other
                );
                ConversationState::Ended
            }
        }
    }

    /// Synthesizes `text` and routes it downstream: streaming when
    /// configured, else collected into one file playback.
    async fn speak(
        &self,
        call_id: &str,
        text: &str,
        playback_type: &str,
    ) -> Result<(), AdapterError> {
        let resolution = self
            .orchestrator
            .get_pipeline(call_id, None)
            .map_err(|e| AdapterError::Closed(e.to_string()))?;

        let chunks = resolution
            .tts
            .synthesize(call_id, text, &resolution.tts_options)
            .await?;

        match self.config.downstream_mode {
            DownstreamMode::Stream => {
                self.streaming
                    .start_streaming(call_id, chunks, playback_type)
                    .await
                    .map_err(|e| AdapterError::Closed(e.to_string()))?;
            }
            DownstreamMode::File => {
                let audio = collect_chunks(chunks).await?;
                if audio.is_empty() {
                    return Err(AdapterError::EmptyResponse(resolution.tts_key.clone()));
                }
                self.playback
                    .play_audio(call_id, &audio, playback_type)
                    .await
                    .map_err(|e| AdapterError::Closed(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Cancels any in-flight TTS for the call: closes the adapter's
    /// per-call session, drains the stream queue, clears every gating
    /// token. The caller transitions state.
    pub async fn cancel_current_tts(&self, call_id: &str) {
        if let Ok(resolution) = self.orchestrator.get_pipeline(call_id, None) {
            if let Err(e) = resolution.tts.close_call(call_id).await {
                log::debug!(
                    "[Coordinator] TTS close_call failed for {}: {}",
                    call_id,
                    e
                );
            }
        }

        self.streaming.stop_streaming(call_id);

        // File-based playbacks are cancelled at the PBX.
        for playback in self.store.remove_playbacks_for_call(call_id) {
            if let Err(e) = self.ari.stop_playback(&playback.playback_id).await {
                log::debug!(
                    "[Coordinator] stop_playback {} failed: {}",
                    playback.playback_id,
                    e
                );
            }
            if let Some(file) = &playback.audio_file {
                let _ = tokio::fs::remove_file(file).await;
            }
        }

        let cleared = self.store.clear_all_gating_tokens(call_id);
        log::info!(
            "[Coordinator] Cancelled TTS for call {} ({} tokens cleared)",
            call_id,
            cleared
        );
    }

    /// Call-fatal path: hang up; the engine finishes teardown on
    /// StasisEnd.
    async fn fail_call(&self, call_id: &str) {
        self.store
            .set_conversation_state(call_id, ConversationState::Ended);
        if let Some(session) = self.store.get_by_call_id(call_id) {
            if let Err(e) = self.ari.hangup(&session.caller_channel_id).await {
                log::warn!("[Coordinator] Hangup failed for call {}: {}", call_id, e);
            }
        }
    }
}

/// Drains a TTS chunk stream into one buffer, bounded in time.
async fn collect_chunks(
    mut chunks: mpsc::Receiver<bytes::Bytes>,
) -> Result<Vec<u8>, AdapterError> {
    let collect = async {
        let mut audio = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            audio.extend_from_slice(&chunk);
        }
        audio
    };
    tokio::time::timeout(
        std::time::Duration::from_secs(FILE_COLLECT_TIMEOUT_SEC),
        collect,
    )
    .await
    .map_err(|_| AdapterError::Timeout(FILE_COLLECT_TIMEOUT_SEC))
}

/// Short two-tone chime, µ-law 8 kHz, used when synthesis fails.
fn canned_fallback_audio() -> Vec<u8> {
    let mut pcm = Vec::with_capacity(3200 * 2);
    for (freq, samples) in [(440.0f32, 1600usize), (330.0, 1600)] {
        for n in 0..samples {
            let t = n as f32 / 8000.0;
            let amp = (t * freq * 2.0 * std::f32::consts::PI).sin() * 8000.0;
            pcm.extend_from_slice(&(amp as i16).to_le_bytes());
        }
    }
    codec::pcm16_to_ulaw(&pcm)
}

// ─────────────────────────────────────────────────────────────────────────────
// Gate capability
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl TtsGate for ConversationCoordinator {
    async fn on_tts_start(&self, call_id: &str, token: &str) -> bool {
        self.store.set_gating_token(call_id, token)
    }

    async fn on_tts_end(&self, call_id: &str, token: &str, reason: &str) {
        self.store.clear_gating_token(call_id, token);
        let refcount = self
            .store
            .get_by_call_id(call_id)
            .map(|s| s.tts_refcount())
            .unwrap_or(0);
        log::debug!(
            "[Coordinator] TTS token {} ended for call {} ({}, refcount {})",
            token,
            call_id,
            reason,
            refcount
        );
        if refcount == 0 {
            self.dispatch(call_id, CoordEvent::TtsIdle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_fallback_is_nonempty_ulaw() {
        let audio = canned_fallback_audio();
        // 400 ms at 8 kHz µ-law.
        assert_eq!(audio.len(), 3200);
    }

    #[tokio::test]
    async fn collect_chunks_concatenates_until_close() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(bytes::Bytes::from_static(&[1, 2])).await.unwrap();
        tx.send(bytes::Bytes::from_static(&[3])).await.unwrap();
        drop(tx);

        let audio = collect_chunks(rx).await.unwrap();
        assert_eq!(audio, vec![1, 2, 3]);
    }
}
