//! Call engine: binds PBX events to per-call sessions.
//!
//! Owns the top-level lifecycle: a caller channel entering our Stasis app
//! becomes a session with a bridge, a media leg, a transport binding, an
//! inbound pump and a conversation coordinator. Every teardown path runs
//! through the same finalizer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ari::{AriClient, AriEvent, Channel};
use crate::audio::{codec, AudioFilter, UtteranceDetector, VadMode};
use crate::config::{AudioTransport, Config};
use crate::coordinator::{ConversationCoordinator, CoordEvent, PUMP_SAMPLE_RATE};
use crate::error::{ParlanceError, ParlanceResult};
use crate::metrics::Metrics;
use crate::pipeline::PipelineOrchestrator;
use crate::playback::{PlaybackManager, StreamingPlaybackManager};
use crate::session::{CallSession, SessionStore, TransportBinding};
use crate::transport::rtp::inbound_channel;
use crate::transport::{AudioSocketServer, InboundFrame, MediaTransport, RtpTransport};

/// Channel-name prefixes that identify real caller legs.
const CALLER_PREFIXES: [&str; 3] = ["PJSIP/", "SIP/", "Local/"];
/// Channel-name prefixes of media legs we originate ourselves.
const MEDIA_PREFIXES: [&str; 2] = ["UnicastRTP/", "AudioSocket/"];
/// How long to wait for Asterisk to dial into our AudioSocket listener.
const AUDIOSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Period of the stale-session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// VAD frame size fed by the pump.
const VAD_FRAME_MS: u64 = 20;

/// Top-level per-call lifecycle owner.
pub struct CallEngine {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    ari: Arc<AriClient>,
    orchestrator: Arc<PipelineOrchestrator>,
    coordinator: Arc<ConversationCoordinator>,
    playback: Arc<PlaybackManager>,
    streaming: Arc<StreamingPlaybackManager>,
    rtp: Option<Arc<RtpTransport>>,
    audiosocket: Option<Arc<AudioSocketServer>>,
    /// IP advertised to Asterisk for external media.
    advertise_ip: String,
    /// Inbound DSP chain (noise suppression, echo cancellation). Runs on
    /// every decoded frame before the barge-in tap and VAD.
    audio_filter: Arc<dyn AudioFilter>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl CallEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<SessionStore>,
        ari: Arc<AriClient>,
        orchestrator: Arc<PipelineOrchestrator>,
        coordinator: Arc<ConversationCoordinator>,
        playback: Arc<PlaybackManager>,
        streaming: Arc<StreamingPlaybackManager>,
        rtp: Option<Arc<RtpTransport>>,
        audiosocket: Option<Arc<AudioSocketServer>>,
        advertise_ip: String,
        audio_filter: Arc<dyn AudioFilter>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            ari,
            orchestrator,
            coordinator,
            playback,
            streaming,
            rtp,
            audiosocket,
            advertise_ip,
            audio_filter,
            metrics,
            cancel,
        })
    }

    /// Main loop: consumes ARI events and transport disconnects until
    /// cancelled. Tears down all remaining calls on exit.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AriEvent>,
        mut disconnects: mpsc::Receiver<String>,
    ) {
        let sweeper = tokio::spawn(Arc::clone(&self).sweep_loop());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                call_id = disconnects.recv() => {
                    if let Some(call_id) = call_id {
                        log::warn!("[Engine] Transport disconnect for call {}", call_id);
                        self.teardown_call(&call_id).await;
                    }
                }
            }
        }

        sweeper.abort();

        // Orderly shutdown: every call torn down before the transports
        // and clients go away.
        for call_id in self.store.list_call_ids() {
            self.teardown_call(&call_id).await;
        }
        log::info!("[Engine] Stopped");
    }

    async fn handle_event(&self, event: AriEvent) {
        match event {
            AriEvent::StasisStart { channel, args, .. } => {
                self.handle_stasis_start(channel, args).await;
            }
            AriEvent::StasisEnd { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. } => {
                if let Some(call_id) = self.store.resolve_call_id(&channel.id) {
                    log::info!(
                        "[Engine] Channel {} ended; tearing down call {}",
                        channel.id,
                        call_id
                    );
                    self.teardown_call(&call_id).await;
                } else {
                    log::debug!("[Engine] End event for unknown channel {}", channel.id);
                }
            }
            AriEvent::PlaybackFinished { playback, .. } => {
                self.playback.on_playback_finished(&playback.id).await;
            }
            AriEvent::ChannelStateChange { channel, .. } => {
                log::debug!(
                    "[Engine] Channel {} state now {}",
                    channel.id,
                    channel.state
                );
            }
            AriEvent::ChannelDtmfReceived { channel, digit, .. } => {
                // IVR menus are out of scope; observe only.
                log::debug!("[Engine] DTMF '{}' on channel {}", digit, channel.id);
            }
            AriEvent::Unknown => {}
        }
    }

    async fn handle_stasis_start(&self, channel: Channel, args: Vec<String>) {
        // Our own media legs also enter the app; never treat them as calls.
        if MEDIA_PREFIXES.iter().any(|p| channel.name.starts_with(p)) {
            log::debug!("[Engine] Ignoring media leg {} ({})", channel.id, channel.name);
            return;
        }
        if self.store.get_by_any_channel_id(&channel.id).is_some() {
            log::debug!("[Engine] Channel {} already tracked", channel.id);
            return;
        }
        if !CALLER_PREFIXES.iter().any(|p| channel.name.starts_with(p)) {
            log::debug!(
                "[Engine] Ignoring non-caller channel {} ({})",
                channel.id,
                channel.name
            );
            return;
        }

        log::info!(
            "[Engine] New call {} from {} <{}>",
            channel.id,
            channel.caller.name,
            channel.caller.number
        );

        let pipeline_name = args.first().cloned();
        if let Err(e) = self.setup_call(&channel, pipeline_name.as_deref()).await {
            log::error!("[Engine] Call {} setup failed: {}", channel.id, e);
            self.teardown_call(&channel.id).await;
            let _ = self.ari.hangup(&channel.id).await;
        }
    }

    /// Builds everything a call needs. Any error unwinds through
    /// [`Self::teardown_call`].
    async fn setup_call(&self, channel: &Channel, pipeline_name: Option<&str>) -> ParlanceResult<()> {
        let call_id = channel.id.clone();

        self.ari.answer(&call_id).await?;

        // Eagerly resolve adapters; a broken pipeline fails the call now,
        // not on the first utterance.
        let resolution = self.orchestrator.get_pipeline(&call_id, pipeline_name)?;
        resolution
            .open_all()
            .await
            .map_err(|e| ParlanceError::CallFailed(format!("adapter open_call: {}", e)))?;

        let mut session = CallSession::new(call_id.clone(), resolution.pipeline_name.clone());
        self.store.upsert(session.clone());
        self.metrics
            .active_calls
            .with_label_values(&["all"])
            .set(self.store.session_count() as i64);

        let bridge = self.ari.create_bridge().await?;
        session.bridge_id = Some(bridge.id.clone());
        self.store.upsert(session.clone());
        self.ari.add_channel_to_bridge(&bridge.id, &call_id).await?;

        // Media leg + transport binding.
        let frame_rx = match self.config.audio_transport {
            AudioTransport::Rtp => self.setup_rtp_leg(&mut session, &bridge.id).await?,
            AudioTransport::Audiosocket => {
                self.setup_audiosocket_leg(&mut session, &bridge.id).await?
            }
        };
        self.store.upsert(session);

        self.spawn_pump(call_id.clone(), frame_rx);
        self.coordinator.start_call(&call_id);

        log::info!("[Engine] Call {} is up (bridge {})", call_id, bridge.id);
        Ok(())
    }

    async fn setup_rtp_leg(
        &self,
        session: &mut CallSession,
        bridge_id: &str,
    ) -> ParlanceResult<mpsc::Receiver<InboundFrame>> {
        let rtp = self
            .rtp
            .as_ref()
            .ok_or_else(|| ParlanceError::Internal("RTP transport not running".to_string()))?;

        let external_host = format!("{}:{}", self.advertise_ip, rtp.local_port());
        let media = self
            .ari
            .create_external_media(&external_host, "ulaw")
            .await?;

        let port = media.unicast_rtp_local_port().ok_or_else(|| {
            ParlanceError::CallFailed(format!(
                "external media channel {} did not expose UNICASTRTP_LOCAL_PORT",
                media.id
            ))
        })?;

        session.external_media_channel_id = Some(media.id.clone());
        self.store.upsert(session.clone());
        self.ari.add_channel_to_bridge(bridge_id, &media.id).await?;

        // Asterisk's RTP endpoint: control-plane host, media port.
        let dest = resolve_rtp_dest(&self.config.asterisk.host, port).await?;

        let (frame_tx, frame_rx) = inbound_channel();
        let ssrc = rtp.register(&session.call_id, dest, frame_tx);
        session.transport = TransportBinding::Rtp { dest, ssrc };
        Ok(frame_rx)
    }

    async fn setup_audiosocket_leg(
        &self,
        session: &mut CallSession,
        bridge_id: &str,
    ) -> ParlanceResult<mpsc::Receiver<InboundFrame>> {
        let audiosocket = self.audiosocket.as_ref().ok_or_else(|| {
            ParlanceError::Internal("AudioSocket transport not running".to_string())
        })?;

        let correlation = uuid::Uuid::new_v4().to_string();
        let media = self
            .ari
            .originate_audiosocket(&self.config.audiosocket.asterisk_endpoint, &correlation)
            .await?;

        session.external_media_channel_id = Some(media.id.clone());
        self.store.upsert(session.clone());
        self.ari.add_channel_to_bridge(bridge_id, &media.id).await?;

        let conn_id = audiosocket
            .await_connection(AUDIOSOCKET_DIAL_TIMEOUT)
            .await
            .ok_or_else(|| {
                ParlanceError::CallFailed(
                    "Asterisk did not connect to the AudioSocket listener".to_string(),
                )
            })?;

        let frame_rx = audiosocket
            .bind_call(&conn_id, &session.call_id)
            .map_err(|e| ParlanceError::CallFailed(e.to_string()))?;
        session.transport = TransportBinding::AudioSocket { conn_id };
        Ok(frame_rx)
    }

    /// Removes every PBX-visible and in-process resource a call owns.
    /// Safe to call repeatedly; the single deterministic finalizer.
    ///
    /// Runs even when no session was stored yet, so a failed setup still
    /// releases whatever it had acquired (cached pipeline resolution,
    /// coordinator task, stream).
    pub async fn teardown_call(&self, call_id: &str) {
        let session = self.store.remove(call_id);

        self.coordinator.stop_call(call_id);
        self.streaming.stop_streaming(call_id);
        self.orchestrator.release_pipeline(call_id).await;

        // Cancel outstanding playbacks at the PBX and on disk.
        for playback in self.store.remove_playbacks_for_call(call_id) {
            let _ = self.ari.stop_playback(&playback.playback_id).await;
            if let Some(file) = &playback.audio_file {
                let _ = tokio::fs::remove_file(file).await;
            }
        }

        let Some(session) = session else {
            return;
        };
        log::info!("[Engine] Tearing down call {}", call_id);

        match &session.transport {
            TransportBinding::Rtp { .. } => {
                if let Some(rtp) = &self.rtp {
                    rtp.unregister(call_id);
                }
            }
            TransportBinding::AudioSocket { conn_id } => {
                if let Some(audiosocket) = &self.audiosocket {
                    audiosocket.unregister(call_id);
                    audiosocket.close_connection(conn_id).await;
                }
            }
            TransportBinding::None => {}
        }

        if let Some(media_id) = &session.external_media_channel_id {
            let _ = self.ari.hangup(media_id).await;
        }
        if let Some(bridge_id) = &session.bridge_id {
            let _ = self.ari.destroy_bridge(bridge_id).await;
        }
        let _ = self.ari.hangup(&session.caller_channel_id).await;

        self.metrics.remove_call(call_id);
        self.metrics
            .active_calls
            .with_label_values(&["all"])
            .set(self.store.session_count() as i64);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound pump
    // ─────────────────────────────────────────────────────────────────────────

    /// One task per call: decode, DSP filter, barge-in tap, capture gate,
    /// VAD.
    fn spawn_pump(&self, call_id: String, mut frames: mpsc::Receiver<InboundFrame>) {
        let store = Arc::clone(&self.store);
        let coordinator = Arc::clone(&self.coordinator);
        let filter = Arc::clone(&self.audio_filter);
        let cancel = self.cancel.clone();
        let barge_in_ms = self.config.conversation.barge_in_ms;
        let barge_in_threshold = self.config.conversation.barge_in_threshold;

        tokio::spawn(async move {
            let mut detector =
                UtteranceDetector::new(VadMode::default(), PUMP_SAMPLE_RATE, VAD_FRAME_MS);
            let mut resampler = codec::Resampler::new();
            let mut barge_accum_ms: u64 = 0;

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let Some(gating) = store.gating_snapshot(&call_id) else {
                    break; // session gone
                };

                let decoded = match frame.encoding {
                    crate::audio::AudioEncoding::Ulaw => codec::ulaw_to_pcm16(&frame.payload),
                    crate::audio::AudioEncoding::Alaw => codec::alaw_to_pcm16(&frame.payload),
                    crate::audio::AudioEncoding::Pcm16 => frame.payload.to_vec(),
                };

                // DSP chain ahead of everything that interprets the audio.
                let mut samples = codec::pcm16_bytes_to_samples(&decoded);
                filter.process(&mut samples);
                let pcm8k = codec::pcm16_samples_to_bytes(&samples);

                if gating.vad_reset {
                    detector.reset();
                    resampler.reset();
                    barge_accum_ms = 0;
                }

                // Barge-in tap: raw amplitude, independent of the gate.
                if gating.tts_playing {
                    let frame_ms = if frame.sample_rate > 0 {
                        samples.len() as u64 * 1000 / u64::from(frame.sample_rate)
                    } else {
                        0
                    };
                    if mean_abs(&samples) >= barge_in_threshold as f64 {
                        barge_accum_ms += frame_ms;
                        if barge_accum_ms >= barge_in_ms {
                            coordinator.dispatch(&call_id, CoordEvent::BargeIn);
                            barge_accum_ms = 0;
                        }
                    } else {
                        barge_accum_ms = 0;
                    }
                } else {
                    barge_accum_ms = 0;
                }

                // The capture gate precedes VAD: gated audio never reaches
                // the utterance detector, so it can never reach STT.
                if !gating.audio_capture_enabled {
                    continue;
                }

                let pcm16k = resampler.resample(&pcm8k, frame.sample_rate, PUMP_SAMPLE_RATE);
                match detector.push(&pcm16k) {
                    Ok(utterances) => {
                        for utterance in utterances {
                            coordinator.dispatch(&call_id, CoordEvent::Utterance(utterance));
                        }
                    }
                    Err(e) => {
                        log::warn!("[Engine] VAD error on call {}: {}", call_id, e);
                    }
                }
            }
            log::debug!("[Engine] Pump for call {} stopped", call_id);
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Destroys bridges and media legs left behind by a previous run.
    pub async fn startup_sweep(&self) {
        match self.ari.list_bridges().await {
            Ok(bridges) => {
                for bridge in bridges {
                    log::info!("[Engine] Sweeping stale bridge {}", bridge.id);
                    let _ = self.ari.destroy_bridge(&bridge.id).await;
                }
            }
            Err(e) => log::warn!("[Engine] Bridge sweep failed: {}", e),
        }

        match self.ari.list_channels().await {
            Ok(channels) => {
                for channel in channels {
                    if MEDIA_PREFIXES.iter().any(|p| channel.name.starts_with(p)) {
                        log::info!(
                            "[Engine] Sweeping stale media channel {} ({})",
                            channel.id,
                            channel.name
                        );
                        let _ = self.ari.hangup(&channel.id).await;
                    }
                }
            }
            Err(e) => log::warn!("[Engine] Channel sweep failed: {}", e),
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }

            for call_id in self.store.cleanup_expired_sessions(self.config.session_ttl_secs) {
                log::info!("[Engine] Session {} expired; finishing teardown", call_id);
                self.coordinator.stop_call(&call_id);
                self.streaming.stop_streaming(&call_id);
                self.orchestrator.release_pipeline(&call_id).await;
            }
            self.streaming
                .cleanup_expired_streams(Duration::from_secs(self.config.session_ttl_secs));
        }
    }
}

/// Mean absolute amplitude of a PCM16 frame.
fn mean_abs(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s).abs()).sum();
    sum / samples.len() as f64
}

/// Resolves the PBX host plus RTP port into a socket address.
async fn resolve_rtp_dest(host: &str, port: u16) -> ParlanceResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ParlanceError::CallFailed(format!("cannot resolve {}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| ParlanceError::CallFailed(format!("no address for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioEncoding;
    use crate::config::PipelineEntry;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that accepts everything and sends nowhere.
    struct NullTransport;

    #[async_trait]
    impl MediaTransport for NullTransport {
        async fn send(&self, _call_id: &str, _audio: &[u8]) -> bool {
            true
        }
        fn unregister(&self, _call_id: &str) {}
        fn outbound_encoding(&self) -> AudioEncoding {
            AudioEncoding::Ulaw
        }
    }

    /// Filter that counts every frame routed through it.
    #[derive(Default)]
    struct CountingFilter {
        frames: AtomicUsize,
    }

    impl AudioFilter for CountingFilter {
        fn process(&self, _frame: &mut [i16]) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_engine(filter: Arc<dyn AudioFilter>) -> (Arc<CallEngine>, Arc<SessionStore>) {
        let mut config = Config::default();
        config.pipelines.insert(
            "default".to_string(),
            PipelineEntry {
                stt: "x_stt".to_string(),
                llm: "x_llm".to_string(),
                tts: "x_tts".to_string(),
                options: Default::default(),
            },
        );
        let config = Arc::new(config);

        let store = Arc::new(SessionStore::new());
        let metrics = Arc::new(Metrics::new());
        let ari = Arc::new(AriClient::new(&config.asterisk));
        let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(&config)));
        let playback = Arc::new(PlaybackManager::new(
            Arc::clone(&store),
            Arc::clone(&ari),
            std::env::temp_dir().join("parlance-engine-test"),
        ));
        let transport: Arc<dyn MediaTransport> = Arc::new(NullTransport);
        let streaming = Arc::new(StreamingPlaybackManager::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&playback),
            config.streaming.clone(),
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(crate::coordinator::ConversationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&orchestrator),
            Arc::clone(&playback),
            Arc::clone(&streaming),
            Arc::clone(&ari),
            Arc::clone(&config),
        ));

        let engine = CallEngine::new(
            config,
            Arc::clone(&store),
            ari,
            orchestrator,
            coordinator,
            playback,
            streaming,
            None,
            None,
            "127.0.0.1".to_string(),
            filter,
            metrics,
            CancellationToken::new(),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn pump_routes_every_frame_through_the_audio_filter() {
        let filter = Arc::new(CountingFilter::default());
        let (engine, store) = test_engine(Arc::<CountingFilter>::clone(&filter));
        store.upsert(CallSession::new("c1", "default"));

        let (tx, rx) = inbound_channel();
        engine.spawn_pump("c1".to_string(), rx);

        for _ in 0..3 {
            tx.send(InboundFrame {
                payload: Bytes::from(vec![0xFFu8; 160]), // 20ms µ-law silence
                encoding: AudioEncoding::Ulaw,
                sample_rate: 8000,
            })
            .await
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while filter.frames.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("filter must see every inbound frame");
    }

    #[tokio::test]
    async fn pump_filters_frames_even_while_capture_is_gated() {
        let filter = Arc::new(CountingFilter::default());
        let (engine, store) = test_engine(Arc::<CountingFilter>::clone(&filter));
        store.upsert(CallSession::new("c1", "default"));
        // Gate capture: the DSP chain still runs ahead of the gate.
        store.set_gating_token("c1", "t1");

        let (tx, rx) = inbound_channel();
        engine.spawn_pump("c1".to_string(), rx);

        tx.send(InboundFrame {
            payload: Bytes::from(vec![0xFFu8; 160]),
            encoding: AudioEncoding::Ulaw,
            sample_rate: 8000,
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while filter.frames.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("gated frames still pass through the filter");
    }

    #[test]
    fn mean_abs_of_silence_is_zero() {
        assert_eq!(mean_abs(&[0, 0, 0]), 0.0);
        assert_eq!(mean_abs(&[]), 0.0);
    }

    #[test]
    fn mean_abs_mixes_signs() {
        assert_eq!(mean_abs(&[1000, -1000]), 1000.0);
    }

    #[tokio::test]
    async fn resolve_rtp_dest_handles_plain_ip() {
        let addr = resolve_rtp_dest("127.0.0.1", 4000).await.unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn caller_prefix_filter_matches_expected_channels() {
        assert!(CALLER_PREFIXES.iter().any(|p| "PJSIP/alice-1".starts_with(p)));
        assert!(CALLER_PREFIXES.iter().any(|p| "Local/100@ctx".starts_with(p)));
        assert!(!CALLER_PREFIXES
            .iter()
            .any(|p| "UnicastRTP/127.0.0.1".starts_with(p)));
    }
}
