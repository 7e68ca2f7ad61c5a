//! Application bootstrap and dependency wiring.
//!
//! The composition root: every service is instantiated and wired here, in
//! dependency order. The lifecycle cycle between the playback managers and
//! the coordinator is broken by injecting the coordinator as a [`TtsGate`]
//! after construction.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ari::{AriClient, AriEventStream};
use crate::audio::PassthroughFilter;
use crate::config::{AudioTransport, Config};
use crate::coordinator::ConversationCoordinator;
use crate::engine::CallEngine;
use crate::error::{ParlanceError, ParlanceResult};
use crate::http::start_http;
use crate::metrics::Metrics;
use crate::pipeline::PipelineOrchestrator;
use crate::playback::{PlaybackManager, StreamingPlaybackManager, TtsGate};
use crate::session::SessionStore;
use crate::transport::{AudioSocketServer, MediaTransport, RtpTransport};

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    pub store: Arc<SessionStore>,
    pub ari: Arc<AriClient>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub coordinator: Arc<ConversationCoordinator>,
    pub playback: Arc<PlaybackManager>,
    pub streaming: Arc<StreamingPlaybackManager>,
    pub engine: Arc<CallEngine>,
    pub metrics: Arc<Metrics>,
    /// Cancellation token for graceful shutdown.
    pub cancel: CancellationToken,
    engine_task: tokio::task::JoinHandle<()>,
    event_task: tokio::task::JoinHandle<()>,
    http_task: tokio::task::JoinHandle<()>,
    /// Keeps the disconnect channel open when the transport has no sender
    /// (the RTP path never reports disconnects).
    _disconnect_tx: mpsc::Sender<String>,
}

impl BootstrappedServices {
    /// Initiates graceful shutdown: calls torn down first, then the
    /// transports and clients wind down with the cancellation token.
    pub async fn shutdown(self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        for call_id in self.store.list_call_ids() {
            self.engine.teardown_call(&call_id).await;
        }

        self.cancel.cancel();
        let _ = self.engine_task.await;
        self.event_task.abort();
        self.http_task.abort();

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all services and starts the engine.
///
/// Wiring order:
/// 1. Configuration validation (fatal on error)
/// 2. Session store, metrics
/// 3. ARI client + reachability probe
/// 4. Media transport (RTP socket or AudioSocket listener)
/// 5. Playback managers
/// 6. Pipeline orchestrator (+ registry validation)
/// 7. Conversation coordinator, injected as the TTS gate
/// 8. Call engine: stale sweep, event stream, main loop
pub async fn bootstrap(config: Config) -> ParlanceResult<BootstrappedServices> {
    config.validate()?;
    let config = Arc::new(config);

    let store = Arc::new(SessionStore::new());
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    // Control plane must be reachable before we accept calls.
    let ari = Arc::new(AriClient::new(&config.asterisk));
    ari.get_info()
        .await
        .map_err(|e| ParlanceError::Configuration(format!("Asterisk unreachable: {}", e)))?;
    log::info!(
        "[Bootstrap] Connected to Asterisk at {}:{}",
        config.asterisk.host,
        config.asterisk.port
    );

    // Transport. The disconnect channel feeds the engine loop.
    let (disconnect_tx, disconnect_rx) = mpsc::channel::<String>(32);
    let mut rtp: Option<Arc<RtpTransport>> = None;
    let mut audiosocket: Option<Arc<AudioSocketServer>> = None;
    let transport: Arc<dyn MediaTransport> = match config.audio_transport {
        AudioTransport::Rtp => {
            let t = RtpTransport::bind(cancel.clone()).await?;
            rtp = Some(Arc::clone(&t));
            t
        }
        AudioTransport::Audiosocket => {
            let t = AudioSocketServer::start(
                &config.audiosocket.bind_addr,
                disconnect_tx.clone(),
                cancel.clone(),
            )
            .await?;
            audiosocket = Some(Arc::clone(&t));
            t
        }
    };

    let advertise_ip = match config.rtp.advertise_ip {
        Some(ip) => ip.to_string(),
        None => local_ip_address::local_ip()
            .map_err(|e| {
                ParlanceError::Configuration(format!(
                    "cannot auto-detect local IP ({}); set rtp.advertise_ip",
                    e
                ))
            })?
            .to_string(),
    };

    let playback = Arc::new(PlaybackManager::new(
        Arc::clone(&store),
        Arc::clone(&ari),
        config.media_dir.clone(),
    ));
    playback.ensure_media_dir().await?;

    let streaming = Arc::new(StreamingPlaybackManager::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&playback),
        config.streaming.clone(),
        Arc::clone(&metrics),
    ));

    let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(&config)));
    orchestrator.validate()?;

    let coordinator = Arc::new(ConversationCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&orchestrator),
        Arc::clone(&playback),
        Arc::clone(&streaming),
        Arc::clone(&ari),
        Arc::clone(&config),
    ));
    // Break the manager <-> coordinator cycle through the capability trait.
    let gate: Arc<dyn TtsGate> = coordinator.clone() as Arc<dyn TtsGate>;
    playback.set_gate(Arc::clone(&gate));
    streaming.set_gate(gate);

    let engine = CallEngine::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&ari),
        Arc::clone(&orchestrator),
        Arc::clone(&coordinator),
        Arc::clone(&playback),
        Arc::clone(&streaming),
        rtp,
        audiosocket,
        advertise_ip,
        // DSP chain seam; concrete noise suppression / echo cancellation
        // plugs in here.
        Arc::new(PassthroughFilter),
        Arc::clone(&metrics),
        cancel.clone(),
    );

    engine.startup_sweep().await;

    let (events_rx, event_task) = AriEventStream::spawn(&config.asterisk, cancel.clone());
    let engine_task = tokio::spawn(Arc::clone(&engine).run(events_rx, disconnect_rx));

    let http_task = start_http(
        Arc::clone(&metrics),
        Arc::clone(&store),
        config.http_port,
        cancel.clone(),
    )
    .await?;

    log::info!("[Bootstrap] All services started");
    Ok(BootstrappedServices {
        store,
        ari,
        orchestrator,
        coordinator,
        playback,
        streaming,
        engine,
        metrics,
        cancel,
        engine_task,
        event_task,
        http_task,
        _disconnect_tx: disconnect_tx,
    })
}
