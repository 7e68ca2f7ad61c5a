//! File-based playback through the PBX.
//!
//! Audio is written as a `.ulaw` file into the media directory shared
//! with Asterisk, played on the call's bridge under a deterministic
//! playback id, and gated so the agent never hears itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::TtsGate;
use crate::ari::AriClient;
use crate::error::{ParlanceError, ParlanceResult};
use crate::session::types::now_ms;
use crate::session::{PlaybackRef, SessionStore};

/// File playback with deterministic ids and token-aware gating.
pub struct PlaybackManager {
    store: Arc<SessionStore>,
    ari: Arc<AriClient>,
    media_dir: PathBuf,
    /// Last path component of `media_dir`, used in `sound:` URIs.
    sound_prefix: String,
    gate: RwLock<Option<Arc<dyn TtsGate>>>,
}

impl PlaybackManager {
    pub fn new(store: Arc<SessionStore>, ari: Arc<AriClient>, media_dir: PathBuf) -> Self {
        let sound_prefix = media_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "parlance".to_string());
        Self {
            store,
            ari,
            media_dir,
            sound_prefix,
            gate: RwLock::new(None),
        }
    }

    /// Injects the coordinator-backed gate. Called once during bootstrap.
    pub fn set_gate(&self, gate: Arc<dyn TtsGate>) {
        *self.gate.write() = Some(gate);
    }

    /// Ensures the media directory exists and is readable by the PBX.
    pub async fn ensure_media_dir(&self) -> ParlanceResult<()> {
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|e| {
                ParlanceError::Playback(format!(
                    "cannot create media dir {}: {}",
                    self.media_dir.display(),
                    e
                ))
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.media_dir,
                std::fs::Permissions::from_mode(0o755),
            );
        }
        Ok(())
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

    /// Plays `audio_bytes` (µ-law 8 kHz) to the caller.
    ///
    /// Returns the deterministic playback id
    /// (`<type>:<call_id>:<ms>`) on success.
    pub async fn play_audio(
        &self,
        call_id: &str,
        audio_bytes: &[u8],
        playback_type: &str,
    ) -> ParlanceResult<String> {
        let session = self
            .store
            .get_by_call_id(call_id)
            .ok_or_else(|| ParlanceError::CallNotFound(call_id.to_string()))?;

        let playback_id = format!("{}:{}:{}", playback_type, call_id, now_ms());
        let file_path = self.audio_file_path(&playback_id);

        self.write_audio_file(&file_path, audio_bytes).await?;

        // Gate before play: the PBX starts rendering as soon as the
        // command lands.
        if !self.gate_start(call_id, &playback_id).await {
            let _ = tokio::fs::remove_file(&file_path).await;
            return Err(ParlanceError::Playback(format!(
                "gating failed for call {}",
                call_id
            )));
        }

        let media_uri = self.media_uri(&file_path);
        let target = session.bridge_id.as_deref();
        let play_result = match target {
            Some(bridge_id) => {
                self.ari
                    .play_on_bridge(bridge_id, &media_uri, &playback_id)
                    .await
            }
            None => {
                self.ari
                    .play_on_channel(&session.caller_channel_id, &media_uri, &playback_id)
                    .await
            }
        };

        if let Err(e) = play_result {
            self.gate_end(call_id, &playback_id, "play-failed").await;
            let _ = tokio::fs::remove_file(&file_path).await;
            return Err(ParlanceError::Playback(format!(
                "play failed for {}: {}",
                playback_id, e
            )));
        }

        self.store.add_playback(PlaybackRef {
            playback_id: playback_id.clone(),
            call_id: call_id.to_string(),
            channel_id: session.caller_channel_id.clone(),
            bridge_id: session.bridge_id.clone(),
            media_uri,
            audio_file: Some(file_path),
            created_at_ms: now_ms(),
        });

        log::info!(
            "[Playback] Started {} ({} bytes) for call {}",
            playback_id,
            audio_bytes.len(),
            call_id
        );
        Ok(playback_id)
    }

    /// Handles `PlaybackFinished` from the PBX.
    ///
    /// Unknown ids are ignored: either the playback was not ours or the
    /// event was delivered twice, and gating clears are idempotent anyway.
    pub async fn on_playback_finished(&self, playback_id: &str) -> bool {
        let Some(playback) = self.store.pop_playback(playback_id) else {
            log::debug!(
                "[Playback] PlaybackFinished for unknown id {}",
                playback_id
            );
            return false;
        };

        self.gate_end(&playback.call_id, playback_id, "playback-finished")
            .await;

        if let Some(file) = &playback.audio_file {
            if let Err(e) = tokio::fs::remove_file(file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "[Playback] Could not remove {}: {}",
                        file.display(),
                        e
                    );
                }
            }
        }

        log::info!(
            "[Playback] Finished {} for call {}",
            playback_id,
            playback.call_id
        );
        true
    }

    /// Drops all playbacks owned by a call and deletes their files.
    /// Used by session teardown.
    pub async fn cleanup_for_call(&self, call_id: &str) {
        for playback in self.store.remove_playbacks_for_call(call_id) {
            if let Some(file) = &playback.audio_file {
                let _ = tokio::fs::remove_file(file).await;
            }
        }
    }

    fn audio_file_path(&self, playback_id: &str) -> PathBuf {
        let filename = format!("audio-{}.ulaw", playback_id.replace(':', "-"));
        self.media_dir.join(filename)
    }

    /// `sound:` URI for a media file: directory prefix plus the file stem
    /// (Asterisk appends the extension itself).
    fn media_uri(&self, file_path: &Path) -> String {
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("sound:{}/{}", self.sound_prefix, stem)
    }

    async fn write_audio_file(&self, path: &Path, audio: &[u8]) -> ParlanceResult<()> {
        tokio::fs::write(path, audio).await.map_err(|e| {
            ParlanceError::Playback(format!("cannot write {}: {}", path.display(), e))
        })?;
        // The PBX runs as a different user; the file must be world-readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
        }
        log::debug!("[Playback] Wrote {} ({} bytes)", path.display(), audio.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AsteriskConfig;
    use crate::session::CallSession;

    fn manager(dir: &Path) -> PlaybackManager {
        let store = Arc::new(SessionStore::new());
        store.upsert(CallSession::new("c1", "default"));
        let ari = Arc::new(AriClient::new(&AsteriskConfig::default()));
        PlaybackManager::new(store, ari, dir.to_path_buf())
    }

    #[test]
    fn playback_ids_are_deterministic_in_shape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let path = manager.audio_file_path("greeting:c1:1700000000000");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("audio-greeting-c1-"));
        assert!(path.extension().is_some_and(|e| e == "ulaw"));
    }

    #[test]
    fn media_uri_uses_directory_prefix_and_stem() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("parlance");
        let manager = manager(&media);
        let uri = manager.media_uri(&media.join("audio-response-c1-17.ulaw"));
        assert_eq!(uri, "sound:parlance/audio-response-c1-17");
    }

    #[tokio::test]
    async fn finished_event_for_unknown_playback_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(!manager.on_playback_finished("response:ghost:1").await);
    }

    #[tokio::test]
    async fn write_audio_file_creates_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.ensure_media_dir().await.unwrap();

        let path = manager.audio_file_path("response:c1:42");
        manager.write_audio_file(&path, &[1, 2, 3]).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }
}
