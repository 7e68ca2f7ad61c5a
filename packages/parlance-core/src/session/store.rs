//! Session storage with indexed lookups and atomic gating.
//!
//! Sessions live in a primary map keyed by canonical call id; a secondary
//! index maps every channel id a session knows about back to that call id,
//! so lookups by any identifier return the same session. Composite
//! read-modify-write operations (gating, history, counters) run under the
//! per-entry exclusive lock of the primary map.

use dashmap::DashMap;

use super::types::{
    now_ms, CallSession, ConversationRole, ConversationState, HistoryEntry, PlaybackRef,
};

/// Aggregate counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub active_calls: usize,
    pub active_playbacks: usize,
}

/// Per-frame view of a session's gating state.
#[derive(Debug, Clone, Copy)]
pub struct GatingSnapshot {
    pub audio_capture_enabled: bool,
    pub tts_playing: bool,
    /// True once after each gating activation; the pump resets its VAD.
    pub vad_reset: bool,
}

/// Thread-safe store for call sessions and playback references.
///
/// Enforces the gating invariants: `tts_playing` is true exactly while the
/// token set is non-empty, and `audio_capture_enabled` is its inverse.
/// Token add/remove are idempotent.
pub struct SessionStore {
    /// Primary: call_id -> session.
    sessions: DashMap<String, CallSession>,
    /// Secondary: any channel_id -> call_id.
    channel_index: DashMap<String, String>,
    /// Active playbacks by playback_id.
    playbacks: DashMap<String, PlaybackRef>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            channel_index: DashMap::new(),
            playbacks: DashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds or replaces a session and refreshes its channel-id aliases.
    pub fn upsert(&self, session: CallSession) {
        for id in session.channel_ids() {
            self.channel_index
                .insert(id.to_string(), session.call_id.clone());
        }
        log::debug!(
            "[SessionStore] Upserted call {} (channels: {:?})",
            session.call_id,
            session.channel_ids()
        );
        self.sessions.insert(session.call_id.clone(), session);
    }

    /// Gets a session snapshot by canonical call id.
    pub fn get_by_call_id(&self, call_id: &str) -> Option<CallSession> {
        self.sessions.get(call_id).map(|r| r.value().clone())
    }

    /// Gets a session snapshot by any channel id it is known by.
    pub fn get_by_any_channel_id(&self, channel_id: &str) -> Option<CallSession> {
        let call_id = self.channel_index.get(channel_id)?.value().clone();
        self.get_by_call_id(&call_id)
    }

    /// Resolves any channel id to the canonical call id.
    pub fn resolve_call_id(&self, channel_id: &str) -> Option<String> {
        self.channel_index.get(channel_id).map(|r| r.value().clone())
    }

    /// Removes a session and every channel-id alias pointing at it.
    pub fn remove(&self, call_id: &str) -> Option<CallSession> {
        let (_, session) = self.sessions.remove(call_id)?;
        for id in session.channel_ids() {
            // Only drop aliases that still point at this call.
            self.channel_index
                .remove_if(id, |_, owner| owner == call_id);
        }
        log::debug!("[SessionStore] Removed call {}", call_id);
        Some(session)
    }

    /// Applies a mutation to a session under its exclusive lock.
    ///
    /// Returns false when the call is unknown.
    pub fn with_session_mut<F>(&self, call_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CallSession),
    {
        match self.sessions.get_mut(call_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                entry.last_activity_ms = now_ms();
                true
            }
            None => false,
        }
    }

    /// Updates the mirrored conversation state.
    pub fn set_conversation_state(&self, call_id: &str, state: ConversationState) -> bool {
        self.with_session_mut(call_id, |s| s.conversation_state = state)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // TTS gating
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds a TTS gating token: disables audio capture and flags a VAD
    /// reset. Idempotent per token. Returns false for unknown calls.
    pub fn set_gating_token(&self, call_id: &str, token: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(call_id) else {
            log::warn!(
                "[SessionStore] Cannot set gating token {} - call {} not found",
                token,
                call_id
            );
            return false;
        };

        session.tts_tokens.insert(token.to_string());
        session.tts_playing = true;
        session.audio_capture_enabled = false;
        session.vad_reset_pending = true;
        session.last_activity_ms = now_ms();

        log::info!(
            "[SessionStore] Capture gated for {} (token {}, refcount {})",
            call_id,
            token,
            session.tts_refcount()
        );
        true
    }

    /// Removes a TTS gating token; capture re-opens when the last token
    /// clears. Idempotent per token. Returns false for unknown calls.
    pub fn clear_gating_token(&self, call_id: &str, token: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(call_id) else {
            log::warn!(
                "[SessionStore] Cannot clear gating token {} - call {} not found",
                token,
                call_id
            );
            return false;
        };

        session.tts_tokens.remove(token);
        if session.tts_tokens.is_empty() {
            session.tts_playing = false;
            session.audio_capture_enabled = true;
        }
        session.last_activity_ms = now_ms();

        log::info!(
            "[SessionStore] Gating token {} cleared for {} (refcount {}, capture {})",
            token,
            call_id,
            session.tts_refcount(),
            session.audio_capture_enabled
        );
        true
    }

    /// Drops every gating token for a call (barge-in path). Returns how
    /// many tokens were cleared.
    pub fn clear_all_gating_tokens(&self, call_id: &str) -> usize {
        let Some(mut session) = self.sessions.get_mut(call_id) else {
            return 0;
        };
        let cleared = session.tts_tokens.len();
        session.tts_tokens.clear();
        session.tts_playing = false;
        session.audio_capture_enabled = true;
        session.last_activity_ms = now_ms();
        if cleared > 0 {
            log::info!(
                "[SessionStore] Cleared all {} gating tokens for {}",
                cleared,
                call_id
            );
        }
        cleared
    }

    /// Consumes the pending VAD-reset flag, returning whether it was set.
    pub fn take_vad_reset(&self, call_id: &str) -> bool {
        match self.sessions.get_mut(call_id) {
            Some(mut session) => std::mem::take(&mut session.vad_reset_pending),
            None => false,
        }
    }

    /// One-lock read of the gating flags the inbound pump consults per
    /// frame. Consumes the pending VAD-reset flag.
    pub fn gating_snapshot(&self, call_id: &str) -> Option<GatingSnapshot> {
        let mut session = self.sessions.get_mut(call_id)?;
        Some(GatingSnapshot {
            audio_capture_enabled: session.audio_capture_enabled,
            tts_playing: session.tts_playing,
            vad_reset: std::mem::take(&mut session.vad_reset_pending),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversation history
    // ─────────────────────────────────────────────────────────────────────────

    /// Appends a history entry, trimming the oldest user/assistant pair
    /// when the cap is exceeded. The system message at index 0 survives.
    pub fn push_history(
        &self,
        call_id: &str,
        role: ConversationRole,
        content: impl Into<String>,
        max_context: usize,
    ) -> bool {
        self.with_session_mut(call_id, |session| {
            session.history.push(HistoryEntry {
                role,
                content: content.into(),
                timestamp_ms: now_ms(),
            });

            if session.history.len() > max_context {
                let first_trimmable = usize::from(
                    session
                        .history
                        .first()
                        .is_some_and(|e| e.role == ConversationRole::System),
                );
                let over = session.history.len() - max_context;
                // Trim whole user/assistant pairs.
                let to_remove = (over + 1) & !1;
                let end = (first_trimmable + to_remove).min(session.history.len());
                session.history.drain(first_trimmable..end);
            }
        })
    }

    /// Snapshot of the history for adapter context.
    pub fn history(&self, call_id: &str) -> Vec<HistoryEntry> {
        self.sessions
            .get(call_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playback references
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_playback(&self, playback: PlaybackRef) {
        log::debug!(
            "[SessionStore] Playback {} added for call {}",
            playback.playback_id,
            playback.call_id
        );
        self.playbacks
            .insert(playback.playback_id.clone(), playback);
    }

    /// Removes and returns a playback reference.
    pub fn pop_playback(&self, playback_id: &str) -> Option<PlaybackRef> {
        self.playbacks.remove(playback_id).map(|(_, p)| p)
    }

    pub fn get_playback(&self, playback_id: &str) -> Option<PlaybackRef> {
        self.playbacks.get(playback_id).map(|r| r.value().clone())
    }

    /// Drops all playback references owned by a call, returning them for
    /// file cleanup.
    pub fn remove_playbacks_for_call(&self, call_id: &str) -> Vec<PlaybackRef> {
        let ids: Vec<String> = self
            .playbacks
            .iter()
            .filter(|r| r.value().call_id == call_id)
            .map(|r| r.key().clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pop_playback(&id))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes sessions older than `max_age_secs`. Returns the removed
    /// call ids so the caller can finish resource teardown.
    pub fn cleanup_expired_sessions(&self, max_age_secs: u64) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(max_age_secs * 1000);
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|r| r.value().created_at_ms < cutoff)
            .map(|r| r.key().clone())
            .collect();

        for call_id in &expired {
            self.remove(call_id);
        }
        if !expired.is_empty() {
            log::info!(
                "[SessionStore] Cleaned up {} expired session(s)",
                expired.len()
            );
        }
        expired
    }

    pub fn list_call_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            active_calls: self.sessions.len(),
            active_playbacks: self.playbacks.len(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_call(call_id: &str) -> SessionStore {
        let store = SessionStore::new();
        store.upsert(CallSession::new(call_id, "default"));
        store
    }

    #[test]
    fn upsert_and_lookup_by_any_channel_id() {
        let store = SessionStore::new();
        let mut session = CallSession::new("caller-1", "default");
        session.local_channel_id = Some("local-1".to_string());
        session.external_media_channel_id = Some("media-1".to_string());
        store.upsert(session);

        for id in ["caller-1", "local-1", "media-1"] {
            let found = store.get_by_any_channel_id(id).expect(id);
            assert_eq!(found.call_id, "caller-1");
        }
    }

    #[test]
    fn remove_drops_all_aliases() {
        let store = SessionStore::new();
        let mut session = CallSession::new("caller-1", "default");
        session.external_media_channel_id = Some("media-1".to_string());
        store.upsert(session);

        assert!(store.remove("caller-1").is_some());
        assert!(store.get_by_any_channel_id("caller-1").is_none());
        assert!(store.get_by_any_channel_id("media-1").is_none());
    }

    #[test]
    fn gating_token_disables_capture() {
        let store = store_with_call("c1");

        assert!(store.set_gating_token("c1", "response:c1:1"));
        let s = store.get_by_call_id("c1").unwrap();
        assert!(s.tts_playing);
        assert!(!s.audio_capture_enabled);
        assert_eq!(s.tts_refcount(), 1);
    }

    #[test]
    fn capture_reopens_only_after_last_token_clears() {
        let store = store_with_call("c1");

        store.set_gating_token("c1", "t1");
        store.set_gating_token("c1", "t2");

        store.clear_gating_token("c1", "t1");
        let s = store.get_by_call_id("c1").unwrap();
        assert!(s.tts_playing, "one token still active");
        assert!(!s.audio_capture_enabled);

        store.clear_gating_token("c1", "t2");
        let s = store.get_by_call_id("c1").unwrap();
        assert!(!s.tts_playing);
        assert!(s.audio_capture_enabled);
        assert_eq!(s.tts_refcount(), 0);
    }

    #[test]
    fn double_set_and_double_clear_are_idempotent() {
        let store = store_with_call("c1");

        store.set_gating_token("c1", "t1");
        store.set_gating_token("c1", "t1");
        assert_eq!(store.get_by_call_id("c1").unwrap().tts_refcount(), 1);

        store.clear_gating_token("c1", "t1");
        store.clear_gating_token("c1", "t1");
        let s = store.get_by_call_id("c1").unwrap();
        assert_eq!(s.tts_refcount(), 0);
        assert!(s.audio_capture_enabled);
    }

    #[test]
    fn set_followed_by_clear_restores_pre_call_state() {
        let store = store_with_call("c1");
        let before = store.get_by_call_id("c1").unwrap();

        store.set_gating_token("c1", "t1");
        store.clear_gating_token("c1", "t1");

        let after = store.get_by_call_id("c1").unwrap();
        assert_eq!(before.tts_refcount(), after.tts_refcount());
        assert_eq!(before.tts_playing, after.tts_playing);
        assert_eq!(before.audio_capture_enabled, after.audio_capture_enabled);
    }

    #[test]
    fn gating_on_missing_call_fails_without_panicking() {
        let store = SessionStore::new();
        assert!(!store.set_gating_token("ghost", "t1"));
        assert!(!store.clear_gating_token("ghost", "t1"));
        assert_eq!(store.clear_all_gating_tokens("ghost"), 0);
    }

    #[test]
    fn clear_all_tokens_reopens_capture() {
        let store = store_with_call("c1");
        store.set_gating_token("c1", "t1");
        store.set_gating_token("c1", "t2");

        assert_eq!(store.clear_all_gating_tokens("c1"), 2);
        let s = store.get_by_call_id("c1").unwrap();
        assert!(s.audio_capture_enabled);
        assert!(!s.tts_playing);
    }

    #[test]
    fn gating_snapshot_reflects_state_and_consumes_reset() {
        let store = store_with_call("c1");

        let snap = store.gating_snapshot("c1").unwrap();
        assert!(snap.audio_capture_enabled);
        assert!(!snap.tts_playing);
        assert!(!snap.vad_reset);

        store.set_gating_token("c1", "t1");
        let snap = store.gating_snapshot("c1").unwrap();
        assert!(!snap.audio_capture_enabled);
        assert!(snap.tts_playing);
        assert!(snap.vad_reset);

        // The reset flag is one-shot.
        let snap = store.gating_snapshot("c1").unwrap();
        assert!(!snap.vad_reset);

        assert!(store.gating_snapshot("ghost").is_none());
    }

    #[test]
    fn gating_activation_flags_a_vad_reset() {
        let store = store_with_call("c1");
        assert!(!store.take_vad_reset("c1"));

        store.set_gating_token("c1", "t1");
        assert!(store.take_vad_reset("c1"));
        assert!(!store.take_vad_reset("c1"), "flag is consumed");
    }

    #[test]
    fn history_trims_oldest_pair_preserving_system_message() {
        let store = store_with_call("c1");
        let max = 5;

        store.push_history("c1", ConversationRole::System, "system", max);
        store.push_history("c1", ConversationRole::User, "u1", max);
        store.push_history("c1", ConversationRole::Assistant, "a1", max);
        store.push_history("c1", ConversationRole::User, "u2", max);
        store.push_history("c1", ConversationRole::Assistant, "a2", max);

        // Exactly at the cap: nothing is trimmed.
        assert_eq!(store.history("c1").len(), 5);

        store.push_history("c1", ConversationRole::User, "u3", max);
        let history = store.history("c1");
        assert_eq!(history.len(), 4, "one full pair trimmed");
        assert_eq!(history[0].role, ConversationRole::System);
        assert_eq!(history[1].content, "u2");
        assert_eq!(history[3].content, "u3");
    }

    #[test]
    fn playback_pop_is_single_shot() {
        let store = store_with_call("c1");
        store.add_playback(PlaybackRef {
            playback_id: "response:c1:1".to_string(),
            call_id: "c1".to_string(),
            channel_id: "c1".to_string(),
            bridge_id: None,
            media_uri: "sound:parlance/x".to_string(),
            audio_file: None,
            created_at_ms: 0,
        });

        assert!(store.pop_playback("response:c1:1").is_some());
        assert!(store.pop_playback("response:c1:1").is_none());
    }

    #[test]
    fn remove_playbacks_for_call_collects_only_that_call() {
        let store = store_with_call("c1");
        for (pb, call) in [("p1", "c1"), ("p2", "c1"), ("p3", "c2")] {
            store.add_playback(PlaybackRef {
                playback_id: pb.to_string(),
                call_id: call.to_string(),
                channel_id: call.to_string(),
                bridge_id: None,
                media_uri: String::new(),
                audio_file: None,
                created_at_ms: 0,
            });
        }

        let removed = store.remove_playbacks_for_call("c1");
        assert_eq!(removed.len(), 2);
        assert!(store.get_playback("p3").is_some());
    }

    #[test]
    fn cleanup_expired_sessions_removes_old_calls() {
        let store = SessionStore::new();
        let mut old = CallSession::new("old", "default");
        old.created_at_ms = 0;
        store.upsert(old);
        store.upsert(CallSession::new("fresh", "default"));

        let removed = store.cleanup_expired_sessions(3600);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.get_by_call_id("fresh").is_some());
    }
}
