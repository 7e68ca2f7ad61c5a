//! Persistent ARI event stream over WebSocket.
//!
//! Maintains a long-lived subscription to `/ari/events`, reconnecting with
//! bounded exponential backoff and deduplicating events redelivered across
//! reconnects. Parsed events are forwarded over an mpsc channel; the engine
//! never sees the socket.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::events::AriEvent;
use crate::config::AsteriskConfig;

/// Initial reconnect delay.
const BACKOFF_INITIAL_MS: u64 = 500;
/// Reconnect delay ceiling.
const BACKOFF_MAX_MS: u64 = 30_000;
/// How many dedup keys to remember across reconnects.
const DEDUP_WINDOW: usize = 256;

/// Long-lived ARI event subscription.
pub struct AriEventStream {
    url: String,
    tx: mpsc::Sender<AriEvent>,
    cancel: CancellationToken,
}

impl AriEventStream {
    /// Spawns the event pump. Events arrive on the returned receiver until
    /// the token is cancelled.
    pub fn spawn(
        config: &AsteriskConfig,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<AriEvent>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let stream = Self {
            url: config.events_url(),
            tx,
            cancel,
        };
        let handle = tokio::spawn(stream.run());
        (rx, handle)
    }

    async fn run(self) {
        let mut backoff_ms = BACKOFF_INITIAL_MS;
        let mut seen: VecDeque<String> = VecDeque::with_capacity(DEDUP_WINDOW);
        let mut seen_set: HashSet<String> = HashSet::with_capacity(DEDUP_WINDOW);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("[ARI] Event stream connected");
                    backoff_ms = BACKOFF_INITIAL_MS;
                    self.pump(ws, &mut seen, &mut seen_set).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    log::warn!("[ARI] Event stream disconnected, reconnecting");
                }
                Err(e) => {
                    log::warn!(
                        "[ARI] Event stream connect failed: {} (retry in {}ms)",
                        e,
                        backoff_ms
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
        }

        log::info!("[ARI] Event stream stopped");
    }

    async fn pump<S>(
        &self,
        mut ws: tokio_tungstenite::WebSocketStream<S>,
        seen: &mut VecDeque<String>,
        seen_set: &mut HashSet<String>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return;
                }
                msg = ws.next() => {
                    let Some(msg) = msg else { return };
                    match msg {
                        Ok(Message::Text(text)) => {
                            self.handle_text(&text, seen, seen_set).await;
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => return,
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("[ARI] Event stream read error: {}", e);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        seen: &mut VecDeque<String>,
        seen_set: &mut HashSet<String>,
    ) {
        let event: AriEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("[ARI] Unparseable event ignored: {}", e);
                return;
            }
        };

        if matches!(event, AriEvent::Unknown) {
            return;
        }

        if let Some(key) = event.dedup_key() {
            if seen_set.contains(&key) {
                log::debug!("[ARI] Duplicate event suppressed: {}", key);
                return;
            }
            if seen.len() == DEDUP_WINDOW {
                if let Some(old) = seen.pop_front() {
                    seen_set.remove(&old);
                }
            }
            seen.push_back(key.clone());
            seen_set.insert(key);
        }

        if self.tx.send(event).await.is_err() {
            log::warn!("[ARI] Event receiver dropped");
        }
    }
}
