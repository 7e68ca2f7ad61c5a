//! ARI REST commands.
//!
//! This module handles raw HTTP transport and status mapping. Retry of
//! transient failures lives in `retry.rs`; the engine decides what a
//! persistent failure means for the call.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::events::{Bridge, Channel};
use super::retry::with_retry;
use crate::config::AsteriskConfig;

/// Request timeout for individual ARI commands.
const ARI_TIMEOUT_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from ARI control-plane operations.
#[derive(Debug, Error)]
pub enum AriError {
    /// HTTP request to Asterisk failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Asterisk returned a non-success status.
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// The referenced resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The event WebSocket failed.
    #[error("Event stream failed: {0}")]
    WebSocket(String),

    /// Asterisk sent something we could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Convenient Result alias for ARI operations.
pub type AriResult<T> = Result<T, AriError>;

impl AriError {
    /// Returns true if the operation should be retried.
    ///
    /// Server errors and rate limiting are transient; 4xx responses other
    /// than 429 reflect requests that will not succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            AriError::Http(e) => e.is_timeout() || e.is_connect(),
            AriError::HttpStatus(status, _) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Client for ARI request/response commands.
///
/// Shared by all calls; requests are independent and safe to issue
/// concurrently. Event consumption lives in [`super::AriEventStream`].
pub struct AriClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    app_name: String,
}

impl AriClient {
    pub fn new(config: &AsteriskConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(ARI_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            app_name: config.app_name.clone(),
        }
    }

    /// Stasis application name this client registers commands under.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> AriResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }

        log::debug!("[ARI] {} {}", method, path);
        let res = req.send().await?;
        let status = res.status();

        if status == StatusCode::NOT_FOUND {
            return Err(AriError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(AriError::HttpStatus(status.as_u16(), text));
        }

        if std::mem::size_of::<T>() == 0 || status == StatusCode::NO_CONTENT {
            // Commands with empty bodies deserialize to unit.
            return serde_json::from_str("null")
                .map_err(|e| AriError::Protocol(format!("empty response: {}", e)));
        }

        let text = res.text().await?;
        if text.is_empty() {
            return serde_json::from_str("null")
                .map_err(|e| AriError::Protocol(format!("empty response: {}", e)));
        }
        serde_json::from_str(&text).map_err(|e| AriError::Protocol(format!("{}: {}", e, text)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Verifies the control plane is reachable and credentials work.
    pub async fn get_info(&self) -> AriResult<serde_json::Value> {
        with_retry("get_info", || {
            self.request(Method::GET, "/asterisk/info", &[], None)
        })
        .await
    }

    /// Answers a channel. Answering an already-answered channel succeeds.
    pub async fn answer(&self, channel_id: &str) -> AriResult<()> {
        let path = format!("/channels/{}/answer", channel_id);
        with_retry("answer", || {
            self.request::<()>(Method::POST, &path, &[], None)
        })
        .await
    }

    /// Hangs up a channel. A missing channel counts as success: the call
    /// is already gone, which is the state we wanted.
    pub async fn hangup(&self, channel_id: &str) -> AriResult<()> {
        let path = format!("/channels/{}", channel_id);
        let result = with_retry("hangup", || {
            self.request::<()>(Method::DELETE, &path, &[], None)
        })
        .await;
        match result {
            Err(AriError::NotFound(_)) => {
                log::debug!("[ARI] Hangup for missing channel {}", channel_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Starts a playback on a bridge with a caller-chosen playback id.
    pub async fn play_on_bridge(
        &self,
        bridge_id: &str,
        media_uri: &str,
        playback_id: &str,
    ) -> AriResult<()> {
        let path = format!("/bridges/{}/play", bridge_id);
        let body = serde_json::json!({ "media": media_uri, "playbackId": playback_id });
        with_retry("play_on_bridge", || {
            self.request::<serde_json::Value>(Method::POST, &path, &[], Some(body.clone()))
        })
        .await
        .map(|_| ())
    }

    /// Starts a playback directly on a channel.
    pub async fn play_on_channel(
        &self,
        channel_id: &str,
        media_uri: &str,
        playback_id: &str,
    ) -> AriResult<()> {
        let path = format!("/channels/{}/play", channel_id);
        let body = serde_json::json!({ "media": media_uri, "playbackId": playback_id });
        with_retry("play_on_channel", || {
            self.request::<serde_json::Value>(Method::POST, &path, &[], Some(body.clone()))
        })
        .await
        .map(|_| ())
    }

    /// Stops a playback we started. A missing playback counts as success;
    /// it already finished.
    pub async fn stop_playback(&self, playback_id: &str) -> AriResult<()> {
        let path = format!("/playbacks/{}", playback_id);
        let result = with_retry("stop_playback", || {
            self.request::<()>(Method::DELETE, &path, &[], None)
        })
        .await;
        match result {
            Err(AriError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Creates a mixing bridge.
    pub async fn create_bridge(&self) -> AriResult<Bridge> {
        with_retry("create_bridge", || {
            self.request(
                Method::POST,
                "/bridges",
                &[("type", "mixing")],
                None,
            )
        })
        .await
    }

    /// Adds a channel to a bridge.
    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> AriResult<()> {
        let path = format!("/bridges/{}/addChannel", bridge_id);
        with_retry("add_channel_to_bridge", || async {
            self.request::<()>(Method::POST, &path, &[("channel", channel_id)], None)
                .await
        })
        .await
    }

    /// Destroys a bridge. A missing bridge counts as success.
    pub async fn destroy_bridge(&self, bridge_id: &str) -> AriResult<()> {
        let path = format!("/bridges/{}", bridge_id);
        let result = with_retry("destroy_bridge", || {
            self.request::<()>(Method::DELETE, &path, &[], None)
        })
        .await;
        match result {
            Err(AriError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Creates an external-media channel emitting RTP to `external_host`.
    ///
    /// The returned channel's vars expose the port Asterisk listens on
    /// (`UNICASTRTP_LOCAL_PORT`).
    pub async fn create_external_media(
        &self,
        external_host: &str,
        format: &str,
    ) -> AriResult<Channel> {
        with_retry("create_external_media", || async {
            self.request(
                Method::POST,
                "/channels/externalMedia",
                &[
                    ("app", self.app_name.as_str()),
                    ("external_host", external_host),
                    ("format", format),
                ],
                None,
            )
            .await
        })
        .await
    }

    /// Originates a channel that dials our AudioSocket server, carrying
    /// the correlation UUID in the dial string.
    pub async fn originate_audiosocket(
        &self,
        endpoint_host_port: &str,
        correlation_uuid: &str,
    ) -> AriResult<Channel> {
        let endpoint = format!("AudioSocket/{}/{}", endpoint_host_port, correlation_uuid);
        with_retry("originate_audiosocket", || async {
            self.request(
                Method::POST,
                "/channels",
                &[
                    ("endpoint", endpoint.as_str()),
                    ("app", self.app_name.as_str()),
                ],
                None,
            )
            .await
        })
        .await
    }

    /// Starts a read-only snoop on a channel's inbound audio.
    pub async fn snoop(&self, channel_id: &str) -> AriResult<Channel> {
        let path = format!("/channels/{}/snoop", channel_id);
        with_retry("snoop", || async {
            self.request(
                Method::POST,
                &path,
                &[("app", self.app_name.as_str()), ("spy", "in")],
                None,
            )
            .await
        })
        .await
    }

    /// Lists all bridges known to Asterisk.
    pub async fn list_bridges(&self) -> AriResult<Vec<Bridge>> {
        with_retry("list_bridges", || {
            self.request(Method::GET, "/bridges", &[], None)
        })
        .await
    }

    /// Lists all channels known to Asterisk.
    pub async fn list_channels(&self) -> AriResult<Vec<Channel>> {
        with_retry("list_channels", || {
            self.request(Method::GET, "/channels", &[], None)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        assert!(AriError::HttpStatus(503, String::new()).is_transient());
        assert!(AriError::HttpStatus(429, String::new()).is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!AriError::HttpStatus(400, String::new()).is_transient());
        assert!(!AriError::NotFound("/channels/x".to_string()).is_transient());
        assert!(!AriError::Protocol("bad json".to_string()).is_transient());
    }

    #[tokio::test]
    async fn snoop_posts_app_and_spy_and_parses_the_channel() {
        use axum::extract::{Path, RawQuery, State};
        use axum::routing::post;
        use std::sync::Arc;

        // Captures the path parameter and query string the client sent.
        type Seen = Arc<parking_lot::Mutex<Option<(String, String)>>>;
        let seen: Seen = Seen::default();

        let app = axum::Router::new()
            .route(
                "/ari/channels/{id}/snoop",
                post(
                    |Path(id): Path<String>,
                     RawQuery(query): RawQuery,
                     State(seen): State<Seen>| async move {
                        *seen.lock() = Some((id, query.unwrap_or_default()));
                        axum::Json(serde_json::json!({
                            "id": "snoop-chan-1",
                            "name": "Snoop/chan-7-00000001",
                            "state": "Up"
                        }))
                    },
                ),
            )
            .with_state(Arc::clone(&seen));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AriClient::new(&AsteriskConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "agent".to_string(),
            password: "secret".to_string(),
            app_name: "parlance".to_string(),
        });

        let channel = client.snoop("chan-7").await.unwrap();
        assert_eq!(channel.id, "snoop-chan-1");
        assert!(channel.name.starts_with("Snoop/"));

        let (id, query) = seen.lock().clone().expect("server saw the request");
        assert_eq!(id, "chan-7");
        assert!(query.contains("app=parlance"));
        assert!(query.contains("spy=in"));
    }
}
